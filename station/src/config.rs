//! Station Configuration
//!
//! File configuration of the simulated TDD station, read from YAML (or TOML
//! when the file ends in `.toml`). Every section has defaults so a partial
//! file is enough.

use common::types::{ConnectionId, Dbm, StationId, StationRole};
use layers::frame::{standard_timeline, FrameParameters};
use layers::mac::{
    DeadStationConfig, GroupingConfig, InterferenceCacheConfig, MacConfig, PowerProfiles, PriorityClasses,
    QueueConfig, SubStrategyKind, DEFAULT_PACKET_BITS,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete station configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StationConfig {
    /// Base station identity
    #[serde(default)]
    pub station: StationSection,
    /// Frame timing and grid
    #[serde(default)]
    pub frame: FrameConfig,
    /// Resource scheduler
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Per-connection queues
    #[serde(default)]
    pub queue: QueueConfig,
    /// Power capabilities per station class
    #[serde(default)]
    pub power: PowerProfiles,
    /// Fixed transmit power of individual connections
    #[serde(default)]
    pub power_overrides: Vec<PowerOverride>,
    /// Interference cache smoothing
    #[serde(default)]
    pub interference: InterferenceCacheConfig,
    /// Dead station detection
    #[serde(default)]
    pub dead_station: DeadStationConfig,
    /// Simulated subscriber stations and their traffic
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Transmit power pinned for one connection, clamped to its class maximum
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PowerOverride {
    pub cid: u32,
    pub dbm: f64,
}

/// Identity of the simulated base station
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StationSection {
    #[serde(default = "default_station_id")]
    pub id: u32,
}

impl Default for StationSection {
    fn default() -> Self {
        Self { id: default_station_id() }
    }
}

fn default_station_id() -> u32 {
    1
}

/// Frame parameters, durations in microseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FrameConfig {
    pub frame_duration_us: u64,
    pub symbol_duration_us: u64,
    pub sub_channels: u16,
    pub data_subcarriers: u16,
    pub ttg_us: u64,
    pub rtg_us: u64,
    pub frame_head_symbols: u32,
    pub dl_map_symbols: u32,
    pub ul_map_symbols: u32,
    pub dl_data_symbols: u32,
    pub ul_data_symbols: u32,
    pub bw_request_symbols: u32,
    pub ranging_symbols: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        let params = FrameParameters::default();
        Self {
            frame_duration_us: params.frame_duration.as_micros() as u64,
            symbol_duration_us: params.symbol_duration.as_micros() as u64,
            sub_channels: params.sub_channels,
            data_subcarriers: params.data_subcarriers,
            ttg_us: params.ttg.as_micros() as u64,
            rtg_us: params.rtg.as_micros() as u64,
            frame_head_symbols: params.frame_head_symbols,
            dl_map_symbols: params.dl_map_symbols,
            ul_map_symbols: params.ul_map_symbols,
            dl_data_symbols: params.dl_data_symbols,
            ul_data_symbols: params.ul_data_symbols,
            bw_request_symbols: params.bw_request_symbols,
            ranging_symbols: params.ranging_symbols,
        }
    }
}

impl FrameConfig {
    /// Engine frame parameters
    pub fn parameters(&self) -> FrameParameters {
        FrameParameters {
            frame_duration: Duration::from_micros(self.frame_duration_us),
            symbol_duration: Duration::from_micros(self.symbol_duration_us),
            sub_channels: self.sub_channels,
            data_subcarriers: self.data_subcarriers,
            ttg: Duration::from_micros(self.ttg_us),
            rtg: Duration::from_micros(self.rtg_us),
            frame_head_symbols: self.frame_head_symbols,
            dl_map_symbols: self.dl_map_symbols,
            ul_map_symbols: self.ul_map_symbols,
            dl_data_symbols: self.dl_data_symbols,
            ul_data_symbols: self.ul_data_symbols,
            bw_request_symbols: self.bw_request_symbols,
            ranging_symbols: self.ranging_symbols,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub sub_strategy: SubStrategyKind,
    pub random_dsa_start: bool,
    pub beamforming: bool,
    pub max_beams: u8,
    pub friendliness_dbm: f64,
    /// Priority classes, most urgent first
    pub priority: PriorityClasses,
    /// Packet size assumed behind a bandwidth request
    pub bandwidth_request_packet_bits: u64,
    pub pdu_overhead_bits: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let grouping = GroupingConfig::default();
        Self {
            sub_strategy: SubStrategyKind::default(),
            random_dsa_start: false,
            beamforming: grouping.beamforming,
            max_beams: grouping.max_beams,
            friendliness_dbm: grouping.friendliness.0,
            priority: PriorityClasses::default(),
            bandwidth_request_packet_bits: DEFAULT_PACKET_BITS,
            pdu_overhead_bits: 48,
        }
    }
}

/// Simulated subscriber stations and offered load
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of subscriber stations
    pub subscribers: u32,
    /// Frames to run, 0 runs until Ctrl-C
    pub frames: u64,
    pub seed: u64,
    /// Tick frames at the frame duration instead of as fast as possible
    pub realtime: bool,
    /// Chance that a downlink connection is offered an SDU in a frame
    pub downlink_sdus_per_frame: f64,
    /// Largest downlink SDU in bytes
    pub max_sdu_bytes: usize,
    /// Largest uplink queue a subscriber reports, in packets
    pub max_reported_packets: u64,
    /// Mean SINR of the subscriber links, dB
    pub mean_sinr_db: f64,
    /// Step of the SINR random walk, dB
    pub sinr_step_db: f64,
    /// Interference plus noise at the receivers, dBm
    pub interference_dbm: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            subscribers: 4,
            frames: 200,
            seed: 1,
            realtime: false,
            downlink_sdus_per_frame: 0.5,
            max_sdu_bytes: 1500,
            max_reported_packets: 3,
            mean_sinr_db: 12.0,
            sinr_step_db: 1.0,
            interference_dbm: -96.0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Level used when neither RUST_LOG nor the command line set one
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl StationConfig {
    /// Load configuration from a YAML or TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let is_toml = Path::new(path).extension().is_some_and(|ext| ext == "toml");
        let config: StationConfig = if is_toml {
            toml::from_str(&contents)?
        } else {
            serde_yaml::from_str(&contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.station.id == 0 {
            anyhow::bail!("Station id 0 is reserved");
        }
        if self.simulation.max_sdu_bytes == 0 {
            anyhow::bail!("max_sdu_bytes must be positive");
        }
        if !(0.0..=1.0).contains(&self.simulation.downlink_sdus_per_frame) {
            anyhow::bail!("downlink_sdus_per_frame {} outside [0, 1]", self.simulation.downlink_sdus_per_frame);
        }
        let simulation = &self.simulation;
        if !simulation.mean_sinr_db.is_finite() {
            anyhow::bail!("mean_sinr_db {} is not finite", simulation.mean_sinr_db);
        }
        if !simulation.sinr_step_db.is_finite() || simulation.sinr_step_db < 0.0 {
            anyhow::bail!("sinr_step_db {} must be finite and not negative", simulation.sinr_step_db);
        }
        if let Some(power) = self.power_overrides.iter().find(|power| !power.dbm.is_finite()) {
            anyhow::bail!("power override of CID {} is not finite", power.cid);
        }
        self.scheduler.priority.validate()?;
        // The timeline must fill the frame exactly
        standard_timeline(&self.frame.parameters(), StationRole::BaseStation)?;
        Ok(())
    }

    pub fn station_id(&self) -> StationId {
        StationId(self.station.id)
    }

    /// Engine configuration of the base station
    pub fn mac_config(&self) -> MacConfig {
        MacConfig {
            frame: self.frame.parameters(),
            queue: self.queue,
            grouping: GroupingConfig {
                beamforming: self.scheduler.beamforming,
                max_beams: self.scheduler.max_beams,
                friendliness: Dbm(self.scheduler.friendliness_dbm),
            },
            sub_strategy: self.scheduler.sub_strategy,
            random_dsa_start: self.scheduler.random_dsa_start,
            priority: self.scheduler.priority.clone(),
            power: self.power,
            power_overrides: self
                .power_overrides
                .iter()
                .map(|power| (ConnectionId(power.cid), Dbm(power.dbm)))
                .collect(),
            interference: self.interference,
            dead_station: self.dead_station,
            bandwidth_request_packet_bits: self.scheduler.bandwidth_request_packet_bits,
            pdu_overhead_bits: self.scheduler.pdu_overhead_bits,
            seed: self.simulation.seed,
            ..MacConfig::base_station(self.station_id())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_engine() {
        let config = StationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame.parameters(), FrameParameters::default());

        let mac = config.mac_config();
        assert_eq!(mac.station, StationId(1));
        assert_eq!(mac.grouping, GroupingConfig::default());
        assert_eq!(mac.pdu_overhead_bits, 48);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
station:
  id: 7
scheduler:
  sub_strategy:
    proportional_fair:
      history_weight: 0.1
  beamforming: true
simulation:
  subscribers: 2
power_overrides:
  - cid: 3
    dbm: 21.5
"#;
        let config: StationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.station_id(), StationId(7));
        assert_eq!(config.simulation.subscribers, 2);
        assert_eq!(config.simulation.frames, 200);
        assert_eq!(config.scheduler.sub_strategy, SubStrategyKind::ProportionalFair { history_weight: 0.1 });
        assert!(config.mac_config().grouping.beamforming);
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.mac_config().power_overrides.get(&ConnectionId(3)), Some(&Dbm(21.5)));
    }

    #[test]
    fn test_toml_file() {
        let path = std::env::temp_dir().join(format!("albor_station_{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[station]\nid = 3\n\n[simulation]\nframes = 10\nrealtime = true").unwrap();

        let config = StationConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.station.id, 3);
        assert_eq!(config.simulation.frames, 10);
        assert!(config.simulation.realtime);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_invalid_values() {
        let mut config = StationConfig::default();
        config.station.id = 0;
        assert!(config.validate().is_err());

        let mut config = StationConfig::default();
        config.frame.dl_data_symbols = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sinr_walk_settings() {
        for step in [-1.0, f64::NAN, f64::INFINITY] {
            let mut config = StationConfig::default();
            config.simulation.sinr_step_db = step;
            assert!(config.validate().is_err(), "step {} accepted", step);
        }

        let mut config = StationConfig::default();
        config.simulation.mean_sinr_db = f64::NAN;
        assert!(config.validate().is_err());

        // A frozen walk is fine
        let mut config = StationConfig::default();
        config.simulation.sinr_step_db = 0.0;
        assert!(config.validate().is_ok());

        let yaml = "simulation:\n  sinr_step_db: -2.0\n";
        let config: StationConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
