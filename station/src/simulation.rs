//! Simulated Subscriber Stations and PHY
//!
//! Drives a base station MAC against subscriber stations that exist only as
//! a SINR random walk, a downlink load generator and bandwidth request reports.
//! The PHY side receives the MAC's transmission requests and decides packet
//! loss with the error model.

use crate::config::SimulationConfig;
use anyhow::Result;
use bytes::Bytes;
use common::types::{ConnectionId, Db, Dbm, Direction, QosCategory, StationClass, StationId};
use interfaces::{
    MeasuredPhase, MeasurementOrigin, MeasurementReport, PhyService, TelemetrySink, TransmissionKind,
    TransmissionRequest,
};
use layers::mac::{
    ConnectionSpec, ErrorRateModel, FrameReport, IntervalMapper, LinkQualityMapper, MacConfig, MacLayer,
    MacPhyInterface, TableErrorModel,
};
use layers::ProtocolLayer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

/// Current SINR of every subscriber link, shared with the PHY task
pub type LinkTable = Arc<RwLock<HashMap<StationId, f64>>>;

/// Spread of the SINR walk around its mean, dB
const SINR_SPREAD_DB: f64 = 10.0;

#[derive(Debug, Clone)]
struct Subscriber {
    station: StationId,
    downlink: ConnectionId,
    uplink: ConnectionId,
    qos: QosCategory,
    sinr: f64,
}

/// Base station MAC plus its simulated subscribers
pub struct Simulation {
    mac: MacLayer,
    settings: SimulationConfig,
    subscribers: Vec<Subscriber>,
    links: LinkTable,
    rng: StdRng,
}

impl Simulation {
    /// Build the MAC and place the subscribers
    pub fn new(
        mac_config: MacConfig,
        settings: SimulationConfig,
        phy: Box<dyn PhyService>,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Result<Self> {
        let base = mac_config.station;
        let mac = MacLayer::with_defaults(mac_config, phy, telemetry)?;
        let mut rng = StdRng::seed_from_u64(settings.seed);

        let subscribers = (0..settings.subscribers)
            .map(|i| Subscriber {
                station: StationId(base.value() + 1 + i),
                downlink: ConnectionId(2 * i + 1),
                uplink: ConnectionId(2 * i + 2),
                qos: QosCategory::ALL[rng.gen_range(0..QosCategory::ALL.len())],
                sinr: settings.mean_sinr_db,
            })
            .collect();

        Ok(Self { mac, settings, subscribers, links: LinkTable::default(), rng })
    }

    /// Link table the PHY task reads
    pub fn links(&self) -> LinkTable {
        self.links.clone()
    }

    pub fn mac(&self) -> &MacLayer {
        &self.mac
    }

    /// Initialize the MAC and admit one downlink and one uplink connection per subscriber
    pub async fn start(&mut self) -> Result<()> {
        self.mac.initialize().await?;
        for subscriber in &self.subscribers {
            for (cid, direction) in [(subscriber.downlink, Direction::Downlink), (subscriber.uplink, Direction::Uplink)] {
                self.mac
                    .admit(ConnectionSpec {
                        cid,
                        station: subscriber.station,
                        direction,
                        qos: subscriber.qos,
                        station_class: StationClass::UserTerminal,
                    })
                    .await?;
            }
            info!("Subscriber {} admitted with {:?} connections {} / {}",
                  subscriber.station, subscriber.qos, subscriber.downlink, subscriber.uplink);
        }
        Ok(())
    }

    /// Advance the subscribers and run one MAC frame
    pub async fn step(&mut self, frame: u64) -> Result<FrameReport> {
        let base = self.mac.station();
        let interference = self.settings.interference_dbm;
        let low = self.settings.mean_sinr_db - SINR_SPREAD_DB;
        let high = self.settings.mean_sinr_db + SINR_SPREAD_DB;

        for subscriber in &mut self.subscribers {
            let step = self.rng.gen_range(-self.settings.sinr_step_db..=self.settings.sinr_step_db);
            subscriber.sinr = (subscriber.sinr + step).clamp(low, high);
        }

        {
            let mut links = self.links.write().await;
            for subscriber in &self.subscribers {
                links.insert(subscriber.station, subscriber.sinr);
            }
        }

        for subscriber in &self.subscribers {
            let carrier = Dbm(interference + subscriber.sinr);
            // Downlink measured by the subscriber and reported back, uplink measured locally
            let reports = [
                (subscriber.station, base, Direction::Downlink, MeasurementOrigin::Remote),
                (base, subscriber.station, Direction::Uplink, MeasurementOrigin::Local),
            ];
            for (station, peer, direction, origin) in reports {
                self.mac
                    .on_measurement(MeasurementReport {
                        frame,
                        station,
                        peer,
                        direction,
                        carrier,
                        interference: Dbm(interference),
                        pathloss: Some(Db(30.0 - carrier.0)),
                        origin,
                        phase: MeasuredPhase::FrameHead,
                    })
                    .await?;
            }
        }

        let subscribers = self.subscribers.clone();
        for subscriber in &subscribers {
            if self.rng.gen_bool(self.settings.downlink_sdus_per_frame) {
                let size = self.rng.gen_range(1..=self.settings.max_sdu_bytes);
                let mut sdu = vec![0u8; size];
                self.rng.fill(sdu.as_mut_slice());
                self.mac.process_downlink(subscriber.downlink, Bytes::from(sdu)).await?;
            }
            let packets = self.rng.gen_range(0..=self.settings.max_reported_packets);
            self.mac.report_bandwidth_request(subscriber.uplink, packets).await?;
        }

        let report = self.mac.on_new_frame(frame).await?;
        debug!("Frame {}: {} DL / {} UL grants, {} deferred, {} bits queued",
               frame, report.downlink_grants, report.uplink_grants, report.deferred, report.queued_bits);
        Ok(report)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.mac.shutdown().await?;
        Ok(())
    }
}

/// Delivery counters of the simulated PHY
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhyStats {
    pub frame_heads: u64,
    pub maps: u64,
    pub bursts: u64,
    pub lost_bursts: u64,
    pub delivered_bits: u64,
    pub lost_bits: u64,
    /// Sum of the predicted packet error rates
    pub predicted_losses: f64,
}

impl PhyStats {
    /// Lost over sent bursts
    pub fn burst_loss_ratio(&self) -> f64 {
        if self.bursts == 0 {
            0.0
        } else {
            self.lost_bursts as f64 / self.bursts as f64
        }
    }
}

/// Consume transmission requests until the MAC goes away
pub async fn run_phy(
    mut requests: UnboundedReceiver<TransmissionRequest>,
    links: LinkTable,
    seed: u64,
) -> Result<PhyStats> {
    let mapper = IntervalMapper::wimax()?;
    let error_model = TableErrorModel::wimax()?;
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let mut stats = PhyStats::default();

    while let Some(request) = requests.recv().await {
        match request.kind {
            TransmissionKind::FrameHead => stats.frame_heads += 1,
            TransmissionKind::Map(_) => stats.maps += 1,
            TransmissionKind::Data(direction) => {
                let Some(remote) = request.destination else {
                    warn!("Data burst of frame {} without destination", request.frame);
                    continue;
                };
                let sinr = links.read().await.get(&remote).copied().unwrap_or(f64::NEG_INFINITY);
                let per = match mapper.by_index(request.mcs_index) {
                    Some(mcs) => error_model.packet_error_rate(&mcs, sinr, request.payload_bits),
                    None => 1.0,
                };

                stats.bursts += 1;
                stats.predicted_losses += per;
                if rng.gen_bool(per.clamp(0.0, 1.0)) {
                    stats.lost_bursts += 1;
                    stats.lost_bits += request.payload_bits;
                } else {
                    stats.delivered_bits += request.payload_bits;
                }
                trace!("{} burst to {} on sub-channel {}: {} bits, PER {:.3e}",
                       direction, remote, request.resource.sub_channel, request.payload_bits, per);
            }
        }
    }

    info!("PHY stopped after {} bursts, {} lost", stats.bursts, stats.lost_bursts);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::telemetry::names;
    use interfaces::{ChannelPhy, ChannelSink, TelemetryRecorder};

    fn settings(subscribers: u32) -> SimulationConfig {
        SimulationConfig { subscribers, downlink_sdus_per_frame: 1.0, ..SimulationConfig::default() }
    }

    #[tokio::test]
    async fn test_frames_produce_grants() {
        let (phy, phy_rx) = ChannelPhy::channel();
        let (sink, mut telemetry_rx) = ChannelSink::channel();
        let mut simulation =
            Simulation::new(MacConfig::base_station(StationId(1)), settings(3), Box::new(phy), Box::new(sink)).unwrap();
        let phy_task = tokio::spawn(run_phy(phy_rx, simulation.links(), 1));

        simulation.start().await.unwrap();
        assert_eq!(simulation.mac().connection_count().await, 6);

        let mut downlink_grants = 0;
        for frame in 0..10 {
            downlink_grants += simulation.step(frame).await.unwrap().downlink_grants;
        }
        assert!(downlink_grants > 0);
        assert_eq!(simulation.links().read().await.len(), 3);

        simulation.shutdown().await.unwrap();
        drop(simulation);
        let stats = phy_task.await.unwrap().unwrap();
        assert_eq!(stats.frame_heads, 10);
        assert_eq!(stats.maps, 20);
        assert!(stats.bursts as usize >= downlink_grants);

        let mut recorder = TelemetryRecorder::new();
        recorder.drain_from(&mut telemetry_rx);
        assert_eq!(recorder.named(names::MAP_SIZE).count(), 20);
        assert_eq!(recorder.named(names::BUFFER_LOSS_RATIO).count(), 10);
    }

    #[tokio::test]
    async fn test_seeded_runs_repeat() {
        async fn run() -> Vec<FrameReport> {
            let (phy, _phy_rx) = ChannelPhy::channel();
            let mut simulation = Simulation::new(
                MacConfig::base_station(StationId(1)),
                settings(2),
                Box::new(phy),
                Box::new(interfaces::NullSink),
            )
            .unwrap();
            simulation.start().await.unwrap();
            let mut reports = Vec::new();
            for frame in 0..5 {
                reports.push(simulation.step(frame).await.unwrap());
            }
            reports
        }
        assert_eq!(run().await, run().await);
    }

    #[test]
    fn test_burst_loss_ratio() {
        let stats = PhyStats { bursts: 4, lost_bursts: 1, ..PhyStats::default() };
        assert_eq!(stats.burst_loss_ratio(), 0.25);
        assert_eq!(PhyStats::default().burst_loss_ratio(), 0.0);
    }
}
