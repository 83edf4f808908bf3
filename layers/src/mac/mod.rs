//! Medium Access Control (MAC) Layer Implementation
//!
//! Frame-driven MAC of a TDD/OFDMA station. Each frame the timeline is
//! replayed: schedulers run, MAPs are built from their results and broadcast,
//! then the data phases send the granted bursts.

pub mod connection;
pub mod dead_station;
pub mod error_model;
pub mod identity;
pub mod interference_cache;
pub mod link_quality;
pub mod map;
pub mod phases;
pub mod scheduler;

use crate::frame::{standard_timeline, Action, FrameAssembler, FrameParameters};
use crate::{LayerError, ProtocolLayer};
use async_trait::async_trait;
use bytes::Bytes;
use common::types::{ConnectionId, Dbm, Direction, StationId, StationRole};
use interfaces::telemetry::names;
use interfaces::{BacklogProvider, MeasuredPhase, MeasurementReport, PhyService, TelemetrySample, TelemetrySink};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

pub use connection::{Connection, ConnectionRegistry, ConnectionSpec};
pub use dead_station::{DeadStationConfig, DeadStationDetector};
pub use error_model::{ErrorRateModel, SerTable, TableErrorModel, DEFAULT_PACKET_BITS};
pub use identity::StationIdentity;
pub use interference_cache::{
    DefaultLinkValues, InterferenceCache, InterferenceCacheConfig, LinkEstimate, NotFoundStrategy,
};
pub use link_quality::{IntervalMapper, LinkQualityMapper, Mcs, Modulation, SinrInterval};
pub use map::{MapBurst, MapMessage};
pub use phases::{BacklogSource, DataPhase, FrameHeadPhase, MacState, MapPhase, PerDirection};
pub use scheduler::{
    BandwidthRequestProxy, DsaKind, Grant, GroupingConfig, NominalPower, PowerCapabilities, PowerProfiles,
    PriorityClasses, QueueConfig, ResourceScheduler, SchedulerConfig, SchedulingMap, SegmentingQueue,
    SubStrategyKind,
};

/// MAC layer configuration
#[derive(Debug, Clone)]
pub struct MacConfig {
    pub station: StationId,
    pub role: StationRole,
    /// Base station of a subscriber station
    pub serving_station: Option<StationId>,
    pub frame: FrameParameters,
    pub queue: QueueConfig,
    pub grouping: GroupingConfig,
    pub sub_strategy: SubStrategyKind,
    /// Random start sub-channel for the master's DSA
    pub random_dsa_start: bool,
    pub priority: PriorityClasses,
    pub power: PowerProfiles,
    /// Fixed transmit power per connection, applied on admission
    pub power_overrides: BTreeMap<ConnectionId, Dbm>,
    pub interference: InterferenceCacheConfig,
    pub dead_station: DeadStationConfig,
    /// Packet size assumed behind a bandwidth request, without overhead
    pub bandwidth_request_packet_bits: u64,
    /// MAC header overhead of a packet
    pub pdu_overhead_bits: u64,
    pub seed: u64,
}

impl MacConfig {
    /// Defaults for a base station
    pub fn base_station(station: StationId) -> Self {
        Self {
            station,
            role: StationRole::BaseStation,
            serving_station: None,
            frame: FrameParameters::default(),
            queue: QueueConfig::default(),
            grouping: GroupingConfig::default(),
            sub_strategy: SubStrategyKind::default(),
            random_dsa_start: false,
            priority: PriorityClasses::default(),
            power: PowerProfiles::default(),
            power_overrides: BTreeMap::new(),
            interference: InterferenceCacheConfig::default(),
            dead_station: DeadStationConfig::default(),
            bandwidth_request_packet_bits: DEFAULT_PACKET_BITS,
            pdu_overhead_bits: 48,
            seed: 0,
        }
    }

    /// Defaults for a subscriber station attached to `serving`
    pub fn subscriber_station(station: StationId, serving: StationId) -> Self {
        Self {
            role: StationRole::SubscriberStation,
            serving_station: Some(serving),
            ..Self::base_station(station)
        }
    }

    fn scheduler(&self, direction: Direction, dsa: DsaKind) -> SchedulerConfig {
        SchedulerConfig {
            direction,
            sub_channels: self.frame.sub_channels,
            data_subcarriers: self.frame.data_subcarriers,
            symbol_duration: self.frame.symbol_duration,
            grouping: self.grouping,
            sub_strategy: self.sub_strategy,
            dsa,
            priority: self.priority.clone(),
            own_station: self.station,
            own_class: self.role.station_class(),
            seed: self.seed ^ direction as u64,
        }
    }
}

/// Outcome of one frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    /// Activations dispatched by the assembler
    pub dispatched: usize,
    pub downlink_grants: usize,
    pub uplink_grants: usize,
    /// Connections deferred as unservable
    pub deferred: usize,
    /// Bits waiting in the station's own queue
    pub queued_bits: u64,
    pub loss_ratio: f64,
    /// Connections released by dead-station detection
    pub released: Vec<ConnectionId>,
}

/// Events delivered by the PHY side
#[async_trait]
pub trait MacPhyInterface: Send + Sync {
    /// A new frame starts
    async fn on_new_frame(&self, frame: u64) -> Result<FrameReport, LayerError>;

    /// A carrier/interference measurement arrived
    async fn on_measurement(&self, report: MeasurementReport) -> Result<(), LayerError>;

    /// An encoded MAP was received
    async fn on_map_received(&self, data: Bytes) -> Result<(), LayerError>;
}

struct MacEngine {
    assembler: FrameAssembler<MacState>,
    state: MacState,
}

/// MAC layer of one station
pub struct MacLayer {
    config: MacConfig,
    engine: Arc<Mutex<MacEngine>>,
    initialized: bool,
}

impl MacLayer {
    /// Build the station's timeline, bind its phases and set up its schedulers
    pub fn new(
        config: MacConfig,
        mapper: Box<dyn LinkQualityMapper>,
        error_model: Box<dyn ErrorRateModel>,
        phy: Box<dyn PhyService>,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Result<Self, LayerError> {
        let mut identity = StationIdentity::new();
        identity.set_id(config.station)?;
        identity.set_role(config.role)?;
        let role = identity.role()?;

        if role == StationRole::SubscriberStation && config.serving_station.is_none() {
            return Err(LayerError::ConfigurationError("subscriber station without serving base station".into()));
        }

        let (timeline, phases) = standard_timeline(&config.frame, role)?;
        let mut assembler = FrameAssembler::new(timeline);

        assembler.bind(phases.frame_head, Box::new(FrameHeadPhase))?;
        assembler.bind(phases.dl_map, Box::new(MapPhase::new(Direction::Downlink)))?;
        assembler.bind(phases.ul_map, Box::new(MapPhase::new(Direction::Uplink)))?;

        let master = DsaKind::LinearFirstFit { random_start: config.random_dsa_start };
        match role {
            StationRole::BaseStation => {
                let downlink = ResourceScheduler::new(config.scheduler(Direction::Downlink, master))?;
                let uplink = ResourceScheduler::new(config.scheduler(Direction::Uplink, master))?;
                assembler.bind(phases.dl_data, Box::new(
                    DataPhase::scheduling(Direction::Downlink, downlink, BacklogSource::LocalQueue)))?;
                assembler.bind(phases.ul_data, Box::new(
                    DataPhase::scheduling(Direction::Uplink, uplink, BacklogSource::BandwidthRequests)))?;

                assembler.require_order((phases.dl_data, Action::FinishCollection), (phases.dl_map, Action::FinishCollection))?;
                assembler.require_order((phases.ul_data, Action::FinishCollection), (phases.ul_map, Action::FinishCollection))?;
            }
            StationRole::SubscriberStation => {
                let uplink = ResourceScheduler::new(config.scheduler(Direction::Uplink, DsaKind::Slave))?;
                assembler.bind(phases.dl_data, Box::new(DataPhase::receiving(Direction::Downlink)))?;
                assembler.bind(phases.ul_data, Box::new(
                    DataPhase::scheduling(Direction::Uplink, uplink, BacklogSource::LocalQueue)))?;

                assembler.require_order((phases.ul_map, Action::Start), (phases.ul_data, Action::FinishCollection))?;
            }
        }
        assembler.require_order((phases.dl_map, Action::Start), (phases.dl_data, Action::Start))?;
        assembler.require_order((phases.ul_map, Action::Start), (phases.ul_data, Action::Start))?;

        let bandwidth_requests = (role == StationRole::BaseStation).then(|| {
            BandwidthRequestProxy::new(config.queue, config.bandwidth_request_packet_bits, config.pdu_overhead_bits)
        });

        let state = MacState {
            station: config.station,
            role,
            serving_station: config.serving_station,
            frame: 0,
            params: config.frame.clone(),
            connections: ConnectionRegistry::new(),
            interference: InterferenceCache::new(config.interference),
            mapper,
            error_model,
            power: NominalPower::new(config.power),
            queue: SegmentingQueue::new(config.queue),
            bandwidth_requests,
            dead_stations: DeadStationDetector::new(config.dead_station),
            schedules: PerDirection::default(),
            released: PerDirection::default(),
            received_maps: PerDirection::default(),
            phy,
            telemetry,
        };

        info!("MAC of {} ready as {:?}", config.station, role);
        Ok(Self {
            config,
            engine: Arc::new(Mutex::new(MacEngine { assembler, state })),
            initialized: false,
        })
    }

    /// MAC with the built-in MCS catalogue and SER tables
    pub fn with_defaults(
        config: MacConfig,
        phy: Box<dyn PhyService>,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Result<Self, LayerError> {
        Self::new(config, Box::new(IntervalMapper::wimax()?), Box::new(TableErrorModel::wimax()?), phy, telemetry)
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn station(&self) -> StationId {
        self.config.station
    }

    /// Admit a connection
    pub async fn admit(&self, spec: ConnectionSpec) -> Result<(), LayerError> {
        let mut engine = self.engine.lock().await;
        let state = &mut engine.state;
        state.connections.admit(spec)?;
        if spec.direction == Direction::Uplink {
            if let Some(proxy) = state.bandwidth_requests.as_mut() {
                proxy.register(spec.cid);
            }
        }
        if let Some(&power) = self.config.power_overrides.get(&spec.cid) {
            debug!("Transmit power of {} fixed at {}", spec.cid, power);
            state.power.set_override(spec.cid, power);
        }
        let frame = state.frame;
        state.dead_stations.touch(spec.station, frame);
        Ok(())
    }

    /// Release every connection of a station and discard its queued data
    pub async fn release_station(&self, station: StationId) -> Vec<ConnectionId> {
        let mut engine = self.engine.lock().await;
        release_station(&mut engine.state, station)
    }

    /// Queue length a subscriber station reported for an uplink connection, in packets
    pub async fn report_bandwidth_request(&self, cid: ConnectionId, packets: u64) -> Result<(), LayerError> {
        let mut engine = self.engine.lock().await;
        let state = &mut engine.state;
        let station = state.connections.get(cid).ok_or(LayerError::UnknownConnection(cid))?.station();
        let frame = state.frame;
        state.dead_stations.touch(station, frame);
        match state.bandwidth_requests.as_mut() {
            Some(proxy) => {
                proxy.report(cid, packets);
                Ok(())
            }
            None => Err(LayerError::InvalidState("bandwidth requests are handled by the base station".into())),
        }
    }

    /// Bits queued for a connection
    pub async fn backlog_bits(&self, cid: ConnectionId) -> u64 {
        self.engine.lock().await.state.queue.backlog_bits(cid)
    }

    /// Number of admitted connections
    pub async fn connection_count(&self) -> usize {
        self.engine.lock().await.state.connections.len()
    }
}

fn release_station(state: &mut MacState, station: StationId) -> Vec<ConnectionId> {
    let released = state.connections.release_station(station);
    let mut discarded = 0;
    for &cid in &released {
        discarded += state.queue.remove_connection(cid);
        if let Some(proxy) = state.bandwidth_requests.as_mut() {
            proxy.unregister(cid);
        }
        state.power.clear_override(cid);
        state.released.downlink.push(cid);
        state.released.uplink.push(cid);
    }
    state.interference.forget_station(station);
    state.dead_stations.forget(station);
    if discarded > 0 {
        warn!("{} queued bits of {} discarded", discarded, station);
    }
    released
}

#[async_trait]
impl MacPhyInterface for MacLayer {
    async fn on_new_frame(&self, frame: u64) -> Result<FrameReport, LayerError> {
        let mut engine = self.engine.lock().await;
        let MacEngine { assembler, state } = &mut *engine;
        state.frame = frame;

        for (cid, delta) in state.connections.take_mcs_deltas() {
            state.telemetry.emit(TelemetrySample::for_connection(names::MCS_DELTA, frame, cid, delta as f64));
        }

        let mut released = Vec::new();
        for station in state.dead_stations.on_frame(frame) {
            let cids = release_station(state, station);
            if !cids.is_empty() {
                state.telemetry.emit(TelemetrySample::new(names::DEAD_STATION_REMOVED, frame, cids.len() as f64));
            }
            released.extend(cids);
        }

        let run = assembler.run_frame(frame, state)?;

        let loss_ratio = state.queue.loss_ratio();
        state.telemetry.emit(TelemetrySample::new(names::BUFFER_LOSS_RATIO, frame, loss_ratio));

        let current = |direction: Direction| {
            state.schedules.get(direction).as_ref().filter(|schedule| schedule.frame == frame)
        };
        let report = FrameReport {
            frame,
            dispatched: run.dispatched,
            downlink_grants: current(Direction::Downlink).map_or(0, |s| s.grants.len()),
            uplink_grants: current(Direction::Uplink).map_or(0, |s| s.grants.len()),
            deferred: [Direction::Downlink, Direction::Uplink]
                .into_iter()
                .filter_map(current)
                .map(|s| s.deferred.len())
                .sum(),
            queued_bits: state.queue.queued_bits(),
            loss_ratio,
            released,
        };
        debug!("Frame {} done at {}: {:?}", frame, state.station, report);
        Ok(report)
    }

    async fn on_measurement(&self, report: MeasurementReport) -> Result<(), LayerError> {
        let mut engine = self.engine.lock().await;
        let state = &mut engine.state;

        state.interference.apply_report(&report);

        let remote = if report.station == state.station { report.peer } else { report.station };
        state.dead_stations.touch(remote, report.frame);
        if report.phase != MeasuredPhase::SdmaData {
            let sinr = report.sinr().0;
            state.connections.update_link(remote, report.direction, sinr, state.mapper.as_ref());
        }
        trace!("Measurement of {} {} link: SINR {:.2} dB", remote, report.direction, report.sinr().0);
        Ok(())
    }

    async fn on_map_received(&self, data: Bytes) -> Result<(), LayerError> {
        let map = MapMessage::decode(&data)?;
        let mut engine = self.engine.lock().await;
        let state = &mut engine.state;
        if state.role == StationRole::BaseStation {
            trace!("Base station ignores {}-MAP of {}", map.direction, map.base_station);
            return Ok(());
        }
        if Some(map.base_station) != state.serving_station {
            trace!("{}-MAP of foreign base station {} ignored", map.direction, map.base_station);
            return Ok(());
        }

        state.dead_stations.touch(map.base_station, map.frame);
        debug!("{} received {}-MAP of frame {} with {} bursts", state.station, map.direction, map.frame, map.bursts.len());
        let direction = map.direction;
        *state.received_maps.get_mut(direction) = Some(map);
        Ok(())
    }
}

#[async_trait]
impl ProtocolLayer for MacLayer {
    async fn initialize(&mut self) -> Result<(), LayerError> {
        info!("Initializing MAC layer of {}", self.config.station);
        debug!("MAC config: role={:?}, {} sub-channels, frame {:?}, strategy {:?}",
               self.config.role, self.config.frame.sub_channels, self.config.frame.frame_duration, self.config.sub_strategy);
        self.initialized = true;
        Ok(())
    }

    async fn process_uplink(&mut self, cid: ConnectionId, data: Bytes) -> Result<(), LayerError> {
        if !self.initialized {
            return Err(LayerError::NotInitialized);
        }
        let mut engine = self.engine.lock().await;
        let state = &mut engine.state;
        let station = state.connections.get(cid).ok_or(LayerError::UnknownConnection(cid))?.station();
        let frame = state.frame;
        state.dead_stations.touch(station, frame);
        trace!(cid = cid.value(), bytes = data.len(), "Received data from {}", station);
        Ok(())
    }

    async fn process_downlink(&mut self, cid: ConnectionId, data: Bytes) -> Result<(), LayerError> {
        if !self.initialized {
            return Err(LayerError::NotInitialized);
        }
        let mut engine = self.engine.lock().await;
        let state = &mut engine.state;
        if state.connections.get(cid).is_none() {
            return Err(LayerError::UnknownConnection(cid));
        }
        // Overflow is dropped and counted, never an error
        state.queue.enqueue(cid, data);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), LayerError> {
        info!("Shutting down MAC layer of {}", self.config.station);
        self.initialized = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::scheduler::PowerControl;
    use common::types::{Db, QosCategory, StationClass};
    use interfaces::{ChannelPhy, MeasurementOrigin, TelemetryRecorder, TransmissionKind, TransmissionRequest};
    use interfaces::ChannelSink;
    use tokio::sync::mpsc::UnboundedReceiver;

    const BS: StationId = StationId(1);
    const SS: StationId = StationId(2);

    fn layer(config: MacConfig) -> (MacLayer, UnboundedReceiver<TransmissionRequest>, UnboundedReceiver<TelemetrySample>) {
        let (phy, phy_rx) = ChannelPhy::channel();
        let (sink, telemetry_rx) = ChannelSink::channel();
        let layer = MacLayer::with_defaults(config, Box::new(phy), Box::new(sink)).unwrap();
        (layer, phy_rx, telemetry_rx)
    }

    fn spec(cid: u32, station: StationId, direction: Direction, station_class: StationClass) -> ConnectionSpec {
        ConnectionSpec { cid: ConnectionId(cid), station, direction, qos: QosCategory::Be, station_class }
    }

    fn measurement(frame: u64, direction: Direction) -> MeasurementReport {
        MeasurementReport {
            frame,
            station: SS,
            peer: BS,
            direction,
            carrier: Dbm(-70.0),
            interference: Dbm(-85.0),
            pathloss: Some(Db(100.0)),
            origin: MeasurementOrigin::Local,
            phase: MeasuredPhase::FrameHead,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<TransmissionRequest>) -> Vec<TransmissionRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    #[tokio::test]
    async fn test_base_station_frame() {
        let (mut bs, mut phy_rx, mut telemetry_rx) = layer(MacConfig::base_station(BS));
        bs.initialize().await.unwrap();
        bs.admit(spec(10, SS, Direction::Downlink, StationClass::UserTerminal)).await.unwrap();
        bs.on_measurement(measurement(0, Direction::Downlink)).await.unwrap();
        bs.process_downlink(ConnectionId(10), Bytes::from(vec![0xAB; 500])).await.unwrap();

        let report = bs.on_new_frame(0).await.unwrap();
        assert_eq!(report.downlink_grants, 1);
        assert_eq!(report.queued_bits, 0);

        let requests = drain(&mut phy_rx);
        let kinds: Vec<TransmissionKind> = requests.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![
            TransmissionKind::FrameHead,
            TransmissionKind::Map(Direction::Downlink),
            TransmissionKind::Map(Direction::Uplink),
            TransmissionKind::Data(Direction::Downlink),
        ]);
        let data = &requests[3];
        assert_eq!(data.destination, Some(SS));
        assert_eq!(data.payload.len(), 500);

        let dl_map = MapMessage::decode(&requests[1].payload).unwrap();
        assert_eq!(dl_map.bursts.len(), 1);
        assert_eq!(dl_map.bursts[0].cid, ConnectionId(10));

        let mut recorder = TelemetryRecorder::new();
        recorder.drain_from(&mut telemetry_rx);
        assert_eq!(recorder.named(names::MAP_SIZE).count(), 2);
        assert_eq!(recorder.named(names::GRANT_PER).count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_connection_and_uninitialized() {
        let (mut bs, _phy_rx, _telemetry_rx) = layer(MacConfig::base_station(BS));
        assert!(matches!(
            bs.process_downlink(ConnectionId(1), Bytes::from_static(b"x")).await,
            Err(LayerError::NotInitialized)
        ));
        bs.initialize().await.unwrap();
        assert!(matches!(
            bs.process_downlink(ConnectionId(1), Bytes::from_static(b"x")).await,
            Err(LayerError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_subscriber_follows_uplink_map() {
        let (bs, mut bs_rx, _bs_telemetry) = layer(MacConfig::base_station(BS));
        let (mut ss, mut ss_rx, _ss_telemetry) = layer(MacConfig::subscriber_station(SS, BS));
        ss.initialize().await.unwrap();

        bs.admit(spec(20, SS, Direction::Uplink, StationClass::UserTerminal)).await.unwrap();
        ss.admit(spec(20, BS, Direction::Uplink, StationClass::AccessPoint)).await.unwrap();
        bs.on_measurement(measurement(0, Direction::Uplink)).await.unwrap();
        ss.on_measurement(measurement(0, Direction::Uplink)).await.unwrap();

        ss.process_downlink(ConnectionId(20), Bytes::from(vec![1u8; 100])).await.unwrap();
        bs.report_bandwidth_request(ConnectionId(20), 1).await.unwrap();

        bs.on_new_frame(0).await.unwrap();
        let ul_map = drain(&mut bs_rx)
            .into_iter()
            .find(|r| r.kind == TransmissionKind::Map(Direction::Uplink))
            .unwrap();
        let map = MapMessage::decode(&ul_map.payload).unwrap();
        assert_eq!(map.bursts.len(), 1);
        ss.on_map_received(ul_map.payload).await.unwrap();

        let report = ss.on_new_frame(0).await.unwrap();
        assert_eq!(report.uplink_grants, 1);
        let sent = drain(&mut ss_rx);
        assert_eq!(sent.len(), 1);
        let burst = &map.bursts[0];
        assert_eq!(sent[0].kind, TransmissionKind::Data(Direction::Uplink));
        assert_eq!(sent[0].resource.sub_channel, burst.sub_channel);
        assert_eq!(sent[0].resource.start_symbol, burst.start_symbol);
        assert_eq!(sent[0].destination, Some(BS));
        assert_eq!(ss.backlog_bits(ConnectionId(20)).await, 0);

        // Without a MAP for the current frame the subscriber sends nothing
        ss.process_downlink(ConnectionId(20), Bytes::from(vec![1u8; 100])).await.unwrap();
        let report = ss.on_new_frame(1).await.unwrap();
        assert_eq!(report.uplink_grants, 0);
        assert!(drain(&mut ss_rx).is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_sends_at_map_mcs() {
        let (bs, mut bs_rx, _bs_telemetry) = layer(MacConfig::base_station(BS));
        let (mut ss, mut ss_rx, _ss_telemetry) = layer(MacConfig::subscriber_station(SS, BS));
        ss.initialize().await.unwrap();

        bs.admit(spec(20, SS, Direction::Uplink, StationClass::UserTerminal)).await.unwrap();
        ss.admit(spec(20, BS, Direction::Uplink, StationClass::AccessPoint)).await.unwrap();
        // The base station sees a 0 dB uplink, the subscriber believes in 25 dB
        let mut poor = measurement(0, Direction::Uplink);
        poor.carrier = Dbm(-85.0);
        let mut good = measurement(0, Direction::Uplink);
        good.carrier = Dbm(-60.0);
        bs.on_measurement(poor).await.unwrap();
        ss.on_measurement(good).await.unwrap();

        ss.process_downlink(ConnectionId(20), Bytes::from(vec![1u8; 100])).await.unwrap();
        bs.report_bandwidth_request(ConnectionId(20), 1).await.unwrap();

        bs.on_new_frame(0).await.unwrap();
        let ul_map = drain(&mut bs_rx)
            .into_iter()
            .find(|r| r.kind == TransmissionKind::Map(Direction::Uplink))
            .unwrap();
        let map = MapMessage::decode(&ul_map.payload).unwrap();
        let mapper = IntervalMapper::wimax().unwrap();
        let planned = mapper.map(0.0).index;
        assert_ne!(planned, mapper.map(25.0).index);
        assert!(!map.bursts.is_empty());
        assert!(map.bursts.iter().all(|burst| burst.mcs_index == planned));
        ss.on_map_received(ul_map.payload).await.unwrap();

        ss.on_new_frame(0).await.unwrap();
        let sent = drain(&mut ss_rx);
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|request| request.mcs_index == planned));
        assert_eq!(sent.iter().map(|request| request.payload_bits).sum::<u64>(), 800);

        // Every burst stays inside a region of the map
        for request in &sent {
            let resource = request.resource;
            assert!(map.bursts.iter().any(|burst| burst.sub_channel == resource.sub_channel
                && burst.start_symbol <= resource.start_symbol
                && resource.start_symbol + resource.symbols <= burst.start_symbol + burst.symbols));
        }
        assert_eq!(ss.backlog_bits(ConnectionId(20)).await, 0);
    }

    #[tokio::test]
    async fn test_dead_station_released() {
        let mut config = MacConfig::base_station(BS);
        config.dead_station = DeadStationConfig { check_interval: 5, time_to_live: 5 };
        let (bs, _phy_rx, mut telemetry_rx) = layer(config);

        bs.admit(spec(10, SS, Direction::Downlink, StationClass::UserTerminal)).await.unwrap();
        let mut released = Vec::new();
        for frame in 0..6 {
            released.extend(bs.on_new_frame(frame).await.unwrap().released);
        }
        assert_eq!(released, vec![ConnectionId(10)]);
        assert_eq!(bs.connection_count().await, 0);

        let mut recorder = TelemetryRecorder::new();
        recorder.drain_from(&mut telemetry_rx);
        assert_eq!(recorder.sum(names::DEAD_STATION_REMOVED), 1.0);
    }

    #[tokio::test]
    async fn test_power_override_lives_with_connection() {
        let mut config = MacConfig::base_station(BS);
        config.power_overrides.insert(ConnectionId(10), Dbm(20.0));
        let (mut bs, mut phy_rx, _telemetry_rx) = layer(config);
        bs.initialize().await.unwrap();
        bs.admit(spec(10, SS, Direction::Downlink, StationClass::UserTerminal)).await.unwrap();
        bs.on_measurement(measurement(0, Direction::Downlink)).await.unwrap();
        bs.process_downlink(ConnectionId(10), Bytes::from(vec![0u8; 50])).await.unwrap();

        bs.on_new_frame(0).await.unwrap();
        let data = drain(&mut phy_rx)
            .into_iter()
            .find(|r| r.kind == TransmissionKind::Data(Direction::Downlink))
            .unwrap();
        assert_eq!(data.tx_power, Dbm(20.0));

        assert_eq!(bs.release_station(SS).await, vec![ConnectionId(10)]);
        {
            let engine = bs.engine.lock().await;
            let state = &engine.state;
            assert_eq!(state.power.tx_power(ConnectionId(10), StationClass::AccessPoint), Dbm(30.0));
            assert_eq!(state.released.downlink, vec![ConnectionId(10)]);
        }

        // The data phases hand released connections to their schedulers
        bs.on_new_frame(1).await.unwrap();
        {
            let engine = bs.engine.lock().await;
            assert!(engine.state.released.downlink.is_empty());
            assert!(engine.state.released.uplink.is_empty());
        }

        // Readmission applies the configured override again
        bs.admit(spec(10, SS, Direction::Downlink, StationClass::UserTerminal)).await.unwrap();
        let engine = bs.engine.lock().await;
        assert_eq!(engine.state.power.tx_power(ConnectionId(10), StationClass::AccessPoint), Dbm(20.0));
    }

    #[test]
    fn test_subscriber_needs_serving_station() {
        let mut config = MacConfig::subscriber_station(SS, BS);
        config.serving_station = None;
        let (phy, _rx) = ChannelPhy::channel();
        let result = MacLayer::with_defaults(config, Box::new(phy), Box::new(interfaces::NullSink));
        assert!(matches!(result, Err(LayerError::ConfigurationError(_))));
    }
}
