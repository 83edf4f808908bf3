//! MAC Phase Handlers
//!
//! Handlers bound to the timeline's frame head, MAP and data phases. They share
//! the station's MAC state as assembler context; the order in which they touch
//! it is fixed by the timeline alone.

use super::connection::ConnectionRegistry;
use super::dead_station::DeadStationDetector;
use super::error_model::ErrorRateModel;
use super::interference_cache::InterferenceCache;
use super::link_quality::LinkQualityMapper;
use super::map::MapMessage;
use super::scheduler::{
    BandwidthRequestProxy, NominalPower, PowerControl, ResourceScheduler, SchedulingInput, SchedulingMap,
    SegmentingQueue,
};
use crate::frame::{FrameParameters, PhaseHandler, PhaseWindow};
use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};
use common::types::{ConnectionId, Dbm, Direction, OperationMode, StationId, StationRole};
use interfaces::telemetry::names;
use interfaces::{
    BacklogProvider, PhyService, ResourceDescriptor, TelemetrySample, TelemetrySink, TransmissionKind,
    TransmissionRequest,
};
use tracing::{debug, trace, warn};

/// A value per link direction
#[derive(Debug, Default, Clone)]
pub struct PerDirection<T> {
    pub downlink: T,
    pub uplink: T,
}

impl<T> PerDirection<T> {
    pub fn get(&self, direction: Direction) -> &T {
        match direction {
            Direction::Downlink => &self.downlink,
            Direction::Uplink => &self.uplink,
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut T {
        match direction {
            Direction::Downlink => &mut self.downlink,
            Direction::Uplink => &mut self.uplink,
        }
    }
}

/// MAC state shared by the phase handlers of one station
pub struct MacState {
    pub station: StationId,
    pub role: StationRole,
    /// Base station a subscriber station is attached to
    pub serving_station: Option<StationId>,
    /// Frame being assembled
    pub frame: u64,
    pub params: FrameParameters,
    pub connections: ConnectionRegistry,
    pub interference: InterferenceCache,
    pub mapper: Box<dyn LinkQualityMapper>,
    pub error_model: Box<dyn ErrorRateModel>,
    pub power: NominalPower,
    /// Data this station sends
    pub queue: SegmentingQueue,
    /// Stand-in uplink backlog, base station only
    pub bandwidth_requests: Option<BandwidthRequestProxy>,
    pub dead_stations: DeadStationDetector,
    pub schedules: PerDirection<Option<SchedulingMap>>,
    /// Connections released since the direction's data phase last ran
    pub released: PerDirection<Vec<ConnectionId>>,
    /// MAPs received from the base station
    pub received_maps: PerDirection<Option<MapMessage>>,
    pub phy: Box<dyn PhyService>,
    pub telemetry: Box<dyn TelemetrySink>,
}

impl MacState {
    /// Received MAP of a direction, if it belongs to the given frame
    pub fn current_map(&self, direction: Direction, frame: u64) -> Option<&MapMessage> {
        self.received_maps.get(direction).as_ref().filter(|map| map.frame == frame)
    }

    fn broadcast_power(&self) -> Dbm {
        self.power.tx_power(ConnectionId(0), self.role.station_class())
    }
}

fn broadcast_resource(window: &PhaseWindow) -> ResourceDescriptor {
    ResourceDescriptor {
        sub_channel: 0,
        beam: 0,
        start_symbol: 0,
        symbols: window.symbols(),
        offset: window.offset,
        duration: window.duration,
    }
}

/// Preamble and frame control header
#[derive(Debug, Default)]
pub struct FrameHeadPhase;

impl PhaseHandler<MacState> for FrameHeadPhase {
    fn start(&mut self, ctx: &mut MacState, window: &PhaseWindow) -> Result<(), LayerError> {
        if window.mode != OperationMode::Sending {
            trace!("Frame {}: receiving frame head", window.frame);
            return Ok(());
        }

        let mut payload = BytesMut::with_capacity(12);
        payload.put_u32(ctx.station.value());
        payload.put_u64(window.frame);
        let payload = payload.freeze();

        let request = TransmissionRequest {
            frame: window.frame,
            source: ctx.station,
            destination: None,
            cid: None,
            kind: TransmissionKind::FrameHead,
            payload_bits: payload.len() as u64 * 8,
            payload,
            resource: broadcast_resource(window),
            mcs_index: ctx.mapper.lowest().index,
            tx_power: ctx.broadcast_power(),
        };
        ctx.phy.transmit(request)?;
        Ok(())
    }
}

/// DL-MAP or UL-MAP broadcast
#[derive(Debug)]
pub struct MapPhase {
    direction: Direction,
    pending: Option<(MapMessage, Bytes)>,
}

impl MapPhase {
    pub fn new(direction: Direction) -> Self {
        Self { direction, pending: None }
    }
}

impl PhaseHandler<MacState> for MapPhase {
    fn finish_collection(&mut self, ctx: &mut MacState, window: &PhaseWindow) -> Result<(), LayerError> {
        if window.mode != OperationMode::Sending {
            return Ok(());
        }

        let schedule = ctx
            .schedules
            .get(self.direction)
            .as_ref()
            .filter(|schedule| schedule.frame == window.frame)
            .ok_or_else(|| LayerError::InvalidState(format!(
                "{}-MAP of frame {} assembled before its scheduler ran", self.direction, window.frame
            )))?;

        let map = MapMessage::from_schedule(ctx.station, schedule, ctx.params.symbol_duration);
        let encoded = map.encode()?;

        let bits_per_symbol = ctx.mapper.lowest().bits_per_unit(ctx.params.data_subcarriers) as u64
            * ctx.params.sub_channels as u64;
        let needed = map.duration_symbols(bits_per_symbol);
        if needed > window.symbols() as u64 {
            warn!("Frame {}: {}-MAP needs {} symbols, phase has {}", window.frame, self.direction, needed, window.symbols());
        }
        ctx.telemetry.emit(TelemetrySample::new(names::MAP_SIZE, window.frame, map.size_bits() as f64));

        debug!("Frame {}: {}-MAP with {} bursts, {} bits", window.frame, self.direction, map.bursts.len(), map.size_bits());
        self.pending = Some((map, encoded));
        Ok(())
    }

    fn start(&mut self, ctx: &mut MacState, window: &PhaseWindow) -> Result<(), LayerError> {
        if window.mode != OperationMode::Sending {
            match ctx.current_map(self.direction, window.frame) {
                Some(map) => trace!("Frame {}: {}-MAP received, {} bursts for {}",
                                    window.frame, self.direction, map.bursts_for_station(ctx.station).count(), ctx.station),
                None => trace!("Frame {}: no {}-MAP received", window.frame, self.direction),
            }
            return Ok(());
        }

        let Some((map, payload)) = self.pending.take() else {
            return Err(LayerError::InvalidState(format!("{}-MAP started without being built", self.direction)));
        };
        let request = TransmissionRequest {
            frame: window.frame,
            source: ctx.station,
            destination: None,
            cid: None,
            kind: TransmissionKind::Map(self.direction),
            payload,
            payload_bits: map.size_bits(),
            resource: broadcast_resource(window),
            mcs_index: ctx.mapper.lowest().index,
            tx_power: ctx.broadcast_power(),
        };
        ctx.phy.transmit(request)?;
        Ok(())
    }
}

/// Where a data phase's scheduler takes its backlog from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogSource {
    LocalQueue,
    BandwidthRequests,
}

/// Downlink or uplink data phase
pub struct DataPhase {
    direction: Direction,
    scheduler: Option<ResourceScheduler>,
    backlog: BacklogSource,
}

impl DataPhase {
    /// Phase that schedules its direction
    pub fn scheduling(direction: Direction, scheduler: ResourceScheduler, backlog: BacklogSource) -> Self {
        Self { direction, scheduler: Some(scheduler), backlog }
    }

    /// Phase that only receives
    pub fn receiving(direction: Direction) -> Self {
        Self { direction, scheduler: None, backlog: BacklogSource::LocalQueue }
    }
}

impl PhaseHandler<MacState> for DataPhase {
    fn start_collection(&mut self, ctx: &mut MacState, window: &PhaseWindow) -> Result<(), LayerError> {
        if self.backlog == BacklogSource::BandwidthRequests {
            if let Some(proxy) = ctx.bandwidth_requests.as_mut() {
                proxy.wakeup(window.frame, ctx.telemetry.as_mut());
            }
        }
        Ok(())
    }

    fn finish_collection(&mut self, ctx: &mut MacState, window: &PhaseWindow) -> Result<(), LayerError> {
        let released = std::mem::take(ctx.released.get_mut(self.direction));
        let Some(scheduler) = self.scheduler.as_mut() else {
            return Ok(());
        };
        for cid in released {
            scheduler.forget(cid);
        }

        let MacState {
            connections,
            interference,
            mapper,
            error_model,
            power,
            queue,
            bandwidth_requests,
            schedules,
            received_maps,
            telemetry,
            ..
        } = ctx;

        let backlog: &mut dyn BacklogProvider = match self.backlog {
            BacklogSource::LocalQueue => queue,
            BacklogSource::BandwidthRequests => bandwidth_requests
                .as_mut()
                .ok_or_else(|| LayerError::InvalidState("no bandwidth request proxy".into()))?,
        };
        let master_map = received_maps
            .get(self.direction)
            .as_ref()
            .filter(|map| map.frame == window.frame);

        let schedule = scheduler.schedule(SchedulingInput {
            frame: window.frame,
            phase_symbols: window.symbols(),
            phase_offset: window.offset,
            connections: &*connections,
            backlog,
            mapper: &**mapper,
            error_model: &**error_model,
            interference: &*interference,
            power: &*power,
            master_map,
            telemetry: &mut **telemetry,
        });
        *schedules.get_mut(self.direction) = Some(schedule);
        Ok(())
    }

    fn start(&mut self, ctx: &mut MacState, window: &PhaseWindow) -> Result<(), LayerError> {
        let Some(schedule) = ctx.schedules.get(self.direction).as_ref().filter(|s| s.frame == window.frame) else {
            trace!("Frame {}: {} data phase without own schedule", window.frame, self.direction);
            return Ok(());
        };

        if window.mode != OperationMode::Sending {
            debug!("Frame {}: expecting {} {} bursts", window.frame, schedule.grants.len(), self.direction);
            return Ok(());
        }

        let mut requests = Vec::with_capacity(schedule.grants.len());
        for grant in &schedule.grants {
            let mut payload = BytesMut::new();
            for segment in &grant.segments {
                payload.extend_from_slice(&segment.data);
            }
            requests.push(TransmissionRequest {
                frame: window.frame,
                source: ctx.station,
                destination: Some(grant.station),
                cid: Some(grant.cid),
                kind: TransmissionKind::Data(self.direction),
                payload: payload.freeze(),
                payload_bits: grant.used_bits(),
                resource: ResourceDescriptor {
                    sub_channel: grant.sub_channel,
                    beam: grant.beam,
                    start_symbol: grant.start_symbol,
                    symbols: grant.symbols,
                    offset: window.symbol_offset(grant.start_symbol),
                    duration: ctx.params.symbols(grant.symbols),
                },
                mcs_index: grant.mcs.index,
                tx_power: grant.tx_power,
            });
        }

        debug!("Frame {}: sending {} {} bursts", window.frame, requests.len(), self.direction);
        for request in requests {
            ctx.phy.transmit(request)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PhaseId;
    use crate::mac::dead_station::DeadStationConfig;
    use crate::mac::error_model::TableErrorModel;
    use crate::mac::interference_cache::InterferenceCacheConfig;
    use crate::mac::link_quality::IntervalMapper;
    use crate::mac::scheduler::QueueConfig;
    use interfaces::{ChannelPhy, NullSink};
    use std::time::Duration;

    fn state() -> (MacState, tokio::sync::mpsc::UnboundedReceiver<TransmissionRequest>) {
        let (phy, rx) = ChannelPhy::channel();
        let state = MacState {
            station: StationId(1),
            role: StationRole::BaseStation,
            serving_station: None,
            frame: 0,
            params: FrameParameters::default(),
            connections: ConnectionRegistry::new(),
            interference: InterferenceCache::new(InterferenceCacheConfig::default()),
            mapper: Box::new(IntervalMapper::wimax().unwrap()),
            error_model: Box::new(TableErrorModel::wimax().unwrap()),
            power: NominalPower::default(),
            queue: SegmentingQueue::new(QueueConfig::default()),
            bandwidth_requests: None,
            dead_stations: DeadStationDetector::new(DeadStationConfig::default()),
            schedules: PerDirection::default(),
            released: PerDirection::default(),
            received_maps: PerDirection::default(),
            phy: Box::new(phy),
            telemetry: Box::new(NullSink),
        };
        (state, rx)
    }

    fn window(frame: u64) -> PhaseWindow {
        PhaseWindow {
            frame,
            phase: PhaseId(1),
            mode: OperationMode::Sending,
            offset: Duration::from_micros(100),
            duration: Duration::from_micros(100),
            symbol_duration: Duration::from_micros(100),
        }
    }

    #[test]
    fn test_map_before_schedule_is_invalid_state() {
        let (mut ctx, _rx) = state();
        let mut phase = MapPhase::new(Direction::Downlink);
        let result = phase.finish_collection(&mut ctx, &window(0));
        assert!(matches!(result, Err(LayerError::InvalidState(_))));
    }

    #[test]
    fn test_stale_schedule_is_not_broadcast() {
        let (mut ctx, _rx) = state();
        ctx.schedules.downlink = Some(SchedulingMap {
            direction: Direction::Downlink,
            frame: 4,
            phase_symbols: 21,
            sub_channels: 96,
            grants: Vec::new(),
            deferred: Vec::new(),
        });
        let mut phase = MapPhase::new(Direction::Downlink);
        assert!(phase.finish_collection(&mut ctx, &window(5)).is_err());
        assert!(phase.finish_collection(&mut ctx, &window(4)).is_ok());
    }

    #[test]
    fn test_map_broadcast_decodes() {
        let (mut ctx, mut rx) = state();
        ctx.schedules.uplink = Some(SchedulingMap {
            direction: Direction::Uplink,
            frame: 2,
            phase_symbols: 21,
            sub_channels: 96,
            grants: Vec::new(),
            deferred: Vec::new(),
        });
        let mut phase = MapPhase::new(Direction::Uplink);
        phase.finish_collection(&mut ctx, &window(2)).unwrap();
        phase.start(&mut ctx, &window(2)).unwrap();

        let request = rx.try_recv().unwrap();
        assert_eq!(request.kind, TransmissionKind::Map(Direction::Uplink));
        assert_eq!(request.payload_bits, 56);
        let map = MapMessage::decode(&request.payload).unwrap();
        assert_eq!((map.frame, map.base_station), (2, StationId(1)));

        // A MAP is sent once per build
        assert!(phase.start(&mut ctx, &window(2)).is_err());
    }

    #[test]
    fn test_frame_head_payload() {
        let (mut ctx, mut rx) = state();
        FrameHeadPhase.start(&mut ctx, &window(9)).unwrap();
        let request = rx.try_recv().unwrap();
        assert_eq!(request.kind, TransmissionKind::FrameHead);
        assert_eq!(request.payload.len(), 12);
        assert_eq!(&request.payload[4..], &9u64.to_be_bytes());

        let receiving = PhaseWindow { mode: OperationMode::Receiving, ..window(10) };
        FrameHeadPhase.start(&mut ctx, &receiving).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
