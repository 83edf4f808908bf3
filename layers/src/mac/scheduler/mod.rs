//! Resource Scheduler
//!
//! One instance per data phase and direction. Each run turns the backlog of the
//! direction's connections into grants on the phase's sub-channel × symbol
//! grid: priority classes in order, candidates ordered by the sub-strategy,
//! grouped for SDMA, placed by the DSA policy and filled with queue segments.

pub mod apc;
pub mod dsa;
pub mod grouping;
pub mod queue;
pub mod strategy;

use crate::mac::connection::ConnectionRegistry;
use crate::mac::error_model::ErrorRateModel;
use crate::mac::interference_cache::InterferenceCache;
use crate::mac::link_quality::{LinkQualityMapper, Mcs};
use crate::mac::map::MapMessage;
use crate::LayerError;
use common::types::{ConnectionId, Dbm, Direction, StationClass, StationId};
use common::utils::ceil_div;
use interfaces::telemetry::names;
use interfaces::{BacklogProvider, Segment, TelemetrySample, TelemetrySink};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub use apc::{NominalPower, PowerCapabilities, PowerControl, PowerProfiles};
pub use dsa::{DsaStrategy, LinearFirstFit, Placement, ResourceRequest, SlaveDsa};
pub use grouping::{GroupingConfig, InterferenceEstimator, SdmaGrouper};
pub use queue::{BandwidthRequestProxy, EnqueueOutcome, QueueConfig, SegmentingQueue};
pub use strategy::{Candidate, PriorityClasses, SubStrategy, SubStrategyKind};

/// Configured DSA policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DsaKind {
    /// Master side: lowest free sub-channel first
    LinearFirstFit { random_start: bool },
    /// Slave side: regions granted by the master's map
    Slave,
}

/// Settings of one scheduler instance
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub direction: Direction,
    pub sub_channels: u16,
    pub data_subcarriers: u16,
    pub symbol_duration: Duration,
    pub grouping: GroupingConfig,
    pub sub_strategy: SubStrategyKind,
    pub dsa: DsaKind,
    pub priority: PriorityClasses,
    /// Station running the scheduler
    pub own_station: StationId,
    /// Class of the station running the scheduler
    pub own_class: StationClass,
    /// Seed of the DSA's random start
    pub seed: u64,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.sub_channels == 0 || self.data_subcarriers == 0 {
            return Err(LayerError::ConfigurationError("scheduler grid has no sub-channels".into()));
        }
        if self.symbol_duration.is_zero() {
            return Err(LayerError::ConfigurationError("scheduler symbol duration is zero".into()));
        }
        if self.grouping.max_beams == 0 {
            return Err(LayerError::ConfigurationError("maximum beam count must be positive".into()));
        }
        if self.priority.is_empty() {
            return Err(LayerError::ConfigurationError("no priority classes".into()));
        }
        self.priority.validate()
    }
}

/// Occupancy of the phase's sub-channel × symbol grid
#[derive(Debug, Clone)]
pub struct ResourceGrid {
    phase_symbols: u32,
    next_free: Vec<u32>,
}

impl ResourceGrid {
    pub fn new(sub_channels: u16, phase_symbols: u32) -> Self {
        Self { phase_symbols, next_free: vec![0; sub_channels as usize] }
    }

    pub fn sub_channels(&self) -> u16 {
        self.next_free.len() as u16
    }

    pub fn phase_symbols(&self) -> u32 {
        self.phase_symbols
    }

    /// First unused symbol of a sub-channel
    pub fn next_free(&self, sub_channel: u16) -> u32 {
        self.next_free.get(sub_channel as usize).copied().unwrap_or(self.phase_symbols)
    }

    pub fn free_symbols(&self, sub_channel: u16) -> u32 {
        self.phase_symbols.saturating_sub(self.next_free(sub_channel))
    }

    /// Latest used symbol end across sub-channels
    pub fn max_end(&self) -> u32 {
        self.next_free.iter().copied().max().unwrap_or(0)
    }

    /// Nothing before `symbol` may be used any more
    pub fn set_floor(&mut self, symbol: u32) {
        for next in &mut self.next_free {
            *next = (*next).max(symbol);
        }
    }

    pub fn reserve(&mut self, placement: &Placement) {
        if let Some(next) = self.next_free.get_mut(placement.sub_channel as usize) {
            *next = (*next).max(placement.start_symbol + placement.symbols);
        }
    }
}

/// Resource granted to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub cid: ConnectionId,
    pub station: StationId,
    pub sub_channel: u16,
    pub beam: u8,
    /// Symbol offset from the phase start
    pub start_symbol: u32,
    pub symbols: u32,
    pub mcs: Mcs,
    pub tx_power: Dbm,
    /// Bits the resource carries at `mcs`
    pub capacity_bits: u64,
    /// Queue segments sent in the grant
    pub segments: Vec<Segment>,
}

impl Grant {
    /// On-air bits of the segments
    pub fn used_bits(&self) -> u64 {
        self.segments.iter().map(Segment::total_bits).sum()
    }

    pub fn overlaps(&self, other: &Grant) -> bool {
        self.sub_channel == other.sub_channel
            && self.start_symbol < other.start_symbol + other.symbols
            && other.start_symbol < self.start_symbol + self.symbols
    }
}

/// Result of one scheduling run
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingMap {
    pub direction: Direction,
    pub frame: u64,
    pub phase_symbols: u32,
    pub sub_channels: u16,
    pub grants: Vec<Grant>,
    /// Connections with backlog left unserved because their link is too poor
    pub deferred: Vec<ConnectionId>,
}

impl SchedulingMap {
    pub fn grants_for(&self, cid: ConnectionId) -> impl Iterator<Item = &Grant> {
        self.grants.iter().filter(move |grant| grant.cid == cid)
    }

    /// Payload bits granted to a connection
    pub fn granted_payload_bits(&self, cid: ConnectionId) -> u64 {
        self.grants_for(cid).flat_map(|grant| grant.segments.iter()).map(|segment| segment.payload_bits).sum()
    }
}

/// Everything a run reads or drains besides the scheduler's own state
pub struct SchedulingInput<'a> {
    pub frame: u64,
    pub phase_symbols: u32,
    /// Offset of the data phase from the frame start
    pub phase_offset: Duration,
    pub connections: &'a ConnectionRegistry,
    pub backlog: &'a mut dyn BacklogProvider,
    pub mapper: &'a dyn LinkQualityMapper,
    pub error_model: &'a dyn ErrorRateModel,
    pub interference: &'a InterferenceCache,
    pub power: &'a dyn PowerControl,
    /// UL-MAP of the current frame for slave-side scheduling
    pub master_map: Option<&'a MapMessage>,
    pub telemetry: &'a mut dyn TelemetrySink,
}

/// Per-phase resource scheduler
pub struct ResourceScheduler {
    config: SchedulerConfig,
    sub_strategy: Box<dyn SubStrategy>,
    dsa: Box<dyn DsaStrategy>,
    grouper: SdmaGrouper,
}

impl ResourceScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, LayerError> {
        config.validate()?;
        let sub_strategy = config.sub_strategy.build()?;
        let dsa: Box<dyn DsaStrategy> = match config.dsa {
            DsaKind::LinearFirstFit { random_start } => Box::new(LinearFirstFit::new(random_start, config.seed)),
            DsaKind::Slave => Box::new(SlaveDsa::new(config.own_station)),
        };
        let grouper = SdmaGrouper::new(config.grouping);

        debug!("{} scheduler: {} sub-channels, {:?}, {:?}, {} priority classes",
               config.direction, config.sub_channels, config.sub_strategy, config.dsa, config.priority.len());

        Ok(Self { config, sub_strategy, dsa, grouper })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// A connection was released
    pub fn forget(&mut self, cid: ConnectionId) {
        self.sub_strategy.forget(cid);
    }

    /// Produce this frame's grants
    pub fn schedule(&mut self, mut input: SchedulingInput<'_>) -> SchedulingMap {
        let direction = self.config.direction;
        let mut grid = ResourceGrid::new(self.config.sub_channels, input.phase_symbols);
        self.dsa.initialize(&grid, input.master_map);

        let mut map = SchedulingMap {
            direction,
            frame: input.frame,
            phase_symbols: input.phase_symbols,
            sub_channels: self.config.sub_channels,
            grants: Vec::new(),
            deferred: Vec::new(),
        };

        let mut classes: Vec<Vec<Candidate>> = vec![Vec::new(); self.config.priority.len()];
        for connection in input.connections.in_direction(direction) {
            let cid = connection.cid();
            let backlog_bits = input.backlog.backlog_cost_bits(cid);
            if backlog_bits == 0 {
                continue;
            }

            let servable = match (connection.sinr, connection.mcs) {
                (Some(sinr), Some(mcs)) if input.mapper.is_servable(sinr) => Some((sinr, mcs)),
                _ => None,
            };
            let Some((sinr, mcs)) = servable.filter(|(_, mcs)| mcs.bits_per_unit(self.config.data_subcarriers) > 0) else {
                warn!(cid = cid.value(), backlog_bits, "Link not servable (SINR {:?}), deferred", connection.sinr);
                input.telemetry.emit(TelemetrySample::for_connection(names::SCHEDULER_DEFERRED, input.frame, cid, 1.0));
                map.deferred.push(cid);
                continue;
            };

            let class = self.config.priority.class_of(connection.spec.qos);
            classes[class].push(Candidate {
                cid,
                station: connection.station(),
                qos: connection.spec.qos,
                station_class: connection.spec.station_class,
                mcs,
                sinr,
                backlog_bits,
                bits_per_unit: mcs.bits_per_unit(self.config.data_subcarriers),
            });
        }

        for (class, mut candidates) in classes.into_iter().enumerate() {
            if candidates.is_empty() {
                continue;
            }
            if !self.dsa.follows_master() {
                // Later classes start after everything earlier classes used
                let floor = grid.max_end();
                if input.phase_symbols.saturating_sub(floor) < 1 {
                    debug!("Frame {}: class {} skipped, {} candidates without room", input.frame, class, candidates.len());
                    continue;
                }
                grid.set_floor(floor);
            }

            self.sub_strategy.order(class, &mut candidates);
            let groups = self.grouper.group(&candidates, input.interference);
            self.serve_groups(&candidates, &groups, &mut grid, &mut input, &mut map);
        }
        self.sub_strategy.frame_complete();

        for connection in input.connections.in_direction(direction) {
            let queued = input.backlog.backlog_bits(connection.cid());
            input.telemetry.emit(TelemetrySample::for_connection(names::BUFFER_SIZE, input.frame, connection.cid(), queued as f64));
        }

        debug!("Frame {} {} schedule: {} grants, {} deferred, {} of {} symbols used",
               input.frame, direction, map.grants.len(), map.deferred.len(), grid.max_end(), input.phase_symbols);
        map
    }

    fn serve_groups(
        &mut self,
        candidates: &[Candidate],
        groups: &[Vec<usize>],
        grid: &mut ResourceGrid,
        input: &mut SchedulingInput<'_>,
        map: &mut SchedulingMap,
    ) {
        let drains_first = self.sub_strategy.drains_first();
        loop {
            let mut progress = false;
            for group in groups {
                loop {
                    let members: Vec<&Candidate> = group
                        .iter()
                        .map(|&index| &candidates[index])
                        .filter(|candidate| input.backlog.backlog_cost_bits(candidate.cid) > 0)
                        .collect();
                    let Some(leader) = members.first() else { break };

                    // A slave sizes its request at the MCS the master put in the map
                    let assigned = match self.dsa.assigned_mcs(leader.cid) {
                        Some(index) => match self.resolve_mcs(index, input.mapper) {
                            Some(mcs) => Some(mcs),
                            None => break,
                        },
                        None => None,
                    };
                    let data_subcarriers = self.config.data_subcarriers;
                    let symbols_for = |bits: u64, candidate: &Candidate| {
                        let bits_per_unit = assigned
                            .map_or(candidate.bits_per_unit, |mcs| mcs.bits_per_unit(data_subcarriers));
                        ceil_div(bits, bits_per_unit as u64).min(u32::MAX as u64) as u32
                    };
                    let request = ResourceRequest {
                        cid: leader.cid,
                        station: leader.station,
                        min_symbols: members
                            .iter()
                            .map(|c| symbols_for(input.backlog.min_grant_bits(c.cid), c))
                            .max()
                            .unwrap_or(1)
                            .max(1),
                        wanted_symbols: members
                            .iter()
                            .map(|c| symbols_for(input.backlog.backlog_cost_bits(c.cid), c))
                            .max()
                            .unwrap_or(1)
                            .max(1),
                    };
                    let Some(placement) = self.dsa.select(&request, grid) else { break };

                    let mut used_symbols = 0;
                    for (beam, candidate) in members.iter().enumerate() {
                        if let Some(grant) = self.fill_grant(candidate, beam as u8, &placement, input) {
                            used_symbols = used_symbols.max(grant.symbols);
                            map.grants.push(grant);
                        }
                    }
                    if used_symbols == 0 {
                        break;
                    }
                    grid.reserve(&Placement { symbols: used_symbols, ..placement });
                    progress = true;

                    if !drains_first {
                        break;
                    }
                }
            }
            if !progress {
                break;
            }
        }
    }

    /// Cut segments for one beam of a placement and shrink it to what they use
    fn fill_grant(
        &mut self,
        candidate: &Candidate,
        beam: u8,
        placement: &Placement,
        input: &mut SchedulingInput<'_>,
    ) -> Option<Grant> {
        let (mcs, bits_per_unit) = match placement.mcs_index {
            Some(index) => {
                let mcs = self.resolve_mcs(index, input.mapper)?;
                (mcs, mcs.bits_per_unit(self.config.data_subcarriers) as u64)
            }
            None => (candidate.mcs, candidate.bits_per_unit as u64),
        };
        let capacity = placement.symbols as u64 * bits_per_unit;

        let mut segments = Vec::new();
        let mut left = capacity;
        while left > 0 {
            let Some(segment) = input.backlog.dequeue_segment(candidate.cid, left) else { break };
            left = left.saturating_sub(segment.total_bits());
            segments.push(segment);
        }
        if segments.is_empty() {
            return None;
        }

        let used = capacity - left;
        let symbols = ceil_div(used, bits_per_unit) as u32;
        let grant = Grant {
            cid: candidate.cid,
            station: candidate.station,
            sub_channel: placement.sub_channel,
            beam,
            start_symbol: placement.start_symbol,
            symbols,
            mcs,
            tx_power: input.power.tx_power(candidate.cid, self.transmitter_class(candidate)),
            capacity_bits: symbols as u64 * bits_per_unit,
            segments,
        };

        self.sub_strategy.served(candidate.cid, used);
        self.report_grant(&grant, candidate, input);
        trace!(cid = candidate.cid.value(), bits = used,
               "Grant sub-channel {} beam {} symbols {}+{} at {}",
               grant.sub_channel, beam, grant.start_symbol, grant.symbols, grant.mcs);
        Some(grant)
    }

    /// Catalogue entry of an MCS index taken from the master's map
    fn resolve_mcs(&self, index: u8, mapper: &dyn LinkQualityMapper) -> Option<Mcs> {
        match mapper.by_index(index) {
            Some(mcs) if mcs.bits_per_unit(self.config.data_subcarriers) > 0 => Some(mcs),
            Some(mcs) => {
                warn!("{} from the master's map carries no data on {} sub-carriers", mcs, self.config.data_subcarriers);
                None
            }
            None => {
                warn!("Unknown MCS index {} in the master's map", index);
                None
            }
        }
    }

    /// A master scheduling the uplink plans the peer's transmission
    fn transmitter_class(&self, candidate: &Candidate) -> StationClass {
        if self.config.direction == Direction::Uplink && !self.dsa.follows_master() {
            candidate.station_class
        } else {
            self.config.own_class
        }
    }

    fn report_grant(&self, grant: &Grant, candidate: &Candidate, input: &mut SchedulingInput<'_>) {
        let frame = input.frame;
        let cid = grant.cid;
        let symbol = self.config.symbol_duration;
        let offset = input.phase_offset + symbol * grant.start_symbol;
        let duration = symbol * grant.symbols;

        // Without a measurement of the pair the SINR the grant was sized from is the best guess
        let estimate = input
            .interference
            .has_measurement(candidate.station, self.config.own_station)
            .then(|| input.interference.estimate(candidate.station, self.config.own_station))
            .flatten();
        let cir = estimate.map_or(candidate.sinr, |estimate| estimate.cir().0);
        let per = input.error_model.packet_error_rate(&grant.mcs, cir, grant.used_bits());

        let telemetry = &mut *input.telemetry;
        telemetry.emit(TelemetrySample::for_connection(names::FRAME_OFFSET_DELAY, frame, cid, offset.as_secs_f64()));
        telemetry.emit(TelemetrySample::for_connection(names::TRANSMISSION_DELAY, frame, cid, duration.as_secs_f64()));
        telemetry.emit(TelemetrySample::for_connection(names::GRANT_SINR, frame, cid, candidate.sinr));
        telemetry.emit(TelemetrySample::for_connection(names::GRANT_CIR, frame, cid, cir));
        if let Some(estimate) = estimate {
            telemetry.emit(TelemetrySample::for_connection(names::GRANT_CARRIER, frame, cid, estimate.carrier.0));
            telemetry.emit(TelemetrySample::for_connection(names::GRANT_INTERFERENCE, frame, cid, estimate.interference.0));
        }
        telemetry.emit(TelemetrySample::for_connection(names::GRANT_PER, frame, cid, per));
    }
}
