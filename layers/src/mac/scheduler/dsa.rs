//! Dynamic Sub-channel Assignment
//!
//! Chooses where in the time/frequency grid a grant goes. The master side
//! fills sub-channels linearly; the slave side may only use the regions the
//! master's UL-MAP assigned to this station.

use super::ResourceGrid;
use crate::mac::map::MapMessage;
use common::types::{ConnectionId, StationId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Resource wanted for one grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub cid: ConnectionId,
    pub station: StationId,
    /// Smallest useful number of symbols
    pub min_symbols: u32,
    /// Symbols needed to drain the backlog
    pub wanted_symbols: u32,
}

/// Selected grid region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub sub_channel: u16,
    /// Symbol offset from the phase start
    pub start_symbol: u32,
    pub symbols: u32,
    /// MCS the master assigned to the region, if it dictates one
    pub mcs_index: Option<u8>,
}

/// Sub-channel selection policy
pub trait DsaStrategy: Send {
    /// Prepare for a new scheduling run
    fn initialize(&mut self, grid: &ResourceGrid, master: Option<&MapMessage>);

    /// Pick a region for a request, or `None` if nothing fits
    fn select(&mut self, request: &ResourceRequest, grid: &ResourceGrid) -> Option<Placement>;

    /// Placements come from the master's map rather than from the free grid
    fn follows_master(&self) -> bool {
        false
    }

    /// MCS the master assigned to the region `cid` would be placed in next
    fn assigned_mcs(&self, _cid: ConnectionId) -> Option<u8> {
        None
    }
}

/// Lowest free sub-channel first, starting at 0 or at a random channel
pub struct LinearFirstFit {
    random_start: bool,
    rng: StdRng,
    last_used: u16,
}

impl LinearFirstFit {
    pub fn new(random_start: bool, seed: u64) -> Self {
        Self { random_start, rng: StdRng::seed_from_u64(seed), last_used: 0 }
    }
}

impl DsaStrategy for LinearFirstFit {
    fn initialize(&mut self, grid: &ResourceGrid, _master: Option<&MapMessage>) {
        self.last_used = if self.random_start && grid.sub_channels() > 0 {
            self.rng.gen_range(0..grid.sub_channels())
        } else {
            0
        };
    }

    fn select(&mut self, request: &ResourceRequest, grid: &ResourceGrid) -> Option<Placement> {
        let channels = grid.sub_channels();
        for step in 0..channels {
            let sub_channel = (self.last_used + step) % channels;
            let free = grid.free_symbols(sub_channel);
            if free == 0 || free < request.min_symbols {
                continue;
            }
            self.last_used = sub_channel;
            let placement = Placement {
                sub_channel,
                start_symbol: grid.next_free(sub_channel),
                symbols: request.wanted_symbols.min(free),
                mcs_index: None,
            };
            trace!("DSA {}: {:?}", request.cid, placement);
            return Some(placement);
        }
        trace!("DSA {}: no sub-channel with {} free symbols", request.cid, request.min_symbols);
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    cid: ConnectionId,
    sub_channel: u16,
    start_symbol: u32,
    symbols: u32,
    used: u32,
    mcs_index: u8,
}

impl Region {
    fn free(&self) -> u32 {
        self.symbols - self.used
    }
}

/// Uses only the regions the master granted to this station
pub struct SlaveDsa {
    station: StationId,
    regions: Vec<Region>,
}

impl SlaveDsa {
    pub fn new(station: StationId) -> Self {
        Self { station, regions: Vec::new() }
    }
}

impl DsaStrategy for SlaveDsa {
    fn initialize(&mut self, _grid: &ResourceGrid, master: Option<&MapMessage>) {
        self.regions = master
            .map(|map| {
                map.bursts_for_station(self.station)
                    .map(|burst| Region {
                        cid: burst.cid,
                        sub_channel: burst.sub_channel,
                        start_symbol: burst.start_symbol,
                        symbols: burst.symbols,
                        used: 0,
                        mcs_index: burst.mcs_index,
                    })
                    .collect()
            })
            .unwrap_or_default();
        trace!("Slave DSA: {} regions granted to {}", self.regions.len(), self.station);
    }

    fn select(&mut self, request: &ResourceRequest, _grid: &ResourceGrid) -> Option<Placement> {
        let fits = |region: &Region| region.free() >= request.min_symbols.max(1);
        let index = self
            .regions
            .iter()
            .position(|region| region.cid == request.cid && fits(region))
            .or_else(|| self.regions.iter().position(fits))?;

        let region = &mut self.regions[index];
        let symbols = request.wanted_symbols.min(region.free());
        let placement = Placement {
            sub_channel: region.sub_channel,
            start_symbol: region.start_symbol + region.used,
            symbols,
            mcs_index: Some(region.mcs_index),
        };
        region.used += symbols;
        Some(placement)
    }

    fn follows_master(&self) -> bool {
        true
    }

    fn assigned_mcs(&self, cid: ConnectionId) -> Option<u8> {
        let open = |region: &&Region| region.free() > 0;
        self.regions
            .iter()
            .filter(open)
            .find(|region| region.cid == cid)
            .or_else(|| self.regions.iter().find(open))
            .map(|region| region.mcs_index)
    }
}
