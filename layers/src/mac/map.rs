//! DL-MAP / UL-MAP Messages
//!
//! A MAP describes the grants of one data phase. It is built from the
//! scheduler's result after the scheduler has finished collecting and is
//! broadcast before the data phase starts.

use super::scheduler::SchedulingMap;
use crate::LayerError;
use bytes::Bytes;
use common::types::{ConnectionId, Direction, StationId};
use common::utils::ceil_div;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Modelled size of the MAP without information elements
pub const MAP_BASE_BITS: u64 = 56;
/// Modelled size of one burst information element
pub const MAP_BITS_PER_BURST: u64 = 48;

/// Information element of one burst
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapBurst {
    pub cid: ConnectionId,
    pub station: StationId,
    pub sub_channel: u16,
    pub beam: u8,
    /// Symbol offset from the start of the data phase
    pub start_symbol: u32,
    pub symbols: u32,
    pub mcs_index: u8,
    pub tx_power_dbm: f64,
}

/// MAP broadcast for one direction and frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMessage {
    pub direction: Direction,
    pub base_station: StationId,
    pub frame: u64,
    /// Symbols of the data phase described
    pub phase_symbols: u32,
    /// Duration of the data phase described
    pub phase_duration: Duration,
    pub bursts: Vec<MapBurst>,
}

impl MapMessage {
    /// Describe a scheduling result
    pub fn from_schedule(base_station: StationId, schedule: &SchedulingMap, symbol_duration: Duration) -> Self {
        let bursts = schedule
            .grants
            .iter()
            .map(|grant| MapBurst {
                cid: grant.cid,
                station: grant.station,
                sub_channel: grant.sub_channel,
                beam: grant.beam,
                start_symbol: grant.start_symbol,
                symbols: grant.symbols,
                mcs_index: grant.mcs.index,
                tx_power_dbm: grant.tx_power.0,
            })
            .collect();

        Self {
            direction: schedule.direction,
            base_station,
            frame: schedule.frame,
            phase_symbols: schedule.phase_symbols,
            phase_duration: symbol_duration * schedule.phase_symbols,
            bursts,
        }
    }

    /// Wire encoding
    pub fn encode(&self) -> Result<Bytes, LayerError> {
        let encoded = bincode::serialize(self)?;
        trace!("{}-MAP frame {}: {} bursts, {} bytes encoded", self.direction, self.frame, self.bursts.len(), encoded.len());
        Ok(Bytes::from(encoded))
    }

    pub fn decode(data: &[u8]) -> Result<Self, LayerError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Modelled over-the-air size
    pub fn size_bits(&self) -> u64 {
        MAP_BASE_BITS + MAP_BITS_PER_BURST * self.bursts.len() as u64
    }

    /// Symbols needed to broadcast the MAP at a given capacity per symbol
    pub fn duration_symbols(&self, bits_per_symbol: u64) -> u64 {
        ceil_div(self.size_bits(), bits_per_symbol)
    }

    /// Bursts addressed to one station
    pub fn bursts_for_station(&self, station: StationId) -> impl Iterator<Item = &MapBurst> {
        self.bursts.iter().filter(move |burst| burst.station == station)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burst(cid: u32, station: u32, sub_channel: u16) -> MapBurst {
        MapBurst {
            cid: ConnectionId(cid),
            station: StationId(station),
            sub_channel,
            beam: 0,
            start_symbol: 2,
            symbols: 5,
            mcs_index: 3,
            tx_power_dbm: 30.0,
        }
    }

    #[test]
    fn test_encoding_preserves_bursts() {
        let map = MapMessage {
            direction: Direction::Uplink,
            base_station: StationId(1),
            frame: 42,
            phase_symbols: 21,
            phase_duration: Duration::from_micros(2100),
            bursts: vec![burst(7, 10, 0), burst(8, 11, 1)],
        };
        let decoded = MapMessage::decode(&map.encode().unwrap()).unwrap();
        assert_eq!(decoded, map);
        assert!(MapMessage::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_modelled_size() {
        let mut map = MapMessage {
            direction: Direction::Downlink,
            base_station: StationId(1),
            frame: 0,
            phase_symbols: 21,
            phase_duration: Duration::from_micros(2100),
            bursts: Vec::new(),
        };
        assert_eq!(map.size_bits(), 56);

        map.bursts = vec![burst(1, 10, 0), burst(2, 10, 1), burst(3, 11, 2)];
        assert_eq!(map.size_bits(), 200);
        assert_eq!(map.duration_symbols(192), 2);
        assert_eq!(map.bursts_for_station(StationId(10)).count(), 2);
    }
}
