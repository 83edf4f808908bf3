//! Link Quality Mapping
//!
//! Maps a measured SINR to an entry of the station's MCS catalogue using an
//! ordered table of `(low, high]` intervals

use crate::LayerError;
use common::utils::bits_per_resource_unit;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// Lower bound of the sentinel interval
const SENTINEL_LOW: f64 = -200.0;
/// Upper bound of the top interval
const TOP_HIGH: f64 = 200.0;
/// Denominator of the catalogue's code rates
const CODE_RATE_BASE: f64 = 3600.0;

/// Modulation alphabet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    Bpsk,
    Qpsk,
    Qam16,
    Qam64,
}

impl Modulation {
    /// Bits carried by one modulation symbol
    pub fn bits_per_symbol(&self) -> u8 {
        match self {
            Modulation::Bpsk => 1,
            Modulation::Qpsk => 2,
            Modulation::Qam16 => 4,
            Modulation::Qam64 => 6,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Modulation::Bpsk => "BPSK",
            Modulation::Qpsk => "QPSK",
            Modulation::Qam16 => "QAM16",
            Modulation::Qam64 => "QAM64",
        }
    }
}

/// Modulation and coding scheme
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mcs {
    /// Position in the catalogue, ascending with capacity
    pub index: u8,
    /// Catalogue code, also the code rate numerator
    pub code: u16,
    /// Modulation alphabet
    pub modulation: Modulation,
    /// Code rate in (0, 1]
    pub code_rate: f64,
    /// Lower bound of the SINR interval mapped to this scheme
    pub min_sinr: f64,
}

impl Mcs {
    /// Catalogue entry with code rate `code / 3600`
    pub fn catalogue(index: u8, modulation: Modulation, code: u16, min_sinr: f64) -> Self {
        Self { index, code, modulation, code_rate: code as f64 / CODE_RATE_BASE, min_sinr }
    }

    /// Coded bits per modulation symbol
    pub fn bits_per_symbol(&self) -> u8 {
        self.modulation.bits_per_symbol()
    }

    /// Information bits per modulation symbol
    pub fn information_bits_per_symbol(&self) -> f64 {
        self.bits_per_symbol() as f64 * self.code_rate
    }

    /// Capacity of one sub-channel during one OFDMA symbol
    pub fn bits_per_unit(&self, data_subcarriers: u16) -> u32 {
        bits_per_resource_unit(self.bits_per_symbol(), self.code_rate, data_subcarriers)
    }
}

impl fmt::Display for Mcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.modulation.label(), self.code)
    }
}

/// Maps link quality to an MCS
pub trait LinkQualityMapper: Send + Sync {
    /// MCS for a SINR value in dB; never fails
    fn map(&self, sinr: f64) -> Mcs;

    /// Smallest SINR at which a connection is served at all
    fn minimum_sinr(&self) -> f64;

    /// Sentinel entry used below the first boundary
    fn lowest(&self) -> Mcs;

    /// Entry with the highest capacity
    fn highest(&self) -> Mcs;

    /// Entry by catalogue index
    fn by_index(&self, index: u8) -> Option<Mcs>;

    /// Whether a SINR value can be served this frame
    fn is_servable(&self, sinr: f64) -> bool {
        sinr >= self.minimum_sinr()
    }
}

/// One `(low, high]` interval of the mapping table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinrInterval {
    pub low: f64,
    pub high: f64,
    pub mcs: Mcs,
}

/// Interval table mapper
#[derive(Debug, Clone)]
pub struct IntervalMapper {
    lowest: Mcs,
    minimum_sinr: f64,
    intervals: Vec<SinrInterval>,
}

impl IntervalMapper {
    /// Build a mapper, rejecting gaps, overlaps and decreasing capacity
    pub fn new(lowest: Mcs, minimum_sinr: f64, intervals: Vec<SinrInterval>) -> Result<Self, LayerError> {
        if intervals.is_empty() {
            return Err(LayerError::ConfigurationError("MCS interval table is empty".into()));
        }

        let mut previous_capacity = lowest.information_bits_per_symbol();
        for (i, interval) in intervals.iter().enumerate() {
            if !(interval.low < interval.high) {
                return Err(LayerError::ConfigurationError(format!(
                    "interval ({}, {}] of {} is empty", interval.low, interval.high, interval.mcs
                )));
            }
            if i > 0 && intervals[i - 1].high != interval.low {
                return Err(LayerError::ConfigurationError(format!(
                    "intervals not contiguous at {} / {}", intervals[i - 1].high, interval.low
                )));
            }
            let capacity = interval.mcs.information_bits_per_symbol();
            if capacity < previous_capacity {
                return Err(LayerError::ConfigurationError(format!(
                    "capacity of {} decreases along the table", interval.mcs
                )));
            }
            previous_capacity = capacity;
        }

        debug!("MCS table: {} intervals, sentinel {}, minimum SINR {:.3} dB",
               intervals.len(), lowest, minimum_sinr);

        Ok(Self { lowest, minimum_sinr, intervals })
    }

    /// WiMAX-style 16 entry catalogue
    pub fn wimax() -> Result<Self, LayerError> {
        use Modulation::*;

        let entries: [(Modulation, u16, f64, f64); 15] = [
            (Qpsk, 720, -3.464765, -2.952957),
            (Qpsk, 1020, -2.952957, -0.421870),
            (Qpsk, 1320, -0.421870, 1.085567),
            (Qpsk, 1520, 1.085567, 2.683285),
            (Qpsk, 1720, 2.683285, 3.925478),
            (Qam16, 1920, 3.925478, 5.219113),
            (Qam16, 2120, 5.219113, 8.770903),
            (Qam16, 2320, 8.770903, 10.678538),
            (Qam64, 2420, 10.678538, 11.279353),
            (Qam64, 2520, 11.279353, 13.452776),
            (Qam64, 2620, 13.452776, 14.450271),
            (Qam64, 2720, 14.450271, 16.728635),
            (Qam64, 2820, 16.728635, 17.728189),
            (Qam64, 2920, 17.728189, 19.580673),
            (Qam64, 3020, 19.580673, TOP_HIGH),
        ];

        let lowest = Mcs::catalogue(0, Qpsk, 320, SENTINEL_LOW);
        let mut intervals = vec![SinrInterval { low: SENTINEL_LOW, high: -3.464765, mcs: lowest }];
        for (i, (modulation, code, low, high)) in entries.into_iter().enumerate() {
            intervals.push(SinrInterval {
                low,
                high,
                mcs: Mcs::catalogue(i as u8 + 1, modulation, code, low),
            });
        }

        Self::new(lowest, -5.331243, intervals)
    }

    /// The interval table
    pub fn intervals(&self) -> &[SinrInterval] {
        &self.intervals
    }
}

impl LinkQualityMapper for IntervalMapper {
    fn map(&self, sinr: f64) -> Mcs {
        let first = self.intervals[0];
        if sinr.is_nan() || sinr <= first.low {
            return self.lowest;
        }

        // First interval whose closed upper end reaches the value
        let position = self.intervals.partition_point(|interval| interval.high < sinr);
        let mcs = match self.intervals.get(position) {
            Some(interval) => interval.mcs,
            None => self.highest(),
        };

        trace!("SINR {:.3} dB -> {}", sinr, mcs);
        mcs
    }

    fn minimum_sinr(&self) -> f64 {
        self.minimum_sinr
    }

    fn lowest(&self) -> Mcs {
        self.lowest
    }

    fn highest(&self) -> Mcs {
        self.intervals.last().map(|interval| interval.mcs).unwrap_or(self.lowest)
    }

    fn by_index(&self, index: u8) -> Option<Mcs> {
        if index == self.lowest.index {
            return Some(self.lowest);
        }
        self.intervals.iter().map(|interval| interval.mcs).find(|mcs| mcs.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_documented_boundary_scenario() {
        let mapper = IntervalMapper::wimax().unwrap();
        assert_eq!(mapper.map(-3.0).to_string(), "QPSK-720");
        // Closed upper end
        assert_eq!(mapper.map(-2.952957).to_string(), "QPSK-720");
        assert_eq!(mapper.map(-2.95).to_string(), "QPSK-1020");
        // Open lower end
        assert_eq!(mapper.map(-3.464765).to_string(), "QPSK-320");
    }

    #[test]
    fn test_out_of_range_clamps() {
        let mapper = IntervalMapper::wimax().unwrap();
        assert_eq!(mapper.map(-1000.0), mapper.lowest());
        assert_eq!(mapper.map(f64::NAN), mapper.lowest());
        assert_eq!(mapper.map(1000.0), mapper.highest());
        assert_eq!(mapper.highest().to_string(), "QAM64-3020");
        assert_eq!(mapper.intervals().len(), 16);
    }

    #[test]
    fn test_minimum_sinr() {
        let mapper = IntervalMapper::wimax().unwrap();
        assert!(mapper.is_servable(-5.0));
        assert!(mapper.is_servable(-5.331243));
        assert!(!mapper.is_servable(-6.0));
    }

    #[test]
    fn test_capacity_monotonic_in_sinr() {
        let mapper = IntervalMapper::wimax().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut samples: Vec<f64> = (0..2000).map(|_| rng.gen_range(-30.0..40.0)).collect();
        samples.sort_by(|a, b| a.total_cmp(b));

        let mut previous = 0.0;
        for sinr in samples {
            let capacity = mapper.map(sinr).information_bits_per_symbol();
            assert!(capacity >= previous, "capacity dropped at {} dB", sinr);
            previous = capacity;
        }
    }

    #[test]
    fn test_resource_unit_capacity() {
        let mapper = IntervalMapper::wimax().unwrap();
        let mcs = mapper.by_index(15).unwrap();
        // 6 bits * 3020/3600 * 16 sub-carriers = 80.53
        assert_eq!(mcs.bits_per_unit(16), 80);
        assert_eq!(mapper.by_index(0), Some(mapper.lowest()));
        assert_eq!(mapper.by_index(16), None);
    }

    #[test]
    fn test_invalid_tables_rejected() {
        let a = Mcs::catalogue(0, Modulation::Qpsk, 720, -10.0);
        let b = Mcs::catalogue(1, Modulation::Qam16, 1920, 0.0);

        let gap = vec![
            SinrInterval { low: -10.0, high: 0.0, mcs: a },
            SinrInterval { low: 1.0, high: 5.0, mcs: b },
        ];
        assert!(IntervalMapper::new(a, -10.0, gap).is_err());

        let decreasing = vec![
            SinrInterval { low: -10.0, high: 0.0, mcs: b },
            SinrInterval { low: 0.0, high: 5.0, mcs: a },
        ];
        assert!(IntervalMapper::new(a, -10.0, decreasing).is_err());

        assert!(IntervalMapper::new(a, -10.0, Vec::new()).is_err());
    }
}
