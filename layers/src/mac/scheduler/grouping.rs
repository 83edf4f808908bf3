//! SDMA Grouping
//!
//! With beamforming enabled several connections may share one time/frequency
//! resource on separate beams, provided every pair in the group interferes
//! less than the friendliness threshold.

use super::strategy::Candidate;
use crate::mac::interference_cache::InterferenceCache;
use common::types::{Dbm, StationId};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Spatial grouping settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupingConfig {
    pub beamforming: bool,
    /// Largest group size
    pub max_beams: u8,
    /// Mutual interference a pair must stay below
    pub friendliness: Dbm,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self { beamforming: false, max_beams: 4, friendliness: Dbm(-105.0) }
    }
}

/// Source of pairwise interference estimates
pub trait InterferenceEstimator {
    /// Interference two stations would impose on each other on one resource
    fn mutual_interference(&self, a: StationId, b: StationId) -> Option<Dbm>;
}

impl InterferenceEstimator for InterferenceCache {
    fn mutual_interference(&self, a: StationId, b: StationId) -> Option<Dbm> {
        InterferenceCache::mutual_interference(self, a, b)
    }
}

/// Greedy grouper
#[derive(Debug, Clone)]
pub struct SdmaGrouper {
    config: GroupingConfig,
}

impl SdmaGrouper {
    pub fn new(config: GroupingConfig) -> Self {
        Self { config }
    }

    /// Strictly below the threshold; unknown pairs and a station with itself are not friendly
    pub fn friendly(&self, a: StationId, b: StationId, estimator: &dyn InterferenceEstimator) -> bool {
        if a == b {
            return false;
        }
        match estimator.mutual_interference(a, b) {
            Some(interference) => interference.0 < self.config.friendliness.0,
            None => false,
        }
    }

    /// Partition candidates, in their serving order, into groups of indices
    pub fn group(&self, candidates: &[Candidate], estimator: &dyn InterferenceEstimator) -> Vec<Vec<usize>> {
        if !self.config.beamforming || self.config.max_beams <= 1 {
            return (0..candidates.len()).map(|index| vec![index]).collect();
        }

        let max_beams = self.config.max_beams as usize;
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (index, candidate) in candidates.iter().enumerate() {
            let joins_last = groups.last().is_some_and(|group| {
                group.len() < max_beams
                    && group.iter().all(|&member| self.friendly(candidates[member].station, candidate.station, estimator))
            });
            match groups.last_mut() {
                Some(group) if joins_last => group.push(index),
                _ => groups.push(vec![index]),
            }
        }

        trace!("{} candidates in {} SDMA groups", candidates.len(), groups.len());
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::link_quality::{IntervalMapper, LinkQualityMapper};
    use common::types::{ConnectionId, QosCategory, StationClass};
    use std::collections::HashMap;

    struct Table(HashMap<(StationId, StationId), Dbm>);

    impl InterferenceEstimator for Table {
        fn mutual_interference(&self, a: StationId, b: StationId) -> Option<Dbm> {
            self.0.get(&(a, b)).or_else(|| self.0.get(&(b, a))).copied()
        }
    }

    fn candidate(station: u32) -> Candidate {
        let mcs = IntervalMapper::wimax().unwrap().map(12.0);
        Candidate {
            cid: ConnectionId(station),
            station: StationId(station),
            qos: QosCategory::Be,
            station_class: StationClass::UserTerminal,
            mcs,
            sinr: 12.0,
            backlog_bits: 5_000,
            bits_per_unit: mcs.bits_per_unit(16),
        }
    }

    fn config(max_beams: u8) -> GroupingConfig {
        GroupingConfig { beamforming: true, max_beams, friendliness: Dbm(-105.0) }
    }

    #[test]
    fn test_unfriendly_pair_split() {
        let table = Table(HashMap::from([((StationId(1), StationId(2)), Dbm(-90.0))]));
        let grouper = SdmaGrouper::new(config(2));
        let groups = grouper.group(&[candidate(1), candidate(2)], &table);
        assert_eq!(groups, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_threshold_is_strict() {
        let table = Table(HashMap::from([((StationId(1), StationId(2)), Dbm(-105.0))]));
        let grouper = SdmaGrouper::new(config(2));
        assert!(!grouper.friendly(StationId(1), StationId(2), &table));
        assert!(!grouper.friendly(StationId(1), StationId(1), &table));
        assert!(!grouper.friendly(StationId(1), StationId(3), &table));
    }

    #[test]
    fn test_groups_bounded_by_max_beams() {
        let mut pairs = HashMap::new();
        for a in 1..=5 {
            for b in 1..=5 {
                pairs.insert((StationId(a), StationId(b)), Dbm(-120.0));
            }
        }
        let table = Table(pairs);
        let candidates: Vec<Candidate> = (1..=5).map(candidate).collect();

        let groups = SdmaGrouper::new(config(2)).group(&candidates, &table);
        assert_eq!(groups, vec![vec![0, 1], vec![2, 3], vec![4]]);

        let disabled = GroupingConfig { beamforming: false, ..config(4) };
        assert_eq!(SdmaGrouper::new(disabled).group(&candidates, &table).len(), 5);
    }

    #[test]
    fn test_candidate_must_suit_every_member() {
        let table = Table(HashMap::from([
            ((StationId(1), StationId(2)), Dbm(-120.0)),
            ((StationId(1), StationId(3)), Dbm(-120.0)),
            ((StationId(2), StationId(3)), Dbm(-100.0)),
        ]));
        let groups = SdmaGrouper::new(config(3)).group(&[candidate(1), candidate(2), candidate(3)], &table);
        assert_eq!(groups, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_cache_as_estimator() {
        let cache = InterferenceCache::new(Default::default());
        // Default -96 dBm is above the threshold
        assert!(!SdmaGrouper::new(config(2)).friendly(StationId(1), StationId(2), &cache));
    }
}
