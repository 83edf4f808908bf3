//! Scheduling Strategies
//!
//! Static priority classes are served strictly in order. Within a class a
//! sub-strategy orders the competing connections.

use crate::mac::link_quality::Mcs;
use crate::LayerError;
use common::types::{ConnectionId, QosCategory, StationClass, StationId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// A connection competing for resources in this run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub cid: ConnectionId,
    pub station: StationId,
    pub qos: QosCategory,
    pub station_class: StationClass,
    pub mcs: Mcs,
    pub sinr: f64,
    /// On-air bits needed to drain the queue
    pub backlog_bits: u64,
    /// Capacity of one sub-channel for one symbol at `mcs`
    pub bits_per_unit: u32,
}

/// Orders the candidates of one priority class
pub trait SubStrategy: Send {
    /// Sort candidates into serving order; the slice arrives in CID order
    fn order(&mut self, class: usize, candidates: &mut [Candidate]);

    /// Record bits granted to a connection
    fn served(&mut self, _cid: ConnectionId, _bits: u64) {}

    /// The scheduling run is over
    fn frame_complete(&mut self) {}

    /// Drop what is kept about a released connection
    fn forget(&mut self, _cid: ConnectionId) {}

    /// Serve a connection until it is drained before moving on
    fn drains_first(&self) -> bool {
        false
    }
}

/// Start pointer rotating across frames
#[derive(Debug, Default)]
pub struct RoundRobin {
    last_first: HashMap<usize, ConnectionId>,
}

impl SubStrategy for RoundRobin {
    fn order(&mut self, class: usize, candidates: &mut [Candidate]) {
        if candidates.is_empty() {
            return;
        }
        let start = match self.last_first.get(&class) {
            Some(previous) => candidates.iter().position(|c| c.cid > *previous).unwrap_or(0),
            None => 0,
        };
        candidates.rotate_left(start);
        self.last_first.insert(class, candidates[0].cid);
        trace!("Round robin class {} starts at {}", class, candidates[0].cid);
    }
}

/// Instantaneous capacity over exponentially averaged past throughput
#[derive(Debug)]
pub struct ProportionalFair {
    history_weight: f64,
    average: HashMap<ConnectionId, f64>,
    this_frame: HashMap<ConnectionId, u64>,
}

impl ProportionalFair {
    pub fn new(history_weight: f64) -> Self {
        Self { history_weight, average: HashMap::new(), this_frame: HashMap::new() }
    }

    fn metric(&self, candidate: &Candidate) -> f64 {
        match self.average.get(&candidate.cid) {
            Some(&average) if average > 0.0 => candidate.bits_per_unit as f64 / average,
            _ => f64::MAX,
        }
    }
}

impl SubStrategy for ProportionalFair {
    fn order(&mut self, _class: usize, candidates: &mut [Candidate]) {
        for candidate in candidates.iter() {
            self.this_frame.entry(candidate.cid).or_insert(0);
        }
        // Stable: equal metrics keep CID order
        candidates.sort_by(|a, b| self.metric(b).total_cmp(&self.metric(a)));
    }

    fn served(&mut self, cid: ConnectionId, bits: u64) {
        *self.this_frame.entry(cid).or_insert(0) += bits;
    }

    fn frame_complete(&mut self) {
        let alpha = self.history_weight;
        for (cid, bits) in self.this_frame.drain() {
            let average = self.average.entry(cid).or_insert(bits as f64);
            *average = (1.0 - alpha) * *average + alpha * bits as f64;
        }
    }

    fn forget(&mut self, cid: ConnectionId) {
        self.average.remove(&cid);
        self.this_frame.remove(&cid);
    }
}

/// CID order, each connection drained before the next
#[derive(Debug, Default)]
pub struct Exhaustive;

impl SubStrategy for Exhaustive {
    fn order(&mut self, _class: usize, candidates: &mut [Candidate]) {
        candidates.sort_by_key(|candidate| candidate.cid);
    }

    fn drains_first(&self) -> bool {
        true
    }
}

/// Configured sub-strategy
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStrategyKind {
    #[default]
    RoundRobin,
    ProportionalFair { history_weight: f64 },
    Exhaustive,
}

impl SubStrategyKind {
    pub fn build(&self) -> Result<Box<dyn SubStrategy>, LayerError> {
        Ok(match *self {
            SubStrategyKind::RoundRobin => Box::new(RoundRobin::default()),
            SubStrategyKind::ProportionalFair { history_weight } => {
                if !(0.0..=1.0).contains(&history_weight) {
                    return Err(LayerError::ConfigurationError(format!(
                        "proportional fair history weight {} outside [0, 1]", history_weight
                    )));
                }
                Box::new(ProportionalFair::new(history_weight))
            }
            SubStrategyKind::Exhaustive => Box::new(Exhaustive),
        })
    }
}

/// Ordered priority classes of QoS categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityClasses {
    classes: Vec<Vec<QosCategory>>,
}

impl Default for PriorityClasses {
    fn default() -> Self {
        Self {
            classes: vec![
                vec![QosCategory::Signaling],
                vec![QosCategory::Ugs, QosCategory::RtPs],
                vec![QosCategory::NrtPs, QosCategory::Be],
            ],
        }
    }
}

impl PriorityClasses {
    /// Every category must appear in exactly one class
    pub fn new(classes: Vec<Vec<QosCategory>>) -> Result<Self, LayerError> {
        let candidate = Self { classes };
        candidate.validate()?;
        Ok(candidate)
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        for category in QosCategory::ALL {
            let count = self.classes.iter().flatten().filter(|&&c| c == category).count();
            if count != 1 {
                return Err(LayerError::ConfigurationError(format!(
                    "QoS category {:?} appears in {} priority classes", category, count
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Index of the class serving a category, 0 is served first
    pub fn class_of(&self, qos: QosCategory) -> usize {
        self.classes
            .iter()
            .position(|class| class.contains(&qos))
            .unwrap_or(self.classes.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::link_quality::{IntervalMapper, LinkQualityMapper};

    fn candidates(cids: &[u32]) -> Vec<Candidate> {
        let mcs = IntervalMapper::wimax().unwrap().map(10.0);
        cids.iter()
            .map(|&cid| Candidate {
                cid: ConnectionId(cid),
                station: StationId(cid + 100),
                qos: QosCategory::Be,
                station_class: StationClass::UserTerminal,
                mcs,
                sinr: 10.0,
                backlog_bits: 1_000,
                bits_per_unit: mcs.bits_per_unit(16),
            })
            .collect()
    }

    fn order(strategy: &mut dyn SubStrategy, cids: &[u32]) -> Vec<u32> {
        let mut list = candidates(cids);
        strategy.order(0, &mut list);
        list.iter().map(|c| c.cid.value()).collect()
    }

    #[test]
    fn test_round_robin_rotates() {
        let mut rr = RoundRobin::default();
        assert_eq!(order(&mut rr, &[1, 2, 3]), vec![1, 2, 3]);
        assert_eq!(order(&mut rr, &[1, 2, 3]), vec![2, 3, 1]);
        assert_eq!(order(&mut rr, &[1, 2, 3]), vec![3, 1, 2]);
        // A departed connection does not stall the rotation
        assert_eq!(order(&mut rr, &[1, 2]), vec![1, 2]);
    }

    #[test]
    fn test_proportional_fair_prefers_starved() {
        let mut pf = ProportionalFair::new(0.1);
        assert_eq!(order(&mut pf, &[1, 2]), vec![1, 2]);
        pf.served(ConnectionId(1), 10_000);
        pf.served(ConnectionId(2), 100);
        pf.frame_complete();
        assert_eq!(order(&mut pf, &[1, 2]), vec![2, 1]);
    }

    #[test]
    fn test_proportional_fair_forgets_released() {
        let mut pf = ProportionalFair::new(0.1);
        order(&mut pf, &[1, 2]);
        pf.served(ConnectionId(1), 500);
        pf.served(ConnectionId(2), 500);
        pf.frame_complete();
        assert_eq!(pf.average.len(), 2);

        pf.forget(ConnectionId(1));
        assert_eq!(pf.average.len(), 1);
        assert!(!pf.average.contains_key(&ConnectionId(1)));

        // Released mid-run, nothing comes back at the end of the frame
        order(&mut pf, &[2]);
        pf.served(ConnectionId(2), 500);
        pf.forget(ConnectionId(2));
        pf.frame_complete();
        assert!(pf.average.is_empty());
    }

    #[test]
    fn test_exhaustive_keeps_cid_order() {
        let mut exhaustive = Exhaustive;
        assert_eq!(order(&mut exhaustive, &[3, 1, 2]), vec![1, 2, 3]);
        assert!(exhaustive.drains_first());
    }

    #[test]
    fn test_priority_classes() {
        let classes = PriorityClasses::default();
        assert_eq!(classes.len(), 3);
        assert_eq!(classes.class_of(QosCategory::Signaling), 0);
        assert_eq!(classes.class_of(QosCategory::Ugs), 1);
        assert_eq!(classes.class_of(QosCategory::Be), 2);

        assert!(PriorityClasses::new(vec![QosCategory::ALL.to_vec()]).is_ok());
        assert!(PriorityClasses::new(vec![vec![QosCategory::Be]]).is_err());
        assert!(PriorityClasses::new(vec![QosCategory::ALL.to_vec(), vec![QosCategory::Be]]).is_err());
    }

    #[test]
    fn test_invalid_history_weight() {
        assert!(SubStrategyKind::ProportionalFair { history_weight: 1.5 }.build().is_err());
        assert!(SubStrategyKind::default().build().is_ok());
    }
}
