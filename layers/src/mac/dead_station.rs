//! Dead Station Detection
//!
//! Stations that stay silent for too long are dropped together with their
//! connections. The check runs only every few frames.

use common::types::StationId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Detection timing, in frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadStationConfig {
    /// Frames between two checks
    pub check_interval: u64,
    /// Idle frames after which a station counts as dead
    pub time_to_live: u64,
}

impl Default for DeadStationConfig {
    fn default() -> Self {
        Self { check_interval: 50, time_to_live: 100 }
    }
}

/// Tracks the last activity of every known station
#[derive(Debug)]
pub struct DeadStationDetector {
    config: DeadStationConfig,
    last_seen: HashMap<StationId, u64>,
    next_check: u64,
}

impl DeadStationDetector {
    pub fn new(config: DeadStationConfig) -> Self {
        Self { config, last_seen: HashMap::new(), next_check: config.check_interval }
    }

    /// Record activity of a station
    pub fn touch(&mut self, station: StationId, frame: u64) {
        let seen = self.last_seen.entry(station).or_insert(frame);
        *seen = (*seen).max(frame);
    }

    /// Stop tracking a station
    pub fn forget(&mut self, station: StationId) {
        self.last_seen.remove(&station);
    }

    pub fn is_tracked(&self, station: StationId) -> bool {
        self.last_seen.contains_key(&station)
    }

    /// Called once per frame; returns the stations declared dead in this frame
    pub fn on_frame(&mut self, frame: u64) -> Vec<StationId> {
        if self.config.check_interval == 0 || frame < self.next_check {
            return Vec::new();
        }
        self.next_check = frame + self.config.check_interval;

        let ttl = self.config.time_to_live;
        let mut dead: Vec<StationId> = self
            .last_seen
            .iter()
            .filter(|(_, &seen)| frame.saturating_sub(seen) >= ttl)
            .map(|(&station, _)| station)
            .collect();
        dead.sort();

        for station in &dead {
            self.last_seen.remove(station);
            info!("{} silent for at least {} frames, declared dead", station, ttl);
        }
        debug!("Dead-station check at frame {}: {} tracked, {} removed", frame, self.last_seen.len(), dead.len());
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_station_removed_at_check() {
        let mut detector = DeadStationDetector::new(DeadStationConfig { check_interval: 10, time_to_live: 20 });
        detector.touch(StationId(1), 0);
        detector.touch(StationId(2), 0);

        for frame in 0..30 {
            if frame % 5 == 0 {
                detector.touch(StationId(2), frame);
            }
            let dead = detector.on_frame(frame);
            // Checks at 10 and 20; station 1 is 20 frames idle at frame 20
            match frame {
                20 => assert_eq!(dead, vec![StationId(1)]),
                _ => assert!(dead.is_empty(), "unexpected removal at {}", frame),
            }
        }
        assert!(detector.is_tracked(StationId(2)));
        assert!(!detector.is_tracked(StationId(1)));
    }

    #[test]
    fn test_zero_interval_disables_checks() {
        let mut detector = DeadStationDetector::new(DeadStationConfig { check_interval: 0, time_to_live: 1 });
        detector.touch(StationId(1), 0);
        assert!(detector.on_frame(1000).is_empty());
        detector.forget(StationId(1));
        assert!(!detector.is_tracked(StationId(1)));
    }
}
