//! Interference Cache
//!
//! Exponentially smoothed carrier, interference and path loss per station
//! pair. Averages and deviations are kept in linear units; the accessors
//! convert back to dBm / dB.

use common::types::{Db, Dbm, StationId};
use interfaces::{MeasurementOrigin, MeasurementReport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Values assumed for a pair that has never been measured
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DefaultLinkValues {
    pub carrier: Dbm,
    pub interference: Dbm,
    pub pathloss: Db,
}

impl Default for DefaultLinkValues {
    fn default() -> Self {
        Self { carrier: Dbm(-101.0), interference: Dbm(-96.0), pathloss: Db(131.0) }
    }
}

/// Behaviour on a lookup of an unknown pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NotFoundStrategy {
    /// Answer with fixed values and zero deviation
    ConstantValue(DefaultLinkValues),
    /// Answer nothing and warn
    Complain,
}

/// Smoothing and fallback configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterferenceCacheConfig {
    /// Smoothing factor for own measurements
    pub alpha_local: f64,
    /// Smoothing factor for measurements reported by a peer
    pub alpha_remote: f64,
    pub not_found: NotFoundStrategy,
}

impl Default for InterferenceCacheConfig {
    fn default() -> Self {
        Self {
            alpha_local: 0.2,
            alpha_remote: 0.05,
            not_found: NotFoundStrategy::ConstantValue(DefaultLinkValues::default()),
        }
    }
}

/// Running average of a linear quantity
#[derive(Debug, Clone, Copy)]
struct Smoothed {
    average: f64,
    mean_square: f64,
}

impl Smoothed {
    fn first(value: f64) -> Self {
        Self { average: value, mean_square: value * value }
    }

    fn update(&mut self, alpha: f64, value: f64) {
        self.average = (1.0 - alpha) * self.average + alpha * value;
        self.mean_square = (1.0 - alpha) * self.mean_square + alpha * value * value;
    }

    fn deviation(&self) -> f64 {
        (self.mean_square - self.average * self.average).max(0.0).sqrt()
    }
}

fn smooth(slot: &mut Option<Smoothed>, alpha: f64, value: f64) {
    match slot {
        Some(smoothed) => smoothed.update(alpha, value),
        None => *slot = Some(Smoothed::first(value)),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LinkEntry {
    carrier: Option<Smoothed>,
    interference: Option<Smoothed>,
    pathloss: Option<Smoothed>,
}

/// Smoothed view of one station pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkEstimate {
    pub carrier: Dbm,
    pub interference: Dbm,
    pub pathloss: Db,
    /// Standard deviation of the carrier, mW
    pub carrier_deviation: f64,
    /// Standard deviation of the interference, mW
    pub interference_deviation: f64,
    /// Standard deviation of the path loss, linear factor
    pub pathloss_deviation: f64,
}

impl LinkEstimate {
    /// Carrier to interference ratio of the estimate
    pub fn cir(&self) -> Db {
        self.carrier.ratio_to(self.interference)
    }
}

/// Pair-keyed measurement cache
#[derive(Debug)]
pub struct InterferenceCache {
    config: InterferenceCacheConfig,
    entries: HashMap<(StationId, StationId), LinkEntry>,
}

impl InterferenceCache {
    pub fn new(config: InterferenceCacheConfig) -> Self {
        Self { config, entries: HashMap::new() }
    }

    fn alpha(&self, origin: MeasurementOrigin) -> f64 {
        match origin {
            MeasurementOrigin::Local => self.config.alpha_local,
            MeasurementOrigin::Remote => self.config.alpha_remote,
        }
    }

    pub fn update_carrier(&mut self, station: StationId, peer: StationId, carrier: Dbm, origin: MeasurementOrigin) {
        let alpha = self.alpha(origin);
        let entry = self.entries.entry((station, peer)).or_default();
        smooth(&mut entry.carrier, alpha, carrier.to_milliwatt());
    }

    pub fn update_interference(&mut self, station: StationId, peer: StationId, interference: Dbm, origin: MeasurementOrigin) {
        let alpha = self.alpha(origin);
        let entry = self.entries.entry((station, peer)).or_default();
        smooth(&mut entry.interference, alpha, interference.to_milliwatt());
    }

    pub fn update_pathloss(&mut self, station: StationId, peer: StationId, pathloss: Db, origin: MeasurementOrigin) {
        let alpha = self.alpha(origin);
        let entry = self.entries.entry((station, peer)).or_default();
        smooth(&mut entry.pathloss, alpha, pathloss.to_linear());
    }

    /// Feed one measurement report
    pub fn apply_report(&mut self, report: &MeasurementReport) {
        trace!("Cache update ({}, {}): C={} I={} ({:?})",
               report.station, report.peer, report.carrier, report.interference, report.origin);
        self.update_carrier(report.station, report.peer, report.carrier, report.origin);
        self.update_interference(report.station, report.peer, report.interference, report.origin);
        if let Some(pathloss) = report.pathloss {
            self.update_pathloss(report.station, report.peer, pathloss, report.origin);
        }
    }

    fn defaults(&self, station: StationId, peer: StationId) -> Option<DefaultLinkValues> {
        match self.config.not_found {
            NotFoundStrategy::ConstantValue(values) => Some(values),
            NotFoundStrategy::Complain => {
                warn!("No measurement cached for ({}, {})", station, peer);
                None
            }
        }
    }

    fn entry(&self, station: StationId, peer: StationId) -> LinkEntry {
        self.entries.get(&(station, peer)).copied().unwrap_or_default()
    }

    pub fn carrier(&self, station: StationId, peer: StationId) -> Option<Dbm> {
        match self.entry(station, peer).carrier {
            Some(carrier) => Some(Dbm::from_milliwatt(carrier.average)),
            None => self.defaults(station, peer).map(|values| values.carrier),
        }
    }

    pub fn interference(&self, station: StationId, peer: StationId) -> Option<Dbm> {
        match self.entry(station, peer).interference {
            Some(interference) => Some(Dbm::from_milliwatt(interference.average)),
            None => self.defaults(station, peer).map(|values| values.interference),
        }
    }

    pub fn pathloss(&self, station: StationId, peer: StationId) -> Option<Db> {
        match self.entry(station, peer).pathloss {
            Some(pathloss) => Some(Db::from_linear(pathloss.average)),
            None => self.defaults(station, peer).map(|values| values.pathloss),
        }
    }

    /// Carrier and interference of the pair were both measured
    pub fn has_measurement(&self, station: StationId, peer: StationId) -> bool {
        let entry = self.entry(station, peer);
        entry.carrier.is_some() && entry.interference.is_some()
    }

    /// Full estimate of a pair; unknown quantities come from the not-found strategy
    pub fn estimate(&self, station: StationId, peer: StationId) -> Option<LinkEstimate> {
        let entry = self.entry(station, peer);
        Some(LinkEstimate {
            carrier: self.carrier(station, peer)?,
            interference: self.interference(station, peer)?,
            pathloss: self.pathloss(station, peer)?,
            carrier_deviation: entry.carrier.map_or(0.0, |s| s.deviation()),
            interference_deviation: entry.interference.map_or(0.0, |s| s.deviation()),
            pathloss_deviation: entry.pathloss.map_or(0.0, |s| s.deviation()),
        })
    }

    /// Interference two stations impose on each other when co-scheduled
    pub fn mutual_interference(&self, a: StationId, b: StationId) -> Option<Dbm> {
        match (self.interference(a, b), self.interference(b, a)) {
            (Some(x), Some(y)) => Some(if x.0 >= y.0 { x } else { y }),
            (Some(x), None) | (None, Some(x)) => Some(x),
            (None, None) => None,
        }
    }

    /// Drop every pair involving a station
    pub fn forget_station(&mut self, station: StationId) {
        self.entries.retain(|(a, b), _| *a != station && *b != station);
    }

    /// Number of cached pairs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
