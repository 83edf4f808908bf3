//! Common Types for the TDD MAC
//!
//! Defines fundamental identifiers and value types used throughout the MAC engine

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive;
use std::fmt;

/// Station identifier, unique per simulated node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StationId(pub u32);

impl StationId {
    /// Create a new station id
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the station id value
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STA{}", self.0)
    }
}

/// Connection identifier (CID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Create a new connection id
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the connection id value
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CID{}", self.0)
    }
}

/// Station class, selects the power capability profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationClass {
    /// Access point (base station)
    AccessPoint,
    /// Fixed relay station
    RelayStation,
    /// User terminal
    UserTerminal,
}

/// Role of a station in the TDD frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationRole {
    /// Coordinating station owning the frame and the full resource grid
    BaseStation,
    /// Subordinate station following the base station's maps
    SubscriberStation,
}

impl StationRole {
    /// Station class that goes with this role
    pub fn station_class(&self) -> StationClass {
        match self {
            StationRole::BaseStation => StationClass::AccessPoint,
            StationRole::SubscriberStation => StationClass::UserTerminal,
        }
    }
}

/// Link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Base station to subscriber station
    Downlink,
    /// Subscriber station to base station
    Uplink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downlink => write!(f, "DL"),
            Direction::Uplink => write!(f, "UL"),
        }
    }
}

/// Operation mode of a phase activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationMode {
    /// Transmitting
    Sending,
    /// Receiving
    Receiving,
    /// Neither, used by guard and contention gaps
    Pausing,
}

/// QoS category of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum QosCategory {
    /// Management and signaling connections
    Signaling = 1,
    /// Unsolicited grant service
    Ugs = 2,
    /// Real-time polling service
    RtPs = 3,
    /// Non-real-time polling service
    NrtPs = 4,
    /// Best effort
    Be = 5,
}

impl QosCategory {
    /// All categories in ascending numeric order
    pub const ALL: [QosCategory; 5] = [
        QosCategory::Signaling,
        QosCategory::Ugs,
        QosCategory::RtPs,
        QosCategory::NrtPs,
        QosCategory::Be,
    ];

    /// Numeric code of the category (lower is more urgent)
    pub fn code(&self) -> u8 {
        self.to_u8().unwrap_or(u8::MAX)
    }
}

/// Absolute power level in dBm
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Dbm(pub f64);

impl Dbm {
    /// Convert to linear milliwatts
    pub fn to_milliwatt(&self) -> f64 {
        10f64.powf(self.0 / 10.0)
    }

    /// Create from linear milliwatts
    pub fn from_milliwatt(mw: f64) -> Self {
        Self(10.0 * mw.log10())
    }

    /// Ratio between two power levels
    pub fn ratio_to(&self, other: Dbm) -> Db {
        Db(self.0 - other.0)
    }

    /// Attenuate by a ratio
    pub fn attenuate(&self, loss: Db) -> Dbm {
        Dbm(self.0 - loss.0)
    }
}

impl fmt::Display for Dbm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} dBm", self.0)
    }
}

/// Power ratio in dB
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Db(pub f64);

impl Db {
    /// Convert to a linear factor
    pub fn to_linear(&self) -> f64 {
        10f64.powf(self.0 / 10.0)
    }

    /// Create from a linear factor
    pub fn from_linear(factor: f64) -> Self {
        Self(10.0 * factor.log10())
    }
}

impl fmt::Display for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} dB", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_qos_category_codes() {
        assert_eq!(QosCategory::Signaling.code(), 1);
        assert_eq!(QosCategory::Be.code(), 5);
        assert_eq!(QosCategory::from_u8(3), Some(QosCategory::RtPs));
        assert_eq!(QosCategory::from_u8(6), None);
        assert!(QosCategory::Signaling < QosCategory::Be);
    }

    #[test]
    fn test_power_conversions() {
        let p = Dbm(30.0);
        assert!((p.to_milliwatt() - 1000.0).abs() < 1e-9);
        assert!((Dbm::from_milliwatt(1.0).0).abs() < 1e-12);

        let sinr = Dbm(-70.0).ratio_to(Dbm(-80.0));
        assert!((sinr.0 - 10.0).abs() < 1e-12);
        assert!((Db(3.0).to_linear() - 1.9952623).abs() < 1e-6);
        assert_eq!(Dbm(30.0).attenuate(Db(131.0)), Dbm(-101.0));
    }

    #[test]
    fn test_role_class() {
        assert_eq!(StationRole::BaseStation.station_class(), StationClass::AccessPoint);
        assert_eq!(StationRole::SubscriberStation.station_class(), StationClass::UserTerminal);
        assert_eq!(format!("{}", ConnectionId(7)), "CID7");
    }
}
