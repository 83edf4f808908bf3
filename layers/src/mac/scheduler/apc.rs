//! Adaptive Power Control
//!
//! Grants are sent with the nominal power of the transmitting station's class
//! unless a per-connection override is configured.

use common::types::{ConnectionId, Dbm, StationClass};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Power limits of a station class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerCapabilities {
    pub nominal: Dbm,
    pub max: Dbm,
    pub average: Dbm,
}

impl Default for PowerCapabilities {
    fn default() -> Self {
        Self { nominal: Dbm(30.0), max: Dbm(30.0), average: Dbm(30.0) }
    }
}

/// Capabilities per station class
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerProfiles {
    pub access_point: PowerCapabilities,
    pub relay_station: PowerCapabilities,
    pub user_terminal: PowerCapabilities,
}

impl PowerProfiles {
    pub fn for_class(&self, class: StationClass) -> &PowerCapabilities {
        match class {
            StationClass::AccessPoint => &self.access_point,
            StationClass::RelayStation => &self.relay_station,
            StationClass::UserTerminal => &self.user_terminal,
        }
    }
}

/// Transmit power policy
pub trait PowerControl: Send {
    /// Power for a grant of `cid` sent by a station of class `transmitter`
    fn tx_power(&self, cid: ConnectionId, transmitter: StationClass) -> Dbm;
}

/// Nominal power of the transmitter class, with optional clamped overrides
#[derive(Debug, Clone, Default)]
pub struct NominalPower {
    profiles: PowerProfiles,
    overrides: HashMap<ConnectionId, Dbm>,
}

impl NominalPower {
    pub fn new(profiles: PowerProfiles) -> Self {
        Self { profiles, overrides: HashMap::new() }
    }

    /// Fix the power of one connection
    pub fn set_override(&mut self, cid: ConnectionId, power: Dbm) {
        self.overrides.insert(cid, power);
    }

    pub fn clear_override(&mut self, cid: ConnectionId) {
        self.overrides.remove(&cid);
    }
}

impl PowerControl for NominalPower {
    fn tx_power(&self, cid: ConnectionId, transmitter: StationClass) -> Dbm {
        let capabilities = self.profiles.for_class(transmitter);
        match self.overrides.get(&cid) {
            Some(&power) if power.0 > capabilities.max.0 => {
                warn!("Power override {} of {} above maximum {}, clamped", power, cid, capabilities.max);
                capabilities.max
            }
            Some(&power) => power,
            None => capabilities.nominal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_and_override() {
        let mut profiles = PowerProfiles::default();
        profiles.user_terminal = PowerCapabilities { nominal: Dbm(23.0), max: Dbm(26.0), average: Dbm(20.0) };
        let mut apc = NominalPower::new(profiles);

        assert_eq!(apc.tx_power(ConnectionId(1), StationClass::AccessPoint), Dbm(30.0));
        assert_eq!(apc.tx_power(ConnectionId(1), StationClass::UserTerminal), Dbm(23.0));

        apc.set_override(ConnectionId(1), Dbm(25.0));
        assert_eq!(apc.tx_power(ConnectionId(1), StationClass::UserTerminal), Dbm(25.0));
        apc.set_override(ConnectionId(1), Dbm(40.0));
        assert_eq!(apc.tx_power(ConnectionId(1), StationClass::UserTerminal), Dbm(26.0));

        apc.clear_override(ConnectionId(1));
        assert_eq!(apc.tx_power(ConnectionId(1), StationClass::UserTerminal), Dbm(23.0));
    }
}
