//! Connection Registry
//!
//! Connections exist from admission to release. Each tracks the latest SINR
//! estimate of its link and the MCS derived from it.

use super::link_quality::{LinkQualityMapper, Mcs};
use crate::LayerError;
use common::types::{ConnectionId, Direction, QosCategory, StationClass, StationId};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Admission parameters of a connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionSpec {
    pub cid: ConnectionId,
    /// Remote end of the connection
    pub station: StationId,
    pub direction: Direction,
    pub qos: QosCategory,
    /// Class of the remote station
    pub station_class: StationClass,
}

/// An admitted connection
#[derive(Debug, Clone)]
pub struct Connection {
    pub spec: ConnectionSpec,
    /// Latest link SINR in dB
    pub sinr: Option<f64>,
    /// MCS derived from `sinr`
    pub mcs: Option<Mcs>,
    /// MCS index reported in the previous frame
    previous_mcs: Option<u8>,
}

impl Connection {
    fn new(spec: ConnectionSpec) -> Self {
        Self { spec, sinr: None, mcs: None, previous_mcs: None }
    }

    pub fn cid(&self) -> ConnectionId {
        self.spec.cid
    }

    pub fn station(&self) -> StationId {
        self.spec.station
    }
}

/// All connections of one station, ordered by CID
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection; a CID is admitted at most once
    pub fn admit(&mut self, spec: ConnectionSpec) -> Result<(), LayerError> {
        if self.connections.contains_key(&spec.cid) {
            return Err(LayerError::InvalidState(format!("{} already admitted", spec.cid)));
        }
        info!("Admitted {} ({} {:?}) to {}", spec.cid, spec.direction, spec.qos, spec.station);
        self.connections.insert(spec.cid, Connection::new(spec));
        Ok(())
    }

    /// Release one connection
    pub fn release(&mut self, cid: ConnectionId) -> Option<Connection> {
        let released = self.connections.remove(&cid);
        if released.is_some() {
            info!("Released {}", cid);
        }
        released
    }

    /// Release every connection of a station
    pub fn release_station(&mut self, station: StationId) -> Vec<ConnectionId> {
        let cids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|connection| connection.station() == station)
            .map(Connection::cid)
            .collect();
        for cid in &cids {
            self.connections.remove(cid);
        }
        if !cids.is_empty() {
            info!("Released {} connections of {}", cids.len(), station);
        }
        cids
    }

    pub fn get(&self, cid: ConnectionId) -> Option<&Connection> {
        self.connections.get(&cid)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections of one direction in CID order
    pub fn in_direction(&self, direction: Direction) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(move |connection| connection.spec.direction == direction)
    }

    /// Stations with at least one connection
    pub fn stations(&self) -> Vec<StationId> {
        let mut stations: Vec<StationId> = self.connections.values().map(Connection::station).collect();
        stations.sort();
        stations.dedup();
        stations
    }

    /// Store a new SINR estimate for the links of a station in one direction
    pub fn update_link(&mut self, station: StationId, direction: Direction, sinr: f64, mapper: &dyn LinkQualityMapper) {
        let mcs = mapper.map(sinr);
        for connection in self.connections.values_mut() {
            if connection.station() == station && connection.spec.direction == direction {
                connection.sinr = Some(sinr);
                connection.mcs = Some(mcs);
            }
        }
    }

    /// MCS index change of every connection since the previous call
    pub fn take_mcs_deltas(&mut self) -> Vec<(ConnectionId, i16)> {
        let mut deltas = Vec::new();
        for connection in self.connections.values_mut() {
            let Some(mcs) = connection.mcs else { continue };
            if let Some(previous) = connection.previous_mcs {
                deltas.push((connection.cid(), mcs.index as i16 - previous as i16));
            }
            connection.previous_mcs = Some(mcs.index);
        }
        if !deltas.is_empty() {
            debug!("{} MCS deltas", deltas.len());
        }
        deltas
    }
}
