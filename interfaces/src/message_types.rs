//! Message Types for MAC-PHY Communication
//!
//! Defines the measurement reports delivered by the PHY service and the
//! transmission requests the MAC hands to it

use bytes::Bytes;
use common::types::{ConnectionId, Db, Dbm, Direction, StationId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a measurement was taken
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MeasurementOrigin {
    /// Measured by this station's own receiver
    Local,
    /// Measured by the peer and reported over the air
    Remote,
}

/// Frame part during which a measurement was taken
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MeasuredPhase {
    /// Frame head or MAP broadcast
    FrameHead,
    /// Contention slots (bandwidth request, ranging)
    Contention,
    /// Data sub-phase with spatially co-scheduled streams
    SdmaData,
}

/// Carrier/interference measurement for one link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementReport {
    /// Frame number
    pub frame: u64,
    /// Station whose link was measured
    pub station: StationId,
    /// Transmitter of the measured carrier, or the interfering co-scheduled
    /// station for SDMA data measurements
    pub peer: StationId,
    /// Direction of the measured link
    pub direction: Direction,
    /// Received carrier power
    pub carrier: Dbm,
    /// Received interference plus noise
    pub interference: Dbm,
    /// Estimated path loss, if known
    pub pathloss: Option<Db>,
    /// Local or remote measurement
    pub origin: MeasurementOrigin,
    /// Frame part the measurement belongs to
    pub phase: MeasuredPhase,
}

impl MeasurementReport {
    /// Signal to interference ratio of this measurement
    pub fn sinr(&self) -> Db {
        self.carrier.ratio_to(self.interference)
    }
}

/// Position of a transmission in the frame's time/frequency grid
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceDescriptor {
    /// Sub-channel index
    pub sub_channel: u16,
    /// Beam (spatial layer) index
    pub beam: u8,
    /// First symbol relative to the phase start
    pub start_symbol: u32,
    /// Number of symbols
    pub symbols: u32,
    /// Offset of the transmission from the frame start
    pub offset: Duration,
    /// Transmission duration
    pub duration: Duration,
}

/// What a transmission carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransmissionKind {
    /// Frame head (preamble/FCH)
    FrameHead,
    /// DL-MAP or UL-MAP broadcast
    Map(Direction),
    /// User data burst
    Data(Direction),
}

/// Request handed to the PHY service for one burst
#[derive(Debug, Clone)]
pub struct TransmissionRequest {
    /// Frame number
    pub frame: u64,
    /// Transmitting station
    pub source: StationId,
    /// Receiving station, `None` for broadcasts
    pub destination: Option<StationId>,
    /// Connection the payload belongs to
    pub cid: Option<ConnectionId>,
    /// Kind of transmission
    pub kind: TransmissionKind,
    /// Payload bytes (may be empty for modelled-only payloads)
    pub payload: Bytes,
    /// Payload length in bits including MAC headers
    pub payload_bits: u64,
    /// Resource used
    pub resource: ResourceDescriptor,
    /// Index of the MCS in the station's MCS table
    pub mcs_index: u8,
    /// Transmit power
    pub tx_power: Dbm,
}
