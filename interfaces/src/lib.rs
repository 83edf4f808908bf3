//! External Service Interfaces Library
//! 
//! This crate defines the boundary between the MAC engine and its collaborators:
//! the PHY transmit/measurement service, queue-backlog providers and the telemetry consumer.

pub mod backlog;
pub mod message_types;
pub mod phy;
pub mod telemetry;

use thiserror::Error;

pub use backlog::{BacklogProvider, Segment};
pub use message_types::{
    MeasurementOrigin, MeasuredPhase, MeasurementReport, ResourceDescriptor, TransmissionKind,
    TransmissionRequest,
};
pub use phy::{ChannelPhy, PhyService};
pub use telemetry::{ChannelSink, NullSink, TelemetryRecorder, TelemetrySample, TelemetrySink};

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    EncodingError(#[from] bincode::Error),

    #[error("Invalid message format")]
    InvalidMessage,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Channel closed")]
    ChannelClosed,
}
