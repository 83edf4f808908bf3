//! TDD/OFDMA MAC Engine Library
//!
//! This crate implements the frame timeline and the MAC-layer resource scheduling core
//! of a TDD/OFDMA access system (802.16m-style frame with DL and UL sub-frames).

pub mod frame;
pub mod mac;

use async_trait::async_trait;
use bytes::Bytes;
use common::types::ConnectionId;
use interfaces::InterfaceError;
use thiserror::Error;

/// Common errors for the MAC engine
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Layer not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),
}

impl From<bincode::Error> for LayerError {
    fn from(err: bincode::Error) -> Self {
        LayerError::EncodingError(err.to_string())
    }
}

/// Common trait for protocol layers
#[async_trait]
pub trait ProtocolLayer: Send + Sync {
    /// Initialize the layer
    async fn initialize(&mut self) -> Result<(), LayerError>;

    /// Process data received from the lower layer on a connection
    async fn process_uplink(&mut self, cid: ConnectionId, data: Bytes) -> Result<(), LayerError>;

    /// Process data from the upper layer to be sent on a connection
    async fn process_downlink(&mut self, cid: ConnectionId, data: Bytes) -> Result<(), LayerError>;

    /// Shutdown the layer
    async fn shutdown(&mut self) -> Result<(), LayerError>;
}
