//! PHY Service Interface
//!
//! The MAC engine hands one transmission request per burst to the PHY service.
//! Measurements travel the other way through `MacPhyInterface` in the layers crate.

use crate::{InterfaceError, TransmissionRequest};
use tokio::sync::mpsc;
use tracing::trace;

/// Transmit side of the physical layer
pub trait PhyService: Send {
    /// Queue a burst for transmission
    fn transmit(&mut self, request: TransmissionRequest) -> Result<(), InterfaceError>;
}

/// PHY service forwarding requests over a tokio channel
pub struct ChannelPhy {
    tx: mpsc::UnboundedSender<TransmissionRequest>,
}

impl ChannelPhy {
    /// Create a channel-backed PHY service and the receiving end for the consumer
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransmissionRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PhyService for ChannelPhy {
    fn transmit(&mut self, request: TransmissionRequest) -> Result<(), InterfaceError> {
        trace!("PHY request: {:?} {} bits on sub-channel {}",
               request.kind, request.payload_bits, request.resource.sub_channel);
        self.tx.send(request).map_err(|_| InterfaceError::ChannelClosed)
    }
}
