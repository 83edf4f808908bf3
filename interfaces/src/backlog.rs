//! Queue Backlog Provider Interface
//!
//! Schedulers see pending data only through this trait, so the queue may be a
//! local buffer or a proxy for data that physically waits at a peer station.

use bytes::Bytes;
use common::types::ConnectionId;
use common::utils::ceil_div;

/// A piece of queued data cut to fit a grant
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Connection the data belongs to
    pub cid: ConnectionId,
    /// Payload bits carried
    pub payload_bits: u64,
    /// MAC header bits added for this segment
    pub header_bits: u64,
    /// Segment starts an SDU
    pub first: bool,
    /// Segment completes an SDU
    pub last: bool,
    /// Payload bytes, empty for modelled-only data
    pub data: Bytes,
}

impl Segment {
    /// Bits occupied on air
    pub fn total_bits(&self) -> u64 {
        self.payload_bits + self.header_bits
    }
}

/// Source of per-connection backlog for a scheduler
pub trait BacklogProvider: Send {
    /// Pending payload bits of a connection
    fn backlog_bits(&self, cid: ConnectionId) -> u64;

    /// Pending payload bytes of a connection
    fn backlog_bytes(&self, cid: ConnectionId) -> u64 {
        ceil_div(self.backlog_bits(cid), 8)
    }

    /// On-air bits (payload plus headers) needed to drain a connection completely
    fn backlog_cost_bits(&self, cid: ConnectionId) -> u64 {
        self.backlog_bits(cid)
    }

    /// Smallest grant, in bits, from which a segment can still be cut
    fn min_grant_bits(&self, cid: ConnectionId) -> u64;

    /// Cut the next segment of at most `max_bits` on-air bits
    fn dequeue_segment(&mut self, cid: ConnectionId, max_bits: u64) -> Option<Segment>;
}
