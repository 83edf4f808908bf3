//! Segmenting Queue and Bandwidth-Request Proxy
//!
//! The segmenting queue holds SDUs per connection and cuts them into segments
//! sized to grants. In the master's uplink scheduler the data physically waits
//! at the subscriber stations; the bandwidth-request proxy rebuilds a stand-in
//! backlog from their reports every frame.

use bytes::Bytes;
use common::types::ConnectionId;
use interfaces::telemetry::names;
use interfaces::{BacklogProvider, Segment, TelemetrySample, TelemetrySink};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};

/// IP header overhead added to every stand-in packet
pub const IP_OVERHEAD_BITS: u64 = 160;

/// Segmentation and capacity settings of one scheduler's queue
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Total payload bits the queue holds across connections
    pub capacity_bits: u64,
    /// Smallest payload a fragment may carry
    pub min_segment_bits: u64,
    /// Header carried by every segment
    pub fixed_header_bits: u64,
    /// Extra header of a segment carrying only part of an SDU
    pub extension_header_bits: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity_bits: 320_000,
            min_segment_bits: 1,
            fixed_header_bits: 0,
            extension_header_bits: 0,
        }
    }
}

/// Result of offering data to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub accepted_bits: u64,
    pub dropped_bits: u64,
}

#[derive(Debug)]
struct Sdu {
    remaining_bits: u64,
    data: Bytes,
    /// Part of the SDU has already left in an earlier segment
    started: bool,
}

/// Per-connection FIFO queues with a shared capacity
#[derive(Debug)]
pub struct SegmentingQueue {
    config: QueueConfig,
    queues: BTreeMap<ConnectionId, VecDeque<Sdu>>,
    queued_bits: u64,
    offered_bits: u64,
    dropped_bits: u64,
}

impl SegmentingQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: BTreeMap::new(),
            queued_bits: 0,
            offered_bits: 0,
            dropped_bits: 0,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Payload bits still free
    pub fn free_bits(&self) -> u64 {
        self.config.capacity_bits.saturating_sub(self.queued_bits)
    }

    /// Offer an SDU; the part beyond the free capacity is dropped
    pub fn enqueue(&mut self, cid: ConnectionId, data: Bytes) -> EnqueueOutcome {
        let bits = data.len() as u64 * 8;
        let free = self.free_bits();
        if bits <= free {
            return self.push(cid, bits, bits, data);
        }
        // Byte-backed SDUs are cut at a byte boundary
        let accepted = free - free % 8;
        let data = data.slice(..(accepted / 8) as usize);
        self.push(cid, bits, accepted, data)
    }

    /// Offer an SDU known only by its size
    pub fn enqueue_bits(&mut self, cid: ConnectionId, bits: u64) -> EnqueueOutcome {
        let accepted = bits.min(self.free_bits());
        self.push(cid, bits, accepted, Bytes::new())
    }

    fn push(&mut self, cid: ConnectionId, offered: u64, accepted: u64, data: Bytes) -> EnqueueOutcome {
        let dropped = offered - accepted;
        self.offered_bits += offered;
        self.dropped_bits += dropped;

        if accepted > 0 {
            self.queued_bits += accepted;
            self.queues.entry(cid).or_default().push_back(Sdu { remaining_bits: accepted, data, started: false });
        }
        if dropped > 0 {
            warn!(cid = cid.value(), dropped, "Queue full, dropped {} of {} offered bits", dropped, offered);
        } else {
            trace!(cid = cid.value(), bits = accepted, "Enqueued SDU");
        }

        EnqueueOutcome { accepted_bits: accepted, dropped_bits: dropped }
    }

    /// Bits queued across all connections
    pub fn queued_bits(&self) -> u64 {
        self.queued_bits
    }

    pub fn offered_bits(&self) -> u64 {
        self.offered_bits
    }

    pub fn dropped_bits(&self) -> u64 {
        self.dropped_bits
    }

    /// Dropped over offered bits
    pub fn loss_ratio(&self) -> f64 {
        if self.offered_bits == 0 {
            0.0
        } else {
            self.dropped_bits as f64 / self.offered_bits as f64
        }
    }

    /// Connections with queued data
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.queues.iter().filter(|(_, queue)| !queue.is_empty()).map(|(&cid, _)| cid)
    }

    /// Clear every queue; returns the bits discarded
    pub fn reset(&mut self) -> u64 {
        let bits = self.queued_bits;
        self.queues.clear();
        self.queued_bits = 0;
        if bits > 0 {
            debug!("Queue reset, {} bits discarded", bits);
        }
        bits
    }

    /// Discard the queue of one connection; returns the bits discarded
    pub fn remove_connection(&mut self, cid: ConnectionId) -> u64 {
        let bits: u64 = self
            .queues
            .remove(&cid)
            .map(|queue| queue.iter().map(|sdu| sdu.remaining_bits).sum())
            .unwrap_or(0);
        self.queued_bits -= bits;
        bits
    }
}

impl BacklogProvider for SegmentingQueue {
    fn backlog_bits(&self, cid: ConnectionId) -> u64 {
        self.queues.get(&cid).map_or(0, |queue| queue.iter().map(|sdu| sdu.remaining_bits).sum())
    }

    fn backlog_cost_bits(&self, cid: ConnectionId) -> u64 {
        let Some(queue) = self.queues.get(&cid) else { return 0 };
        queue
            .iter()
            .map(|sdu| {
                let extension = if sdu.started { self.config.extension_header_bits } else { 0 };
                sdu.remaining_bits + self.config.fixed_header_bits + extension
            })
            .sum()
    }

    fn min_grant_bits(&self, cid: ConnectionId) -> u64 {
        let Some(sdu) = self.queues.get(&cid).and_then(VecDeque::front) else { return 0 };
        let fragment = self.config.fixed_header_bits
            + self.config.extension_header_bits
            + self.config.min_segment_bits.min(sdu.remaining_bits);
        if sdu.started {
            fragment
        } else {
            fragment.min(sdu.remaining_bits + self.config.fixed_header_bits)
        }
    }

    fn dequeue_segment(&mut self, cid: ConnectionId, max_bits: u64) -> Option<Segment> {
        let config = self.config;
        let queue = self.queues.get_mut(&cid)?;
        let sdu = queue.front_mut()?;

        // Whole SDU in one segment
        if !sdu.started && sdu.remaining_bits + config.fixed_header_bits <= max_bits {
            let sdu = queue.pop_front()?;
            self.queued_bits -= sdu.remaining_bits;
            trace!(cid = cid.value(), bits = sdu.remaining_bits, "Dequeued whole SDU");
            return Some(Segment {
                cid,
                payload_bits: sdu.remaining_bits,
                header_bits: config.fixed_header_bits,
                first: true,
                last: true,
                data: sdu.data,
            });
        }

        let header = config.fixed_header_bits + config.extension_header_bits;
        let payload = max_bits.saturating_sub(header).min(sdu.remaining_bits);
        if payload == 0 || (payload < sdu.remaining_bits && payload < config.min_segment_bits) {
            return None;
        }

        let first = !sdu.started;
        let last = payload == sdu.remaining_bits;
        let data = if last {
            std::mem::take(&mut sdu.data)
        } else {
            let bytes = ((payload / 8) as usize).min(sdu.data.len());
            sdu.data.split_to(bytes)
        };
        sdu.remaining_bits -= payload;
        sdu.started = true;
        self.queued_bits -= payload;
        if last {
            queue.pop_front();
        }

        trace!(cid = cid.value(), bits = payload, first, last, "Dequeued fragment");
        Some(Segment { cid, payload_bits: payload, header_bits: header, first, last, data })
    }
}

/// Stand-in uplink backlog built from the subscriber stations' reports
#[derive(Debug)]
pub struct BandwidthRequestProxy {
    queue: SegmentingQueue,
    /// Size of one stand-in packet including IP and MAC overhead
    packet_bits: u64,
    /// Queue length last reported per uplink connection, in packets
    reported: BTreeMap<ConnectionId, u64>,
}

impl BandwidthRequestProxy {
    pub fn new(config: QueueConfig, packet_bits: u64, pdu_overhead_bits: u64) -> Self {
        Self {
            queue: SegmentingQueue::new(config),
            packet_bits: packet_bits + IP_OVERHEAD_BITS + pdu_overhead_bits,
            reported: BTreeMap::new(),
        }
    }

    pub fn packet_bits(&self) -> u64 {
        self.packet_bits
    }

    /// Start tracking an uplink connection
    pub fn register(&mut self, cid: ConnectionId) {
        self.reported.entry(cid).or_insert(0);
    }

    pub fn unregister(&mut self, cid: ConnectionId) {
        self.reported.remove(&cid);
        self.queue.remove_connection(cid);
    }

    /// Queue length reported by the peer, in packets
    pub fn report(&mut self, cid: ConnectionId, packets: u64) {
        if let Some(reported) = self.reported.get_mut(&cid) {
            *reported = packets;
        } else {
            trace!(cid = cid.value(), "Bandwidth request for unregistered connection ignored");
        }
    }

    /// Rebuild the stand-in backlog for a new frame
    pub fn wakeup(&mut self, frame: u64, telemetry: &mut dyn TelemetrySink) {
        let reset = self.queue.reset();
        telemetry.emit(TelemetrySample::new(names::QUEUE_RESET_BITS, frame, reset as f64));

        let mut generated = 0u64;
        for (&cid, &packets) in &self.reported {
            for _ in 0..packets {
                if self.queue.free_bits() < self.packet_bits {
                    break;
                }
                self.queue.enqueue_bits(cid, self.packet_bits);
                generated += 1;
            }
        }
        debug!("Frame {}: {} stand-in packets for {} uplink connections", frame, generated, self.reported.len());
    }

    pub fn queue(&self) -> &SegmentingQueue {
        &self.queue
    }
}

impl BacklogProvider for BandwidthRequestProxy {
    fn backlog_bits(&self, cid: ConnectionId) -> u64 {
        self.queue.backlog_bits(cid)
    }

    fn backlog_cost_bits(&self, cid: ConnectionId) -> u64 {
        self.queue.backlog_cost_bits(cid)
    }

    fn min_grant_bits(&self, cid: ConnectionId) -> u64 {
        self.queue.min_grant_bits(cid)
    }

    fn dequeue_segment(&mut self, cid: ConnectionId, max_bits: u64) -> Option<Segment> {
        let segment = self.queue.dequeue_segment(cid, max_bits)?;
        // Served data no longer waits at the peer
        if segment.last {
            if let Some(reported) = self.reported.get_mut(&cid) {
                *reported = reported.saturating_sub(1);
            }
        }
        Some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::TelemetryRecorder;

    const CID: ConnectionId = ConnectionId(1);

    #[test]
    fn test_fragment_to_grant() {
        let mut queue = SegmentingQueue::new(QueueConfig::default());
        queue.enqueue_bits(CID, 10_000);

        let segment = queue.dequeue_segment(CID, 4_000).unwrap();
        assert_eq!(segment.payload_bits, 4_000);
        assert!(segment.first && !segment.last);
        assert_eq!(queue.backlog_bits(CID), 6_000);

        let segment = queue.dequeue_segment(CID, 10_000).unwrap();
        assert_eq!(segment.payload_bits, 6_000);
        assert!(!segment.first && segment.last);
        assert_eq!(queue.queued_bits(), 0);
        assert!(queue.dequeue_segment(CID, 10_000).is_none());
    }

    #[test]
    fn test_overflow_drops_exactly_the_excess() {
        let mut queue = SegmentingQueue::new(QueueConfig::default());
        let mut dropped = 0;
        for _ in 0..40 {
            dropped += queue.enqueue_bits(CID, 10_000).dropped_bits;
        }
        assert_eq!(dropped, 80_000);
        assert_eq!(queue.dropped_bits(), 80_000);
        assert_eq!(queue.queued_bits(), 320_000);
        assert!((queue.loss_ratio() - 0.2).abs() < 1e-12);

        // Size-only SDUs are truncated to the bit
        let mut queue = SegmentingQueue::new(QueueConfig { capacity_bits: 100, ..Default::default() });
        let outcome = queue.enqueue_bits(CID, 160);
        assert_eq!(outcome, EnqueueOutcome { accepted_bits: 100, dropped_bits: 60 });
        assert_eq!(queue.backlog_bits(CID), 100);
    }

    #[test]
    fn test_truncated_sdu_keeps_whole_bytes() {
        let mut queue = SegmentingQueue::new(QueueConfig { capacity_bits: 100, ..Default::default() });
        let outcome = queue.enqueue(CID, Bytes::from((0u8..20).collect::<Vec<u8>>()));
        assert_eq!(outcome, EnqueueOutcome { accepted_bits: 96, dropped_bits: 64 });
        assert_eq!(queue.backlog_bits(CID), 96);

        let segment = queue.dequeue_segment(CID, 1_000).unwrap();
        assert_eq!(segment.payload_bits, 96);
        assert_eq!(segment.data.len(), 12);
        assert_eq!(segment.data[11], 11);
        assert_eq!(queue.queued_bits(), 0);
    }

    #[test]
    fn test_headers_and_minimum_segment() {
        let config = QueueConfig {
            capacity_bits: 10_000,
            min_segment_bits: 100,
            fixed_header_bits: 48,
            extension_header_bits: 16,
        };
        let mut queue = SegmentingQueue::new(config);
        queue.enqueue(CID, Bytes::from(vec![7u8; 125]));
        assert_eq!(queue.backlog_cost_bits(CID), 1_048);
        assert_eq!(queue.min_grant_bits(CID), 164);

        // Too small for the minimum fragment
        assert!(queue.dequeue_segment(CID, 150).is_none());

        let head = queue.dequeue_segment(CID, 464).unwrap();
        assert_eq!((head.payload_bits, head.header_bits), (400, 64));
        assert_eq!(head.data.len(), 50);

        // The tail completes a split SDU and still carries the extension
        assert_eq!(queue.backlog_cost_bits(CID), 664);
        let tail = queue.dequeue_segment(CID, 1_000).unwrap();
        assert_eq!((tail.payload_bits, tail.header_bits), (600, 64));
        assert!(tail.last);
        assert_eq!(tail.data.len(), 75);
        assert_eq!(tail.total_bits(), 664);
    }

    #[test]
    fn test_whole_sdu_has_fixed_header_only() {
        let config = QueueConfig { fixed_header_bits: 48, extension_header_bits: 16, ..Default::default() };
        let mut queue = SegmentingQueue::new(config);
        queue.enqueue_bits(CID, 200);
        let segment = queue.dequeue_segment(CID, 248).unwrap();
        assert_eq!(segment.header_bits, 48);
        assert!(segment.first && segment.last);
    }

    #[test]
    fn test_reset_and_remove() {
        let mut queue = SegmentingQueue::new(QueueConfig::default());
        queue.enqueue_bits(CID, 500);
        queue.enqueue_bits(ConnectionId(2), 700);
        assert_eq!(queue.connections().count(), 2);
        assert_eq!(queue.remove_connection(ConnectionId(2)), 700);
        assert_eq!(queue.reset(), 500);
        assert_eq!(queue.queued_bits(), 0);
    }

    #[test]
    fn test_bandwidth_request_proxy_regenerates() {
        let mut proxy = BandwidthRequestProxy::new(QueueConfig::default(), 1_000, 48);
        assert_eq!(proxy.packet_bits(), 1_208);

        proxy.register(CID);
        proxy.report(CID, 3);
        proxy.report(ConnectionId(9), 5);

        let mut recorder = TelemetryRecorder::new();
        proxy.wakeup(0, &mut recorder);
        assert_eq!(proxy.backlog_bits(CID), 3 * 1_208);
        assert_eq!(proxy.backlog_bits(ConnectionId(9)), 0);

        let segment = proxy.dequeue_segment(CID, 1_208).unwrap();
        assert!(segment.last);

        // The unserved rest is cleared and rebuilt from the updated report
        proxy.wakeup(1, &mut recorder);
        assert_eq!(proxy.backlog_bits(CID), 2 * 1_208);
        assert_eq!(recorder.named(names::QUEUE_RESET_BITS).collect::<Vec<_>>().len(), 2);
        assert_eq!(recorder.sum(names::QUEUE_RESET_BITS), (2 * 1_208) as f64);
    }
}
