//! Outbound Telemetry
//!
//! The engine only emits named values. Aggregation and persistence belong to
//! whoever consumes the sink.

use crate::InterfaceError;
use common::types::ConnectionId;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::trace;

/// Well-known telemetry names
pub mod names {
    /// Queued bits per connection after a scheduling run
    pub const BUFFER_SIZE: &str = "mac.buffer.size";
    /// Dropped bits over offered bits of a queue
    pub const BUFFER_LOSS_RATIO: &str = "mac.buffer.lossRatio";
    /// Bits cleared by a queue reset
    pub const QUEUE_RESET_BITS: &str = "mac.schedulerQueue.resetted.bits";
    /// Grant start offset from the frame start, seconds
    pub const FRAME_OFFSET_DELAY: &str = "mac.frameOffsetDelay";
    /// Grant duration, seconds
    pub const TRANSMISSION_DELAY: &str = "mac.transmissionDelay";
    /// SINR of a granted connection, dB
    pub const GRANT_SINR: &str = "mac.grant.sinr";
    /// CIR of a granted connection, dB
    pub const GRANT_CIR: &str = "mac.grant.cir";
    /// Cached carrier level of a granted connection, dBm
    pub const GRANT_CARRIER: &str = "mac.grant.carrier";
    /// Cached interference level of a granted connection, dBm
    pub const GRANT_INTERFERENCE: &str = "mac.grant.interference";
    /// Predicted packet error rate of a grant
    pub const GRANT_PER: &str = "mac.grant.per";
    /// MCS index change since the previous frame
    pub const MCS_DELTA: &str = "mac.mcs.delta";
    /// Connection deferred because its link is not servable
    pub const SCHEDULER_DEFERRED: &str = "mac.scheduler.deferred";
    /// MAP message size, bits
    pub const MAP_SIZE: &str = "mac.map.size";
    /// Connections released by dead-station detection
    pub const DEAD_STATION_REMOVED: &str = "mac.deadStation.removed";
}

/// One emitted value
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    /// Value name, see [`names`]
    pub name: &'static str,
    /// Frame number the value belongs to
    pub frame: u64,
    /// Connection the value belongs to, if any
    pub cid: Option<ConnectionId>,
    /// The value
    pub value: f64,
}

impl TelemetrySample {
    /// Sample not bound to a connection
    pub fn new(name: &'static str, frame: u64, value: f64) -> Self {
        Self { name, frame, cid: None, value }
    }

    /// Sample bound to a connection
    pub fn for_connection(name: &'static str, frame: u64, cid: ConnectionId, value: f64) -> Self {
        Self { name, frame, cid: Some(cid), value }
    }
}

/// Consumer of telemetry values
pub trait TelemetrySink: Send {
    /// Emit one value
    fn emit(&mut self, sample: TelemetrySample);
}

/// Sink discarding everything
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&mut self, _sample: TelemetrySample) {}
}

/// Sink forwarding samples over a tokio channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TelemetrySample>,
}

impl ChannelSink {
    /// Create a channel-backed sink and the receiving end for the consumer
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TelemetrySample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn emit(&mut self, sample: TelemetrySample) {
        if self.tx.send(sample).is_err() {
            trace!("Telemetry consumer gone, sample dropped");
        }
    }
}

/// Summary of one named series
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesSummary {
    /// Number of samples
    pub count: u64,
    /// Sum of all samples
    pub sum: f64,
    /// Smallest sample
    pub min: f64,
    /// Largest sample
    pub max: f64,
}

impl SeriesSummary {
    /// Mean of the samples
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// In-memory recorder, used by tests and by the station binary's summary
#[derive(Debug, Default)]
pub struct TelemetryRecorder {
    samples: Vec<TelemetrySample>,
}

impl TelemetryRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Move everything currently buffered in a channel into the recorder
    pub fn drain_from(&mut self, rx: &mut mpsc::UnboundedReceiver<TelemetrySample>) {
        while let Ok(sample) = rx.try_recv() {
            self.samples.push(sample);
        }
    }

    /// All recorded samples in emission order
    pub fn samples(&self) -> &[TelemetrySample] {
        &self.samples
    }

    /// Samples with the given name
    pub fn named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TelemetrySample> + 'a {
        self.samples.iter().filter(move |s| s.name == name)
    }

    /// Sum of all samples with the given name
    pub fn sum(&self, name: &str) -> f64 {
        self.named(name).map(|s| s.value).sum()
    }

    /// Per-name summary in name order
    pub fn summary(&self) -> BTreeMap<String, SeriesSummary> {
        let mut series: BTreeMap<String, SeriesSummary> = BTreeMap::new();
        for sample in &self.samples {
            series
                .entry(sample.name.to_string())
                .and_modify(|s| {
                    s.count += 1;
                    s.sum += sample.value;
                    s.min = s.min.min(sample.value);
                    s.max = s.max.max(sample.value);
                })
                .or_insert(SeriesSummary {
                    count: 1,
                    sum: sample.value,
                    min: sample.value,
                    max: sample.value,
                });
        }
        series
    }

    /// Summary rendered as pretty JSON
    pub fn summary_json(&self) -> Result<String, InterfaceError> {
        Ok(serde_json::to_string_pretty(&self.summary())?)
    }
}

impl TelemetrySink for TelemetryRecorder {
    fn emit(&mut self, sample: TelemetrySample) {
        self.samples.push(sample);
    }
}
