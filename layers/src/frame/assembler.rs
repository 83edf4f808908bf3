//! Frame Assembler
//!
//! Walks the timeline once per frame and dispatches every activation to the
//! handler bound to its phase. The activation order is the only sequencing
//! mechanism: a map handler sees the schedule because the timeline finishes
//! the scheduler's collection first.

use super::timeline::{Action, FrameTimeline, PhaseId};
use crate::LayerError;
use common::types::OperationMode;
use common::utils::time;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Time window of a phase within the current frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseWindow {
    /// Frame number
    pub frame: u64,
    /// Phase being dispatched
    pub phase: PhaseId,
    /// Operation mode of the activation
    pub mode: OperationMode,
    /// Offset of the phase's `Start` from the frame start
    pub offset: Duration,
    /// Duration of the phase's `Start`
    pub duration: Duration,
    /// Symbol duration of the frame
    pub symbol_duration: Duration,
}

impl PhaseWindow {
    /// Whole symbols available to the phase
    pub fn symbols(&self) -> u32 {
        time::whole_symbols(self.duration, self.symbol_duration)
    }

    /// Offset of a symbol of this phase from the frame start
    pub fn symbol_offset(&self, symbol: u32) -> Duration {
        self.offset + time::symbols_duration(symbol, self.symbol_duration)
    }
}

/// Behaviour bound to one phase of the timeline
pub trait PhaseHandler<C>: Send {
    /// Collection begins
    fn start_collection(&mut self, _ctx: &mut C, _window: &PhaseWindow) -> Result<(), LayerError> {
        Ok(())
    }

    /// Collection ends; the phase's result for this frame is produced here
    fn finish_collection(&mut self, _ctx: &mut C, _window: &PhaseWindow) -> Result<(), LayerError> {
        Ok(())
    }

    /// The phase transmits or receives for its window
    fn start(&mut self, ctx: &mut C, window: &PhaseWindow) -> Result<(), LayerError>;
}

/// Outcome of one assembled frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRun {
    /// Frame number
    pub frame: u64,
    /// Activations handed to a handler
    pub dispatched: usize,
    /// Time spent in pauses
    pub paused: Duration,
}

/// Timeline-driven dispatcher for one station
pub struct FrameAssembler<C> {
    timeline: FrameTimeline,
    handlers: Vec<Option<Box<dyn PhaseHandler<C>>>>,
    windows: HashMap<(PhaseId, OperationMode), (Duration, Duration)>,
}

impl<C> FrameAssembler<C> {
    /// Create an assembler over a validated timeline
    pub fn new(timeline: FrameTimeline) -> Self {
        let mut windows = HashMap::new();
        for scheduled in timeline.replay() {
            let activation = scheduled.activation;
            if activation.action == Action::Start {
                windows
                    .entry((activation.phase, activation.mode))
                    .or_insert((scheduled.offset, activation.duration));
            }
        }

        let mut handlers = Vec::with_capacity(timeline.phase_count());
        handlers.resize_with(timeline.phase_count(), || None);

        Self { timeline, handlers, windows }
    }

    /// The timeline being replayed
    pub fn timeline(&self) -> &FrameTimeline {
        &self.timeline
    }

    /// Bind a handler to a phase; a phase takes exactly one handler
    pub fn bind(&mut self, phase: PhaseId, handler: Box<dyn PhaseHandler<C>>) -> Result<(), LayerError> {
        let name = self.timeline.phase_name(phase).to_string();
        let slot = self.handlers.get_mut(phase.0).ok_or_else(|| {
            LayerError::ConfigurationError(format!("cannot bind unknown phase {:?}", phase))
        })?;
        if slot.is_some() {
            return Err(LayerError::ConfigurationError(format!("phase '{}' already has a handler", name)));
        }
        *slot = Some(handler);
        debug!("Bound handler to phase '{}'", name);
        Ok(())
    }

    /// Require that `first` fires before `then` within every frame
    pub fn require_order(&self, first: (PhaseId, Action), then: (PhaseId, Action)) -> Result<(), LayerError> {
        let a = self.timeline.position(first.0, first.1);
        let b = self.timeline.position(then.0, then.1);
        match (a, b) {
            (Some(a), Some(b)) if a < b => Ok(()),
            _ => Err(LayerError::ConfigurationError(format!(
                "{:?} of '{}' must precede {:?} of '{}'",
                first.1, self.timeline.phase_name(first.0), then.1, self.timeline.phase_name(then.0)
            ))),
        }
    }

    /// Replay the timeline for one frame
    pub fn run_frame(&mut self, frame: u64, ctx: &mut C) -> Result<FrameRun, LayerError> {
        let Self { timeline, handlers, windows } = self;
        let symbol_duration = timeline.symbol_duration();
        let mut run = FrameRun { frame, dispatched: 0, paused: Duration::ZERO };

        for scheduled in timeline.replay() {
            let activation = scheduled.activation;
            if activation.action == Action::Pause {
                trace!("Frame {}: pause '{}' for {:?}", frame, timeline.phase_name(activation.phase), activation.duration);
                run.paused += activation.duration;
                continue;
            }

            let Some(handler) = handlers.get_mut(activation.phase.0).and_then(Option::as_mut) else {
                trace!("Frame {}: no handler for '{}'", frame, timeline.phase_name(activation.phase));
                continue;
            };

            let (offset, duration) = windows
                .get(&(activation.phase, activation.mode))
                .copied()
                .unwrap_or((scheduled.offset, Duration::ZERO));
            let window = PhaseWindow {
                frame,
                phase: activation.phase,
                mode: activation.mode,
                offset,
                duration,
                symbol_duration,
            };

            trace!("Frame {}: {:?} '{}' ({:?}) at {:?}",
                   frame, activation.action, timeline.phase_name(activation.phase), activation.mode, scheduled.offset);

            match activation.action {
                Action::StartCollection => handler.start_collection(ctx, &window)?,
                Action::FinishCollection => handler.finish_collection(ctx, &window)?,
                Action::Start => handler.start(ctx, &window)?,
                Action::Pause => {}
            }
            run.dispatched += 1;
        }

        debug!("Frame {} assembled: {} activations dispatched", frame, run.dispatched);
        Ok(run)
    }
}
