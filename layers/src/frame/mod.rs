//! TDD Frame Timing
//! 
//! Frame parameters, the per-role activation timeline and the assembler that replays it.

pub mod assembler;
pub mod structure;
pub mod timeline;

pub use assembler::{FrameAssembler, FrameRun, PhaseHandler, PhaseWindow};
pub use structure::FrameParameters;
pub use timeline::{
    standard_timeline, Action, Activation, FrameTimeline, PhaseId, PhaseState, ScheduledActivation,
    StandardPhases, TimelineBuilder,
};
