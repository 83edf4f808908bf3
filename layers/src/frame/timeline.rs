//! Frame Timeline
//!
//! Ordered phase activations replayed every frame. The list is built once per
//! station role, validated at construction and never mutated afterwards.

use super::structure::FrameParameters;
use crate::LayerError;
use common::types::{OperationMode, StationRole};
use common::utils::time;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Index of a phase registered with a [`TimelineBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhaseId(pub usize);

/// Transition requested by an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Transmit or receive for the activation's duration
    Start,
    /// Begin collecting compounds for the phase (instantaneous)
    StartCollection,
    /// Stop collecting; schedulers compute their result here (instantaneous)
    FinishCollection,
    /// Idle gap of the given duration (guard time, unmodelled contention slot)
    Pause,
}

/// One scheduled state transition of a phase
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    /// Phase the activation drives
    pub phase: PhaseId,
    /// Operation mode the phase runs in
    pub mode: OperationMode,
    /// Requested transition
    pub action: Action,
    /// Duration, zero for collection actions
    pub duration: Duration,
}

/// Per-phase, per-mode state while walking a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    /// Nothing pending
    Idle,
    /// Collecting compounds
    Collecting,
    /// Collection finished, waiting for its start
    Collected,
    /// Transmitting or receiving
    Active,
}

impl PhaseState {
    /// Apply an action, returning the new state or `None` if not allowed
    pub fn apply(self, action: Action) -> Option<PhaseState> {
        match (self, action) {
            (PhaseState::Idle, Action::StartCollection) => Some(PhaseState::Collecting),
            (PhaseState::Collecting, Action::FinishCollection) => Some(PhaseState::Collected),
            (PhaseState::Idle, Action::Start) | (PhaseState::Collected, Action::Start) => Some(PhaseState::Active),
            _ => None,
        }
    }
}

/// Activation with its offset from the frame start
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledActivation<'a> {
    /// Offset from the frame start at which the activation fires
    pub offset: Duration,
    /// The activation
    pub activation: &'a Activation,
}

/// Builder collecting phases and activations in caller order
#[derive(Debug, Clone)]
pub struct TimelineBuilder {
    frame_duration: Duration,
    symbol_duration: Duration,
    phases: Vec<String>,
    activations: Vec<Activation>,
}

impl TimelineBuilder {
    /// Create a builder for the given frame and symbol durations
    pub fn new(frame_duration: Duration, symbol_duration: Duration) -> Self {
        Self {
            frame_duration,
            symbol_duration,
            phases: Vec::new(),
            activations: Vec::new(),
        }
    }

    /// Register a phase by name, returning the existing id if already known
    pub fn phase(&mut self, name: &str) -> PhaseId {
        if let Some(index) = self.phases.iter().position(|p| p == name) {
            return PhaseId(index);
        }
        self.phases.push(name.to_string());
        PhaseId(self.phases.len() - 1)
    }

    /// Append an activation; order is kept exactly as given
    pub fn add_activation(&mut self, activation: Activation) -> &mut Self {
        self.activations.push(activation);
        self
    }

    /// Append a `Start`
    pub fn start(&mut self, phase: PhaseId, mode: OperationMode, duration: Duration) -> &mut Self {
        self.add_activation(Activation { phase, mode, action: Action::Start, duration })
    }

    /// Append a `StartCollection`
    pub fn start_collection(&mut self, phase: PhaseId, mode: OperationMode) -> &mut Self {
        self.add_activation(Activation { phase, mode, action: Action::StartCollection, duration: Duration::ZERO })
    }

    /// Append a `FinishCollection`
    pub fn finish_collection(&mut self, phase: PhaseId, mode: OperationMode) -> &mut Self {
        self.add_activation(Activation { phase, mode, action: Action::FinishCollection, duration: Duration::ZERO })
    }

    /// Append a `Pause`
    pub fn pause(&mut self, phase: PhaseId, duration: Duration) -> &mut Self {
        self.add_activation(Activation { phase, mode: OperationMode::Pausing, action: Action::Pause, duration })
    }

    /// Validate and freeze the timeline
    pub fn build(self) -> Result<FrameTimeline, LayerError> {
        let timeline = FrameTimeline {
            frame_duration: self.frame_duration,
            symbol_duration: self.symbol_duration,
            phases: self.phases,
            activations: self.activations,
        };
        let total = timeline.validate()?;
        debug!("Timeline with {} phases and {} activations covers {:?}",
               timeline.phases.len(), timeline.activations.len(), total);
        Ok(timeline)
    }
}

/// Immutable, validated activation sequence of one station role
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTimeline {
    frame_duration: Duration,
    symbol_duration: Duration,
    phases: Vec<String>,
    activations: Vec<Activation>,
}

impl FrameTimeline {
    /// Activations in replay order
    pub fn activations(&self) -> &[Activation] {
        &self.activations
    }

    /// Replay one frame: activations with their offsets from the frame start
    pub fn replay(&self) -> impl Iterator<Item = ScheduledActivation<'_>> + '_ {
        self.activations.iter().scan(Duration::ZERO, |offset, activation| {
            let at = *offset;
            if matches!(activation.action, Action::Start | Action::Pause) {
                *offset += activation.duration;
            }
            Some(ScheduledActivation { offset: at, activation })
        })
    }

    /// Configured frame duration
    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Configured symbol duration
    pub fn symbol_duration(&self) -> Duration {
        self.symbol_duration
    }

    /// Number of registered phases
    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Name of a phase
    pub fn phase_name(&self, phase: PhaseId) -> &str {
        self.phases.get(phase.0).map(String::as_str).unwrap_or("<unknown>")
    }

    /// Resolve a phase name; meant for setup, not for the per-frame path
    pub fn phase_id(&self, name: &str) -> Option<PhaseId> {
        self.phases.iter().position(|p| p == name).map(PhaseId)
    }

    /// Symbol offset of a time offset from the frame start
    pub fn offset_in_symbols(&self, offset: Duration) -> u32 {
        time::whole_symbols(offset, self.symbol_duration)
    }

    /// Offset and duration of the `Start` of a phase in a mode
    pub fn start_window(&self, phase: PhaseId, mode: OperationMode) -> Option<(Duration, Duration)> {
        self.replay()
            .find(|s| {
                s.activation.phase == phase && s.activation.mode == mode && s.activation.action == Action::Start
            })
            .map(|s| (s.offset, s.activation.duration))
    }

    /// Position of the first activation matching phase and action
    pub fn position(&self, phase: PhaseId, action: Action) -> Option<usize> {
        self.activations.iter().position(|a| a.phase == phase && a.action == action)
    }

    /// Check all timeline invariants and return the declared frame time.
    ///
    /// Walks the per-phase state machine once, so calling it repeatedly yields
    /// the same answer.
    pub fn validate(&self) -> Result<Duration, LayerError> {
        let mut states: HashMap<(PhaseId, OperationMode), PhaseState> = HashMap::new();
        let mut active: Option<(PhaseId, OperationMode)> = None;
        let mut total = Duration::ZERO;

        for (index, activation) in self.activations.iter().enumerate() {
            let name = self.phases.get(activation.phase.0).ok_or_else(|| {
                LayerError::ConfigurationError(format!("activation {} references unknown phase {:?}", index, activation.phase))
            })?;

            // A started phase runs until the next activation fires
            if let Some(key) = active.take() {
                states.insert(key, PhaseState::Idle);
            }

            match activation.action {
                Action::Pause => {
                    if activation.mode != OperationMode::Pausing {
                        return Err(LayerError::ConfigurationError(
                            format!("pause '{}' must use the Pausing mode", name)
                        ));
                    }
                    total += activation.duration;
                    continue;
                }
                Action::StartCollection | Action::FinishCollection if !activation.duration.is_zero() => {
                    return Err(LayerError::ConfigurationError(
                        format!("{:?} of '{}' must be instantaneous", activation.action, name)
                    ));
                }
                Action::Start if activation.duration.is_zero() => {
                    return Err(LayerError::ConfigurationError(format!("start of '{}' has no duration", name)));
                }
                _ => {}
            }

            if activation.mode == OperationMode::Pausing {
                return Err(LayerError::ConfigurationError(
                    format!("{:?} of '{}' needs the Sending or Receiving mode", activation.action, name)
                ));
            }

            let key = (activation.phase, activation.mode);
            let state = states.get(&key).copied().unwrap_or(PhaseState::Idle);
            let next = state.apply(activation.action).ok_or_else(|| {
                LayerError::ConfigurationError(format!(
                    "'{}' ({:?}) cannot {:?} while {:?}", name, activation.mode, activation.action, state
                ))
            })?;
            states.insert(key, next);

            if activation.action == Action::Start {
                total += activation.duration;
                active = Some(key);
            }
        }

        if let Some(((phase, mode), _)) = states.iter().find(|(_, s)| **s == PhaseState::Collecting) {
            return Err(LayerError::ConfigurationError(format!(
                "'{}' ({:?}) starts collecting but never finishes", self.phase_name(*phase), mode
            )));
        }

        if total != self.frame_duration {
            return Err(LayerError::ConfigurationError(format!(
                "phase durations sum to {:?} but the frame lasts {:?}", total, self.frame_duration
            )));
        }

        Ok(total)
    }
}

/// Phase names used by the standard timelines
pub mod phase_names {
    pub const FRAME_HEAD: &str = "framehead";
    pub const DL_MAP: &str = "dlmap";
    pub const UL_MAP: &str = "ulmap";
    pub const DL_DATA: &str = "dlscheduler";
    pub const UL_DATA: &str = "ulscheduler";
    pub const TTG: &str = "ttg";
    pub const BW_REQUEST: &str = "bwreq";
    pub const RANGING: &str = "ranging";
    pub const RTG: &str = "rtg";
}

/// Phase ids of a standard timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardPhases {
    pub frame_head: PhaseId,
    pub dl_map: PhaseId,
    pub ul_map: PhaseId,
    pub dl_data: PhaseId,
    pub ul_data: PhaseId,
    pub ttg: PhaseId,
    pub bw_request: PhaseId,
    pub ranging: PhaseId,
    pub rtg: PhaseId,
}

/// Build the standard timeline of a station role.
///
/// The base station sends the DL sub-frame and receives the UL data phase;
/// the subscriber station mirrors it. The base station finishes its scheduler
/// collections before its map collections, so every map is built from the
/// schedule of the same frame. The subscriber station finishes its scheduler
/// collections only after the maps have been received.
pub fn standard_timeline(
    params: &FrameParameters,
    role: StationRole,
) -> Result<(FrameTimeline, StandardPhases), LayerError> {
    params.validate()?;

    let (down, up) = match role {
        StationRole::BaseStation => (OperationMode::Sending, OperationMode::Receiving),
        StationRole::SubscriberStation => (OperationMode::Receiving, OperationMode::Sending),
    };

    let mut builder = TimelineBuilder::new(params.frame_duration, params.symbol_duration);
    let phases = StandardPhases {
        frame_head: builder.phase(phase_names::FRAME_HEAD),
        dl_map: builder.phase(phase_names::DL_MAP),
        ul_map: builder.phase(phase_names::UL_MAP),
        dl_data: builder.phase(phase_names::DL_DATA),
        ul_data: builder.phase(phase_names::UL_DATA),
        ttg: builder.phase(phase_names::TTG),
        bw_request: builder.phase(phase_names::BW_REQUEST),
        ranging: builder.phase(phase_names::RANGING),
        rtg: builder.phase(phase_names::RTG),
    };

    builder
        .start_collection(phases.frame_head, down)
        .start_collection(phases.dl_map, down)
        .start_collection(phases.ul_map, down)
        .start_collection(phases.dl_data, down)
        .start_collection(phases.ul_data, up);

    match role {
        StationRole::BaseStation => {
            builder
                .finish_collection(phases.dl_data, down)
                .finish_collection(phases.ul_data, up)
                .finish_collection(phases.dl_map, down)
                .finish_collection(phases.ul_map, down)
                .finish_collection(phases.frame_head, down)
                .start(phases.frame_head, down, params.symbols(params.frame_head_symbols))
                .start(phases.dl_map, down, params.symbols(params.dl_map_symbols))
                .start(phases.ul_map, down, params.symbols(params.ul_map_symbols));
        }
        StationRole::SubscriberStation => {
            builder
                .finish_collection(phases.frame_head, down)
                .finish_collection(phases.dl_map, down)
                .finish_collection(phases.ul_map, down)
                .start(phases.frame_head, down, params.symbols(params.frame_head_symbols))
                .start(phases.dl_map, down, params.symbols(params.dl_map_symbols))
                .start(phases.ul_map, down, params.symbols(params.ul_map_symbols))
                .finish_collection(phases.dl_data, down)
                .finish_collection(phases.ul_data, up);
        }
    }

    builder
        .start(phases.dl_data, down, params.symbols(params.dl_data_symbols))
        .pause(phases.ttg, params.ttg)
        .start(phases.ul_data, up, params.symbols(params.ul_data_symbols))
        .pause(phases.bw_request, params.symbols(params.bw_request_symbols))
        .pause(phases.ranging, params.symbols(params.ranging_symbols))
        .pause(phases.rtg, params.rtg);

    let timeline = builder.build()?;
    info!("Built {:?} timeline: {} activations over {:?}",
          role, timeline.activations().len(), timeline.frame_duration());
    Ok((timeline, phases))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_phase_builder() -> (TimelineBuilder, PhaseId, PhaseId, PhaseId) {
        let mut builder = TimelineBuilder::new(Duration::from_micros(1000), Duration::from_micros(100));
        let a = builder.phase("a");
        let b = builder.phase("b");
        let c = builder.phase("c");
        (builder, a, b, c)
    }

    #[test]
    fn test_replay_is_non_mutating() {
        let (mut builder, a, b, c) = three_phase_builder();
        builder
            .start(a, OperationMode::Sending, Duration::from_micros(300))
            .pause(b, Duration::from_micros(200))
            .start(c, OperationMode::Receiving, Duration::from_micros(500));
        let timeline = builder.build().unwrap();

        let first: Vec<(Duration, Activation)> =
            timeline.replay().map(|s| (s.offset, s.activation.clone())).collect();
        let second: Vec<(Duration, Activation)> =
            timeline.replay().map(|s| (s.offset, s.activation.clone())).collect();

        assert_eq!(first, second);
        let phases: Vec<PhaseId> = first.iter().map(|(_, act)| act.phase).collect();
        assert_eq!(phases, vec![a, b, c]);
        assert_eq!(first[2].0, Duration::from_micros(500));
        assert_eq!(timeline.offset_in_symbols(first[2].0), 5);
    }

    #[test]
    fn test_duration_sum_must_match_frame() {
        let (mut builder, a, b, _) = three_phase_builder();
        builder
            .start(a, OperationMode::Sending, Duration::from_micros(300))
            .pause(b, Duration::from_micros(200));
        let err = builder.build().unwrap_err();
        assert!(matches!(err, LayerError::ConfigurationError(_)));
    }

    #[test]
    fn test_collection_must_finish() {
        let (mut builder, a, _, _) = three_phase_builder();
        builder
            .start_collection(a, OperationMode::Sending)
            .pause(a, Duration::from_micros(1000));
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_start_requires_finished_collection() {
        let (mut builder, a, _, _) = three_phase_builder();
        builder
            .start_collection(a, OperationMode::Sending)
            .start(a, OperationMode::Sending, Duration::from_micros(1000))
            .finish_collection(a, OperationMode::Sending);
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_pause_requires_pausing_mode() {
        let (mut builder, a, _, _) = three_phase_builder();
        builder.add_activation(Activation {
            phase: a,
            mode: OperationMode::Sending,
            action: Action::Pause,
            duration: Duration::from_micros(1000),
        });
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_standard_timelines_fill_frame() {
        let params = FrameParameters::default();
        for role in [StationRole::BaseStation, StationRole::SubscriberStation] {
            let (timeline, phases) = standard_timeline(&params, role).unwrap();
            // Validation is idempotent
            assert_eq!(timeline.validate().unwrap(), params.frame_duration);
            assert_eq!(timeline.validate().unwrap(), params.frame_duration);

            let (offset, duration) = timeline
                .start_window(phases.ul_data, match role {
                    StationRole::BaseStation => OperationMode::Receiving,
                    StationRole::SubscriberStation => OperationMode::Sending,
                })
                .unwrap();
            assert_eq!(offset, params.symbols(24) + params.ttg);
            assert_eq!(duration, params.symbols(21));
        }
    }

    #[test]
    fn test_base_station_schedules_before_maps() {
        let (timeline, phases) = standard_timeline(&FrameParameters::default(), StationRole::BaseStation).unwrap();
        let dl_schedule = timeline.position(phases.dl_data, Action::FinishCollection).unwrap();
        let ul_schedule = timeline.position(phases.ul_data, Action::FinishCollection).unwrap();
        let dl_map = timeline.position(phases.dl_map, Action::FinishCollection).unwrap();
        let ul_map = timeline.position(phases.ul_map, Action::FinishCollection).unwrap();
        let dl_start = timeline.position(phases.dl_data, Action::Start).unwrap();
        assert!(dl_schedule < dl_map && ul_schedule < ul_map);
        assert!(dl_map < dl_start);
        assert_eq!(timeline.phase_id("ttg"), Some(phases.ttg));
    }

    #[test]
    fn test_standard_timeline_rejects_wrong_gaps() {
        let params = FrameParameters { rtg: Duration::from_micros(150), ..Default::default() };
        assert!(standard_timeline(&params, StationRole::BaseStation).is_err());
    }
}
