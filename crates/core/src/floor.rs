//! Turn Controller
//!
//! Arbitrates which party holds the floor and detects barge-in. Every agent
//! response attempt is tagged with a [`Generation`]; interrupting the agent
//! advances the shared [`GenerationGate`], which makes every fragment of the
//! interrupted attempt stale wherever it is still in flight.

use crate::{audio::AudioFrame, turn::Generation};
use serde::Serialize;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info};

/// Shared view of the current generation.
///
/// Cloned into every stage that forwards agent output; a fragment is only
/// forwarded while its generation is still current.
#[derive(Debug, Clone, Default)]
pub struct GenerationGate(Arc<AtomicU64>);

impl GenerationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Generation {
        Generation(self.0.load(Ordering::Acquire))
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.current() == generation
    }

    fn advance(&self) -> Generation {
        Generation(self.0.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Floor {
    Idle,
    User,
    Agent,
}

/// How much user audio is needed before it counts as speech activity.
#[derive(Debug, Clone, PartialEq)]
pub struct BargeInPolicy {
    /// Allow the user to interrupt the agent at all.
    pub enabled: bool,
    /// Minimum RMS level (0.0..=1.0) for a frame to count as voiced.
    pub min_energy: f32,
    /// Minimum contiguous voiced audio before activity qualifies.
    pub min_speech: Duration,
}

impl Default for BargeInPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_energy: 0.02,
            min_speech: Duration::from_millis(200),
        }
    }
}

/// Outcome of feeding user activity to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloorEvent {
    None,
    /// The user took an idle floor.
    UserStarted,
    /// The user interrupted the agent; output of `interrupted` is now stale.
    BargeIn {
        interrupted: Generation,
        current: Generation,
    },
}

pub struct TurnController {
    floor: Floor,
    gate: GenerationGate,
    policy: BargeInPolicy,
    voiced: Duration,
    active: Option<Generation>,
}

impl TurnController {
    pub fn new(policy: BargeInPolicy, gate: GenerationGate) -> Self {
        Self {
            floor: Floor::Idle,
            gate,
            policy,
            voiced: Duration::ZERO,
            active: None,
        }
    }

    pub fn floor(&self) -> Floor {
        self.floor
    }

    pub fn generation(&self) -> Generation {
        self.gate.current()
    }

    /// The response attempt currently allowed to produce output, if any.
    pub fn active_response(&self) -> Option<Generation> {
        self.active
    }

    pub fn gate(&self) -> &GenerationGate {
        &self.gate
    }

    /// Feeds one inbound frame through the sensitivity policy.
    pub fn observe_audio(&mut self, frame: &AudioFrame) -> FloorEvent {
        if frame.energy() >= self.policy.min_energy {
            self.voiced += frame.duration();
        } else {
            self.voiced = Duration::ZERO;
            return FloorEvent::None;
        }
        if self.voiced >= self.policy.min_speech {
            self.on_user_activity()
        } else {
            FloorEvent::None
        }
    }

    /// Qualifying user activity, from audio energy or from the recognizer.
    pub fn on_user_activity(&mut self) -> FloorEvent {
        match self.floor {
            Floor::Idle => {
                debug!("Floor: idle -> user");
                self.floor = Floor::User;
                FloorEvent::UserStarted
            }
            Floor::Agent if self.policy.enabled => match self.interrupt() {
                Some(interrupted) => FloorEvent::BargeIn {
                    interrupted,
                    current: self.gate.current(),
                },
                None => FloorEvent::None,
            },
            Floor::Agent | Floor::User => FloorEvent::None,
        }
    }

    /// Starts a new response attempt for a finalized user turn.
    ///
    /// Any attempt still in flight is superseded first. Returns the new
    /// generation and the superseded one.
    pub fn begin_response(&mut self) -> (Generation, Option<Generation>) {
        let superseded = self.active.take();
        let generation = self.gate.advance();
        self.active = Some(generation);
        self.floor = Floor::User;
        if let Some(old) = superseded {
            info!(%old, new = %generation, "Superseded in-flight response");
        }
        (generation, superseded)
    }

    /// First synthesized audio of `generation` is about to be played.
    /// Returns `false` for stale generations.
    pub fn synthesis_started(&mut self, generation: Generation) -> bool {
        if self.active != Some(generation) || !self.gate.is_current(generation) {
            return false;
        }
        if self.floor != Floor::Agent {
            debug!(%generation, "Floor: -> agent");
            self.floor = Floor::Agent;
        }
        true
    }

    /// Synthesis of `generation` is complete; the floor becomes idle.
    pub fn response_finished(&mut self, generation: Generation) -> bool {
        if self.active != Some(generation) {
            return false;
        }
        self.active = None;
        self.floor = Floor::Idle;
        self.voiced = Duration::ZERO;
        debug!(%generation, "Floor: agent -> idle");
        true
    }

    /// Cancels the in-flight response, if any, and hands the floor to the user.
    pub fn interrupt(&mut self) -> Option<Generation> {
        let interrupted = self.active.take()?;
        let current = self.gate.advance();
        self.floor = Floor::User;
        info!(%interrupted, %current, "Barge-in: agent response interrupted");
        Some(interrupted)
    }
}
