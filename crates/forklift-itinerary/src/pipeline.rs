//! Filtered pipelines
//!
//! A pipeline is an ordered list of steps. Each step is included for a VM
//! iff every bit of its `all` mask holds and, when `any` is non-zero, at
//! least one bit of `any` holds.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flag::{Flag, Predicate};
use crate::phase::Phase;

/// Errors from itinerary navigation
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ItineraryError {
    /// The phase is not part of the filtered pipeline
    #[error("phase {phase} is not in the {pipeline} itinerary for this VM")]
    PhaseNotInItinerary {
        /// The phase that was looked up
        phase: Phase,
        /// Pipeline name
        pipeline: &'static str,
    },
}

/// A pipeline step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    /// Phase entered when the step runs
    pub name: Phase,
    /// Every bit must hold
    pub all: Flag,
    /// At least one bit must hold (ignored when empty)
    pub any: Flag,
}

impl Step {
    /// An unconditional step
    pub const fn always(name: Phase) -> Self {
        Self {
            name,
            all: Flag::NONE,
            any: Flag::NONE,
        }
    }

    /// A step requiring every bit of `all`
    pub const fn all(name: Phase, all: Flag) -> Self {
        Self {
            name,
            all,
            any: Flag::NONE,
        }
    }

    /// A step requiring at least one bit of `any`
    pub const fn any(name: Phase, any: Flag) -> Self {
        Self {
            name,
            all: Flag::NONE,
            any,
        }
    }

    /// Whether the step is included under `predicate`
    pub fn included(&self, predicate: &dyn Predicate) -> bool {
        let all = self.all.bits().all(|bit| predicate.evaluate(bit));
        let any = self.any.is_empty() || self.any.bits().any(|bit| predicate.evaluate(bit));
        all && any
    }
}

/// Result of asking for the step after the current one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    /// Advance to this phase
    Step(Phase),
    /// The current phase was the last step
    Done,
}

/// Step progress through an itinerary
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Progress {
    /// Steps completed
    pub completed: u64,
    /// Steps in the filtered itinerary
    pub total: u64,
}

impl Progress {
    /// Sum two progress values
    pub fn add(self, other: Progress) -> Progress {
        Progress {
            completed: self.completed + other.completed,
            total: self.total + other.total,
        }
    }

    /// Fraction complete in `[0, 1]`; zero when `total` is zero
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// An ordered, conditionally filtered list of steps
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipeline {
    /// Pipeline name
    pub name: &'static str,
    /// Unfiltered steps
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// The filtered step list
    pub fn steps(&self, predicate: &dyn Predicate) -> Vec<Phase> {
        self.steps
            .iter()
            .filter(|s| s.included(predicate))
            .map(|s| s.name)
            .collect()
    }

    /// The first included step
    pub fn first(&self, predicate: &dyn Predicate) -> Next {
        self.steps(predicate)
            .first()
            .map_or(Next::Done, |p| Next::Step(*p))
    }

    /// Whether `phase` is an included step
    pub fn contains(&self, phase: Phase, predicate: &dyn Predicate) -> bool {
        self.steps(predicate).contains(&phase)
    }

    /// The included step after `current`
    ///
    /// `Pending` is treated as the position before the first step.
    pub fn next(&self, current: Phase, predicate: &dyn Predicate) -> Result<Next, ItineraryError> {
        if current == Phase::Pending {
            return Ok(self.first(predicate));
        }
        let steps = self.steps(predicate);
        let index = self.index_of(&steps, current)?;
        Ok(steps
            .get(index + 1)
            .map_or(Next::Done, |p| Next::Step(*p)))
    }

    /// Progress at `current`
    ///
    /// `completed` counts the steps before `current`; the last step counts
    /// as complete once reached.
    pub fn progress(
        &self,
        current: Phase,
        predicate: &dyn Predicate,
    ) -> Result<Progress, ItineraryError> {
        let steps = self.steps(predicate);
        let total = steps.len() as u64;
        if current == Phase::Pending {
            return Ok(Progress {
                completed: 0,
                total,
            });
        }
        let index = self.index_of(&steps, current)? as u64;
        let completed = if index + 1 == total { total } else { index };
        Ok(Progress { completed, total })
    }

    fn index_of(&self, steps: &[Phase], current: Phase) -> Result<usize, ItineraryError> {
        steps
            .iter()
            .position(|p| *p == current)
            .ok_or(ItineraryError::PhaseNotInItinerary {
                phase: current,
                pipeline: self.name,
            })
    }
}
