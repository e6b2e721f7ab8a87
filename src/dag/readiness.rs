// src/dag/readiness.rs

//! Trigger rule evaluation over upstream task states.

use crate::dag::instance::TaskState;
use crate::types::TriggerRule;

/// Decision for a `Pending` task after looking at its upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Not decidable yet.
    Wait,
    Ready,
    /// The rule can never be satisfied because an upstream was skipped.
    Skip,
    /// The rule can never be satisfied because an upstream failed.
    UpstreamFailed,
}

impl TriggerRule {
    /// Evaluate this rule against the states of a task's upstreams.
    ///
    /// A task without upstreams is always ready.
    pub fn evaluate<I>(self, upstream: I) -> Readiness
    where
        I: IntoIterator<Item = TaskState>,
    {
        let mut failed = false;
        let mut skipped = false;
        let mut unfinished = false;

        for state in upstream {
            match state {
                TaskState::Failed | TaskState::UpstreamFailed => failed = true,
                TaskState::Skipped => skipped = true,
                TaskState::Success => {}
                _ => unfinished = true,
            }
        }

        match self {
            TriggerRule::AllSuccess => {
                if failed {
                    Readiness::UpstreamFailed
                } else if skipped {
                    Readiness::Skip
                } else if unfinished {
                    Readiness::Wait
                } else {
                    Readiness::Ready
                }
            }
            TriggerRule::NoneFailed => {
                if failed {
                    Readiness::UpstreamFailed
                } else if unfinished {
                    Readiness::Wait
                } else {
                    Readiness::Ready
                }
            }
            TriggerRule::AllDone => {
                if unfinished {
                    Readiness::Wait
                } else {
                    Readiness::Ready
                }
            }
        }
    }
}
