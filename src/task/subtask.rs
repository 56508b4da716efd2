//! Sub-task records produced by decomposition.
//!
//! Each record has:
//! - A description of what to do (fixed at decomposition time)
//! - A lifecycle status
//! - The reflection and result text streamed in by the model
//! - The web sources the result was grounded on

use serde::{Deserialize, Serialize};

/// Status of a sub-task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Reflecting -> Executing -> Completed
///                 \             \
///                  \-> Failed    \-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// Waiting for earlier sub-tasks to finish
    Pending,
    /// Reflection stream is being drained
    Reflecting,
    /// Execution stream is being drained
    Executing,
    /// Both phases finished successfully
    Completed,
    /// Reflection or execution failed; `result` holds the error message
    Failed,
}

impl SubtaskStatus {
    /// Check if the sub-task is in a terminal state.
    ///
    /// # Property
    /// `is_terminal() => !can_transition_to(s)` for every `s`
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubtaskStatus::Completed | SubtaskStatus::Failed)
    }

    /// Check if a model call for this sub-task is in flight.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, SubtaskStatus::Reflecting | SubtaskStatus::Executing)
    }

    /// Check whether moving to `next` respects the forward-only lifecycle.
    pub fn can_transition_to(&self, next: SubtaskStatus) -> bool {
        use SubtaskStatus::*;
        matches!(
            (self, next),
            (Pending, Reflecting)
                | (Reflecting, Executing)
                | (Executing, Completed)
                | (Reflecting, Failed)
                | (Executing, Failed)
        )
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Reflecting => "reflecting",
            SubtaskStatus::Executing => "executing",
            SubtaskStatus::Completed => "completed",
            SubtaskStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A web source a sub-task result was grounded on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One entry of the decomposed plan.
///
/// # Invariants
/// - `sources` never holds two entries with the same `uri`
/// - `reflection` only grows while `status == Reflecting`
/// - `result` only grows while `status == Executing`
///
/// Fields are read-only outside the ledger; all mutation goes through
/// [`Ledger`](super::Ledger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub(super) description: String,
    pub(super) status: SubtaskStatus,
    pub(super) reflection: String,
    pub(super) result: String,
    pub(super) sources: Vec<Source>,
}

impl SubtaskRecord {
    /// Create a pending record.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: SubtaskStatus::Pending,
            reflection: String::new(),
            result: String::new(),
            sources: Vec::new(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> SubtaskStatus {
        self.status
    }

    pub fn reflection(&self) -> &str {
        &self.reflection
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }
}
