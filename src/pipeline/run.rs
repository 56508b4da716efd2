//! Per-run state and the snapshots published from it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{Ledger, SubtaskRecord};

/// Phase of the pipeline.
///
/// # State Machine
/// ```text
/// Idle -> Decomposing -> Executing -> Consolidating -> Done
///             |              |
///             v              v (sub-task failed, run halted)
///           Idle         Executing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Idle,
    Decomposing,
    Executing,
    Consolidating,
    Done,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PipelinePhase::Idle => "idle",
            PipelinePhase::Decomposing => "decomposing",
            PipelinePhase::Executing => "executing",
            PipelinePhase::Consolidating => "consolidating",
            PipelinePhase::Done => "done",
        };
        f.write_str(label)
    }
}

/// "Sub-task X of Y" indicator derived from the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    /// Zero-based index of the sub-task being reflected on or executed
    pub current: Option<usize>,
}

impl Progress {
    fn of(ledger: &Ledger) -> Self {
        Self {
            total: ledger.len(),
            completed: ledger.completed_count(),
            current: ledger.current_index(),
        }
    }
}

/// Immutable view of a run, published after every mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    /// `None` before the first submission
    pub run_id: Option<Uuid>,
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
    pub main_task: String,
    pub phase: PipelinePhase,
    pub sub_tasks: Vec<Arc<SubtaskRecord>>,
    pub final_answer: String,
    pub error: Option<String>,
    pub progress: Progress,
}

impl RunSnapshot {
    /// The state before any task was submitted.
    pub fn idle() -> Self {
        Self {
            run_id: None,
            sequence: 0,
            updated_at: Utc::now(),
            main_task: String::new(),
            phase: PipelinePhase::Idle,
            sub_tasks: Vec::new(),
            final_answer: String::new(),
            error: None,
            progress: Progress::default(),
        }
    }
}

/// Everything one run owns. Built on submit, dropped wholesale by the next.
#[derive(Debug)]
pub struct RunContext {
    pub(super) run_id: Uuid,
    pub(super) main_task: String,
    pub(super) phase: PipelinePhase,
    pub(super) ledger: Ledger,
    pub(super) final_answer: String,
    pub(super) error: Option<String>,
    sequence: u64,
}

impl RunContext {
    pub fn new(main_task: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            main_task: main_task.into(),
            phase: PipelinePhase::Idle,
            ledger: Ledger::new(),
            final_answer: String::new(),
            error: None,
            sequence: 0,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Capture the current state. Each call takes the next sequence number.
    pub fn snapshot(&mut self) -> RunSnapshot {
        self.sequence += 1;
        RunSnapshot {
            run_id: Some(self.run_id),
            sequence: self.sequence,
            updated_at: Utc::now(),
            main_task: self.main_task.clone(),
            phase: self.phase,
            sub_tasks: self.ledger.snapshot(),
            final_answer: self.final_answer.clone(),
            error: self.error.clone(),
            progress: Progress::of(&self.ledger),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SubtaskStatus;

    #[test]
    fn test_snapshot_sequence_increases() {
        let mut ctx = RunContext::new("Plan a trip");
        let first = ctx.snapshot();
        let second = ctx.snapshot();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.run_id, Some(ctx.run_id()));
    }

    #[test]
    fn test_progress_tracks_ledger() {
        let mut ctx = RunContext::new("x");
        ctx.ledger.initialize(["a", "b", "c"]).unwrap();
        ctx.ledger.set_status(0, SubtaskStatus::Reflecting).unwrap();
        ctx.ledger.set_status(0, SubtaskStatus::Executing).unwrap();
        ctx.ledger.set_status(0, SubtaskStatus::Completed).unwrap();
        ctx.ledger.set_status(1, SubtaskStatus::Reflecting).unwrap();

        let snapshot = ctx.snapshot();
        assert_eq!(
            snapshot.progress,
            Progress {
                total: 3,
                completed: 1,
                current: Some(1)
            }
        );
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let mut ctx = RunContext::new("Plan a trip");
        ctx.ledger.initialize(["a"]).unwrap();
        ctx.phase = PipelinePhase::Executing;

        let json = serde_json::to_value(ctx.snapshot()).unwrap();
        assert_eq!(json["mainTask"], "Plan a trip");
        assert_eq!(json["phase"], "executing");
        assert_eq!(json["subTasks"][0]["status"], "pending");
        assert_eq!(json["finalAnswer"], "");
        assert!(json["error"].is_null());
        assert!(json["updatedAt"].is_string());
        assert_eq!(json["progress"]["total"], 1);
    }

    #[test]
    fn test_idle_snapshot_has_no_run() {
        let idle = RunSnapshot::idle();
        assert!(idle.run_id.is_none());
        assert_eq!(idle.phase, PipelinePhase::Idle);
        assert!(idle.sub_tasks.is_empty());
    }
}
