//! Sequential execution engine.
//!
//! One run at a time: decompose the task, then reflect on and execute each
//! sub-task strictly in order, then consolidate. Every mutation of the run
//! is followed by a published [`RunSnapshot`]; the latest snapshot is kept
//! behind a lock and every snapshot is fanned out on a broadcast channel.
//!
//! Errors never escape a run. They are captured in the snapshot (and on the
//! failed sub-task) and the run stops.

mod run;

pub use run::{PipelinePhase, Progress, RunContext, RunSnapshot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::llm::{GenerationError, ModelGateway};
use crate::task::{LedgerError, SubtaskStatus};

/// Capacity of the snapshot broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// A submission that was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Task is empty")]
    EmptyTask,

    #[error("A run is already in progress")]
    RunInProgress,
}

/// A run started in the background.
#[derive(Debug)]
pub struct Submission {
    pub run_id: Uuid,
    /// Resolves to the terminal snapshot
    pub handle: JoinHandle<Arc<RunSnapshot>>,
}

/// Failure of one sub-task step.
#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Holds the re-entrancy flag for the lifetime of a run.
struct ActiveGuard(Arc<AtomicBool>);

impl ActiveGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The engine. Cheap to clone; clones share the same run slot and channel.
#[derive(Clone)]
pub struct Pipeline {
    gateway: ModelGateway,
    active: Arc<AtomicBool>,
    latest: Arc<RwLock<Arc<RunSnapshot>>>,
    events_tx: broadcast::Sender<Arc<RunSnapshot>>,
}

impl Pipeline {
    pub fn new(gateway: ModelGateway) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gateway,
            active: Arc::new(AtomicBool::new(false)),
            latest: Arc::new(RwLock::new(Arc::new(RunSnapshot::idle()))),
            events_tx,
        }
    }

    /// Start a run in the background and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, task: &str) -> Result<Submission, SubmitError> {
        let (ctx, guard) = self.begin(task)?;
        let run_id = ctx.run_id();
        let pipeline = self.clone();
        let handle = tokio::spawn(async move { pipeline.drive(ctx, guard).await });
        Ok(Submission { run_id, handle })
    }

    /// Drive a run to its terminal state on the current task.
    pub async fn run(&self, task: &str) -> Result<Arc<RunSnapshot>, SubmitError> {
        let (ctx, guard) = self.begin(task)?;
        Ok(self.drive(ctx, guard).await)
    }

    /// Latest published snapshot.
    pub async fn snapshot(&self) -> Arc<RunSnapshot> {
        Arc::clone(&*self.latest.read().await)
    }

    /// Receive every snapshot published from now on, in publish order.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RunSnapshot>> {
        self.events_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn begin(&self, task: &str) -> Result<(RunContext, ActiveGuard), SubmitError> {
        let task = task.trim();
        if task.is_empty() {
            return Err(SubmitError::EmptyTask);
        }
        let guard = ActiveGuard::acquire(&self.active).ok_or_else(|| {
            tracing::debug!("Submission ignored, a run is already in progress");
            SubmitError::RunInProgress
        })?;
        Ok((RunContext::new(task), guard))
    }

    async fn drive(&self, mut ctx: RunContext, _guard: ActiveGuard) -> Arc<RunSnapshot> {
        let run_id = ctx.run_id();
        tracing::info!(%run_id, task = %ctx.main_task, "Run started");

        ctx.phase = PipelinePhase::Decomposing;
        self.publish(&mut ctx).await;

        let plan = match self.gateway.decompose(&ctx.main_task).await {
            Ok(sub_tasks) => ctx.ledger.initialize(sub_tasks).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(message) = plan {
            tracing::warn!(%run_id, error = %message, "Decomposition failed");
            ctx.error = Some(message);
            ctx.phase = PipelinePhase::Idle;
            return self.publish(&mut ctx).await;
        }

        tracing::info!(%run_id, sub_tasks = ctx.ledger.len(), "Plan ready");
        ctx.phase = PipelinePhase::Executing;
        self.publish(&mut ctx).await;

        for index in 0..ctx.ledger.len() {
            if let Err(e) = self.run_subtask(&mut ctx, index).await {
                Self::halt(&mut ctx, index, e);
                return self.publish(&mut ctx).await;
            }
        }

        ctx.phase = PipelinePhase::Consolidating;
        self.publish(&mut ctx).await;

        let mut deltas = self.gateway.consolidate_stream(&ctx.main_task, &ctx.ledger);
        while let Some(delta) = deltas.next().await {
            match delta {
                Ok(delta) => {
                    ctx.final_answer.push_str(&delta);
                    self.publish(&mut ctx).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(%run_id, error = %e.source, "Consolidation failed");
                    } else {
                        tracing::error!(%run_id, error = %e.source, "Consolidation failed");
                    }
                    ctx.error = Some(e.to_string());
                    break;
                }
            }
        }

        ctx.phase = PipelinePhase::Done;
        tracing::info!(
            %run_id,
            answer_len = ctx.final_answer.len(),
            failed = ctx.error.is_some(),
            "Run finished"
        );
        self.publish(&mut ctx).await
    }

    /// Reflect on, then execute, sub-task `index`.
    async fn run_subtask(&self, ctx: &mut RunContext, index: usize) -> Result<(), StepError> {
        let run_id = ctx.run_id;

        ctx.ledger.set_status(index, SubtaskStatus::Reflecting)?;
        tracing::debug!(%run_id, index, "Reflecting");
        self.publish(ctx).await;

        let mut deltas = self.gateway.reflect_stream(&ctx.main_task, &ctx.ledger, index);
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            tracing::trace!(%run_id, index, len = delta.len(), "Reflection delta");
            ctx.ledger.append_reflection(index, &delta)?;
            self.publish(ctx).await;
        }

        ctx.ledger.set_status(index, SubtaskStatus::Executing)?;
        tracing::debug!(%run_id, index, "Executing");
        self.publish(ctx).await;

        let mut chunks = self.gateway.execute_stream(&ctx.main_task, &ctx.ledger, index);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if !chunk.text.is_empty() {
                ctx.ledger.append_result(index, &chunk.text)?;
            }
            let added = ctx.ledger.merge_sources(index, &chunk.citations)?;
            if added > 0 {
                tracing::debug!(%run_id, index, added, "Sources merged");
            }
            self.publish(ctx).await;
        }

        ctx.ledger.set_status(index, SubtaskStatus::Completed)?;
        tracing::info!(%run_id, index, "Sub-task completed");
        self.publish(ctx).await;
        Ok(())
    }

    /// Record a sub-task failure. Later sub-tasks stay Pending.
    fn halt(ctx: &mut RunContext, index: usize, error: StepError) {
        let run_id = ctx.run_id;
        let message = error.to_string();
        match &error {
            StepError::Generation(e) if e.is_transient() => {
                tracing::warn!(%run_id, index, stage = %e.stage, error = %e.source, "Sub-task failed");
            }
            StepError::Generation(e) => {
                tracing::error!(%run_id, index, stage = %e.stage, error = %e.source, "Sub-task failed");
            }
            StepError::Ledger(e) => {
                tracing::error!(%run_id, index, error = %e, "Ledger rejected a mutation");
            }
        }
        if let Err(e) = ctx.ledger.fail(index, message.clone()) {
            tracing::error!(%run_id, index, error = %e, "Could not mark sub-task as failed");
        }
        ctx.error = Some(message);
    }

    async fn publish(&self, ctx: &mut RunContext) -> Arc<RunSnapshot> {
        let snapshot = Arc::new(ctx.snapshot());
        *self.latest.write().await = Arc::clone(&snapshot);
        // Sending fails only when nobody is subscribed.
        let _ = self.events_tx.send(Arc::clone(&snapshot));
        snapshot
    }
}
