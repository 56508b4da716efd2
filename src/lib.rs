//! # stepwise
//!
//! Plan, reflect, execute and consolidate a free-form task on top of the
//! Gemini text-generation API.
//!
//! This library provides:
//! - A sequential pipeline that decomposes a task into ordered sub-tasks
//! - Streamed, search-grounded execution of each sub-task
//! - Immutable run snapshots published after every streamed chunk
//! - An HTTP/SSE API for submitting tasks and following a run
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │            Pipeline              │
//!        │  (owns the run, publishes        │
//!        │   snapshots)                     │
//!        └────────┬───────────────┬─────────┘
//!                 │               │
//!                 ▼               ▼
//!        ┌─────────────┐   ┌─────────────┐
//!        │ ModelGateway│   │   Ledger    │
//!        │  + prompts  │   │ (sub-tasks) │
//!        └──────┬──────┘   └─────────────┘
//!               ▼
//!        ┌─────────────┐
//!        │GeminiClient │
//!        └─────────────┘
//! ```
//!
//! ## Task Flow
//! 1. Receive a task via API
//! 2. Decompose it into ordered sub-tasks
//! 3. For each sub-task: stream a reflection, then a grounded execution
//! 4. Stream a consolidated final answer
//!
//! ## Modules
//! - `pipeline`: The sequential execution engine and run snapshots
//! - `task`: Sub-task records and the ledger
//! - `llm`: Gemini client and the model gateway
//! - `prompt`: Prompt templates

pub mod api;
pub mod config;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod task;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use pipeline::{Pipeline, PipelinePhase, RunSnapshot, SubmitError};
