//! HTTP API for the pipeline.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/task` - Submit a new task (one run at a time)
//! - `GET /api/run` - Latest run snapshot
//! - `GET /api/run/stream` - Stream run snapshots via SSE

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
