//! HTTP API for redline.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/tasks` - Start a task for an objective
//! - `GET /api/tasks` - List tasks, newest first
//! - `GET /api/tasks/{id}` - Full task state, steps and checkpoint included
//! - `GET /api/tasks/{id}/events` - Event history of a task
//! - `POST /api/tasks/{id}/resume` - Resume a task paused for target selection
//! - `POST /api/tasks/{id}/cancel` - Cancel a task
//! - `GET /api/stream` - Live events via SSE (`?task_id=` to follow one task)

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
