//! # redline
//!
//! Guarded execution engine for authorized network assessments.
//!
//! An objective ("assess the Hikvision camera over rtsp") is turned into an
//! ordered plan of steps. Every command a step runs is validated first, and
//! anything aimed at a specific device waits for a target the resolver is
//! confident about, or for an operator to pick one.
//!
//! ## Task Flow
//! 1. Build planning context (objective hints, discovered hosts, knowledge, memory)
//! 2. Generate steps
//! 3. Per step: resolve the target, obtain a command, validate, run with bounded retry
//! 4. Pause with a checkpoint when the target is uncertain; resume on operator input
//! 5. Stream every transition as an ordered event
//!
//! ## Modules
//! - `engine`: task registry, driver, event stream and persistence
//! - `validator`: safety blacklist, intent/tool mismatch and tool diversity checks
//! - `target`: hint extraction and candidate scoring
//! - `planner`: step and command generation backed by `llm`
//! - `exec`: shell execution with timeouts and output capture
//! - `context`: planning context assembly
//! - `api`: HTTP control surface

pub mod api;
pub mod audit;
pub mod config;
pub mod context;
pub mod engine;
pub mod exec;
pub mod llm;
pub mod planner;
pub mod target;
pub mod task;
pub mod validator;

pub use config::{Config, EngineConfig};
pub use engine::{Engine, EngineError, EngineEvent, EventKind};
