pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod jobs;
pub mod orchestrator;
pub mod remote;
pub mod result;
pub mod retry;
pub mod router;
pub mod runner;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, Submission, WorkflowStatus};
