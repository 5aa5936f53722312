//! Preview pipeline: job queue, toolchain detection, sandbox executor, and
//! the background worker that ties them together.

pub mod detect;
pub mod executor;
pub mod queue;
pub mod worker;

pub use executor::{Progress, Sandbox, SandboxExecutor, SandboxOutcome};
pub use queue::{JobQueue, JobStatus, SandboxJob};
pub use worker::SandboxWorker;
