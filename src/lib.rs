pub mod cli;
pub mod config;
pub mod display;
pub mod error;
pub mod invocation;
pub mod job;
pub mod progress;
pub mod report;
pub mod runner;
pub mod staging;
pub mod util;

pub use error::JobError;
pub use invocation::Invocation;
pub use job::{JobSpec, Mode};
pub use runner::{JobHandle, JobResult, JobState, Outcome, PollBatch, Runner, Session};
