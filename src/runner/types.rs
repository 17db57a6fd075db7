use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of one child process.
///
/// `NotStarted -> Running -> {Completed, Failed, Cancelling -> Cancelled}`;
/// the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    Running,
    Completed { exit_code: i32 },
    /// `exit_code` is `None` for spawn failures and signal deaths.
    Failed { exit_code: Option<i32> },
    Cancelling,
    Cancelled,
}

impl JobState {
    /// A process exists (or may exist) and has not been reaped.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Exit code 0 but nothing at the `--output` path.
    ArtifactMissing,
    ProcessFailure,
    LaunchFailed { message: String },
    Cancelled,
}

/// Terminal report for one job. Computed once, then cached on the handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: u64,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    /// Every line the process wrote, in order.
    pub output: Vec<String>,
    pub expected_artifact: PathBuf,
    /// Set only for [`Outcome::Success`].
    pub artifact: Option<PathBuf>,
    pub duration_ms: u64,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    /// Last `n` lines of output, for error messages.
    pub fn tail(&self, n: usize) -> &[String] {
        let start = self.output.len().saturating_sub(n);
        &self.output[start..]
    }

    /// One-line description suitable for showing to a user.
    pub fn summary(&self) -> String {
        match &self.outcome {
            Outcome::Success => match &self.artifact {
                Some(p) => format!("done: {}", p.display()),
                None => "done".to_string(),
            },
            Outcome::ArtifactMissing => format!(
                "generation completed but output file was not found: {}",
                self.expected_artifact.display()
            ),
            Outcome::ProcessFailure => match self.exit_code {
                Some(code) => format!("generation failed with exit code {code}"),
                None => "generation process was killed".to_string(),
            },
            Outcome::LaunchFailed { message } => format!("could not start generator: {message}"),
            Outcome::Cancelled => "generation cancelled".to_string(),
        }
    }
}

/// Lines delivered by one `poll_output` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollBatch {
    pub lines: Vec<String>,
    /// The stream has ended and every line has now been handed out.
    pub finished: bool,
}
