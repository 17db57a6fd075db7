use crate::{
    error::{JobError, Result},
    invocation::Invocation,
    job::JobSpec,
    runner::{JobResult, Outcome},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lines of tool output kept in a report.
pub const REPORT_TAIL_LINES: usize = 50;

/// Sidecar JSON describing one finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub job_id: u64,
    pub spec: JobSpec,
    pub invocation: Invocation,
    pub outcome: Outcome,
    pub summary: String,
    pub exit_code: Option<i32>,
    pub artifact: Option<PathBuf>,
    pub started: String,
    pub finished: String,
    pub duration_ms: u64,
    pub output_lines: usize,
    pub output_tail: Vec<String>,
}

impl RunReport {
    pub fn new(
        spec: &JobSpec,
        invocation: &Invocation,
        result: &JobResult,
        started: String,
        finished: String,
    ) -> Self {
        Self {
            job_id: result.job_id,
            spec: spec.clone(),
            invocation: invocation.clone(),
            outcome: result.outcome.clone(),
            summary: result.summary(),
            exit_code: result.exit_code,
            artifact: result.artifact.clone(),
            started,
            finished,
            duration_ms: result.duration_ms,
            output_lines: result.output.len(),
            output_tail: result.tail(REPORT_TAIL_LINES).to_vec(),
        }
    }

    /// `<out_dir>/<file name>.json`, next to the image. Never the image itself.
    pub fn default_path(spec: &JobSpec) -> PathBuf {
        spec.out_dir.join(format!("{}.json", spec.file_name))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| JobError::fs(path, std::io::Error::other(e)))?;
        std::fs::write(path, raw).map_err(|e| JobError::fs(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Mode;

    #[test]
    fn report_keeps_tail_and_sits_next_to_image() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = JobSpec::new(Mode::Schnell, "a cat", tmp.path(), "cat.png");
        let invocation = Invocation::for_spec(&spec);
        let result = JobResult {
            job_id: 9,
            outcome: Outcome::ProcessFailure,
            exit_code: Some(2),
            output: (0..80).map(|i| format!("l{i}")).collect(),
            expected_artifact: spec.output_path(),
            artifact: None,
            duration_ms: 12,
        };

        let report = RunReport::new(&spec, &invocation, &result, "a".into(), "b".into());
        assert_eq!(report.output_lines, 80);
        assert_eq!(report.output_tail.len(), REPORT_TAIL_LINES);
        assert_eq!(report.output_tail[0], "l30");

        let path = RunReport::default_path(&spec);
        assert_eq!(path, tmp.path().join("cat.png.json"));
        report.write(&path).unwrap();
        let back: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.outcome, Outcome::ProcessFailure);
        assert_eq!(back.summary, "generation failed with exit code 2");
    }

    #[test]
    fn report_never_replaces_the_image() {
        let spec = JobSpec::new(Mode::Dev, "a cat", "out", "cat.json");
        let path = RunReport::default_path(&spec);
        assert_ne!(path, spec.output_path());
        assert_eq!(path, PathBuf::from("out").join("cat.json.json"));
    }
}
