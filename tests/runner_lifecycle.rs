#![cfg(unix)]

use flux_runner::{
    config::{self, ToolCommand, Tools},
    JobError, JobSpec, JobState, Mode, Outcome, Runner, Session,
};
use std::path::Path;
use std::time::{Duration, Instant};

/// Finds the value after `--output` and leaves it in $out.
const FIND_OUTPUT: &str =
    r#"out=""; while [ $# -gt 0 ]; do [ "$1" = "--output" ] && out="$2"; shift; done;"#;

fn runner_with_script(script: &str, grace_ms: u64) -> Runner {
    let mut tools = Tools::default();
    tools.set(
        Mode::Schnell,
        ToolCommand {
            program: "sh".into(),
            prefix_args: vec!["-c".into(), script.into(), "fake-mflux".into()],
        },
    );
    let settings = config::Runner {
        grace_period_ms: grace_ms,
        poll_interval_ms: 10,
        display_lines: 50,
    };
    Runner::with_settings(settings, tools)
}

fn spec_in(dir: &Path) -> JobSpec {
    let mut spec = JobSpec::new(Mode::Schnell, "a cat", dir.join("out"), "cat.png");
    spec.quantize = None;
    spec
}

/// Poll until the stream reports finished, failing after `limit`.
fn drain(runner: &Runner, handle: &flux_runner::JobHandle, limit: Duration) -> Vec<String> {
    let start = Instant::now();
    let mut lines = Vec::new();
    loop {
        let batch = runner.poll_output(handle, Duration::from_millis(20));
        lines.extend(batch.lines);
        if batch.finished {
            return lines;
        }
        assert!(start.elapsed() < limit, "output never finished");
    }
}

#[test]
fn success_writes_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let script = format!(r#"{FIND_OUTPUT} echo "writing $out"; : > "$out""#);
    let runner = runner_with_script(&script, 3_000);
    let session = Session::new();
    let spec = spec_in(tmp.path());

    let handle = runner.launch(&session, &spec).unwrap();
    let result = runner.await_result(&handle);

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.artifact.as_deref(), Some(spec.output_path().as_path()));
    assert!(result.output[0].starts_with("writing "));
    assert_eq!(handle.state(), JobState::Completed { exit_code: 0 });
}

#[test]
fn exit_zero_without_file_is_artifact_missing() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("echo pretending; exit 0", 3_000);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    let result = runner.await_result(&handle);

    assert_eq!(result.outcome, Outcome::ArtifactMissing);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.artifact.is_none());
}

#[test]
fn nonzero_exit_is_process_failure_with_output() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("echo starting; echo boom >&2; exit 3", 3_000);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    let result = runner.await_result(&handle);

    assert_eq!(result.outcome, Outcome::ProcessFailure);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.output, vec!["starting", "boom"]);
    assert_eq!(handle.state(), JobState::Failed { exit_code: Some(3) });
}

#[test]
fn missing_executable_is_launch_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let mut tools = Tools::default();
    tools.set(
        Mode::Schnell,
        ToolCommand {
            program: "/nonexistent/flux-runner-missing-tool".into(),
            prefix_args: Vec::new(),
        },
    );
    let runner = Runner::with_settings(config::Runner::default(), tools);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    assert_eq!(handle.state(), JobState::Failed { exit_code: None });
    assert!(runner.poll_output(&handle, Duration::ZERO).finished);

    let result = runner.await_result(&handle);
    assert!(matches!(result.outcome, Outcome::LaunchFailed { .. }));
    // A failed launch does not block the next one.
    assert!(!handle.is_live());
}

#[test]
fn streams_every_line_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let script = r#"i=1; while [ $i -le 2000 ]; do echo "line $i"; i=$((i+1)); done; printf 'bar 1\rbar 2\r\n'; echo tail >&2; printf 'no newline'"#;
    let runner = runner_with_script(script, 3_000);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    let lines = drain(&runner, &handle, Duration::from_secs(20));

    let mut expected: Vec<String> = (1..=2000).map(|i| format!("line {i}")).collect();
    expected.extend(["bar 1", "bar 2", "tail", "no newline"].map(String::from));
    assert_eq!(lines, expected);

    // Nothing is handed out twice.
    let again = runner.poll_output(&handle, Duration::ZERO);
    assert!(again.lines.is_empty());
    assert!(again.finished);

    let result = runner.await_result(&handle);
    assert_eq!(result.output, expected);
}

#[test]
fn cancel_terminates_and_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("echo started; sleep 30; echo never", 3_000);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    let first = runner.poll_output(&handle, Duration::from_secs(5));
    assert_eq!(first.lines, vec!["started"]);

    let t0 = Instant::now();
    runner.cancel(&handle);
    assert_eq!(handle.state(), JobState::Cancelled);
    runner.cancel(&handle);
    assert_eq!(handle.state(), JobState::Cancelled);

    let result = runner.await_result(&handle);
    assert!(t0.elapsed() < Duration::from_secs(3 + 2));
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert!(!result.output.iter().any(|l| l == "never"));
}

#[test]
fn stubborn_process_is_killed_after_grace_period() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script(
        "trap '' TERM; echo ready; while :; do sleep 1; done",
        300,
    );
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    assert_eq!(
        runner.poll_output(&handle, Duration::from_secs(5)).lines,
        vec!["ready"]
    );

    let t0 = Instant::now();
    runner.cancel(&handle);
    let elapsed = t0.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "killed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "kill took {elapsed:?}");

    let result = runner.await_result(&handle);
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert_eq!(result.exit_code, None);
}

#[test]
fn cancel_reaches_grandchildren() {
    let tmp = tempfile::tempdir().unwrap();
    // The background sleep holds the output pipe; EOF only arrives once it dies.
    let runner = runner_with_script("sleep 30 & echo spawned; wait", 1_000);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    assert_eq!(
        runner.poll_output(&handle, Duration::from_secs(5)).lines,
        vec!["spawned"]
    );

    runner.cancel(&handle);
    let rest = drain(&runner, &handle, Duration::from_secs(5));
    assert!(rest.is_empty());
}

#[test]
fn cancel_kills_grandchildren_that_ignore_term() {
    let tmp = tempfile::tempdir().unwrap();
    // The leader dies on SIGTERM; the background sleep does not.
    let runner = runner_with_script("(trap '' TERM; exec sleep 30) & echo up; wait", 500);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    assert_eq!(
        runner.poll_output(&handle, Duration::from_secs(5)).lines,
        vec!["up"]
    );

    let t0 = Instant::now();
    runner.cancel(&handle);
    // EOF only arrives once every process holding the pipe is gone.
    let rest = drain(&runner, &handle, Duration::from_secs(5));
    assert!(rest.is_empty());
    let result = runner.await_result(&handle);
    assert!(t0.elapsed() < Duration::from_secs(3), "took {:?}", t0.elapsed());
    assert_eq!(result.outcome, Outcome::Cancelled);
}

#[test]
fn helper_left_behind_after_exit_is_killed() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("(trap '' TERM; exec sleep 30) & echo done; exit 0", 300);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    let t0 = Instant::now();
    let result = runner.await_result(&handle);

    assert!(t0.elapsed() < Duration::from_secs(3), "took {:?}", t0.elapsed());
    assert_eq!(result.outcome, Outcome::ArtifactMissing);
    assert_eq!(result.output, vec!["done"]);
    // The pipe closed, so the helper is gone.
    let batch = runner.poll_output(&handle, Duration::from_secs(2));
    assert!(batch.finished);
}

#[test]
fn cancel_from_another_thread_releases_await() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("sleep 30", 1_000);
    let session = Session::new();
    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();

    let t0 = Instant::now();
    let result = std::thread::scope(|s| {
        let waiter = s.spawn(|| runner.await_result(&handle));
        std::thread::sleep(Duration::from_millis(100));

        let second = s.spawn(|| runner.cancel(&handle));
        runner.cancel(&handle);
        second.join().unwrap();

        waiter.join().unwrap()
    });

    assert!(t0.elapsed() < Duration::from_secs(1 + 2), "took {:?}", t0.elapsed());
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert_eq!(handle.state(), JobState::Cancelled);

    // Later cancels change nothing.
    runner.cancel(&handle);
    assert_eq!(runner.await_result(&handle).outcome, Outcome::Cancelled);
}

#[test]
fn cancel_from_another_thread_releases_poll() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("sleep 30", 1_000);
    let session = Session::new();
    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();

    let t0 = Instant::now();
    let batch = std::thread::scope(|s| {
        let poller = s.spawn(|| runner.poll_output(&handle, Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(100));
        runner.cancel(&handle);
        runner.cancel(&handle);
        poller.join().unwrap()
    });

    assert!(t0.elapsed() < Duration::from_secs(1 + 2), "took {:?}", t0.elapsed());
    assert!(batch.finished);
    assert!(batch.lines.is_empty());
    assert_eq!(runner.await_result(&handle).outcome, Outcome::Cancelled);
}

#[test]
fn second_launch_while_live_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("sleep 30", 500);
    let session = Session::new();
    let spec = spec_in(tmp.path());

    let handle = runner.launch(&session, &spec).unwrap();
    assert!(matches!(
        runner.launch(&session, &spec),
        Err(JobError::AlreadyRunning)
    ));

    runner.cancel(&handle);
    let next = runner.launch(&session, &spec).unwrap();
    assert_ne!(next.id(), handle.id());
    runner.cancel(&next);
}

#[test]
fn sessions_are_isolated() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("sleep 30", 500);
    let (a, b) = (Session::new(), Session::new());

    let ha = runner.launch(&a, &spec_in(tmp.path())).unwrap();
    let hb = runner.launch(&b, &spec_in(tmp.path())).unwrap();
    assert!(ha.is_live() && hb.is_live());

    runner.cancel(&ha);
    runner.cancel(&hb);
}

#[test]
fn reap_orphan_stops_live_job() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("sleep 30", 1_000);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    assert!(handle.is_live());

    session.reap_orphan(&runner);
    assert_eq!(handle.state(), JobState::Cancelled);
}

#[test]
fn reap_after_cancel_is_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("echo up; sleep 30", 1_000);
    let session = Session::new();

    let handle = runner.launch(&session, &spec_in(tmp.path())).unwrap();
    runner.poll_output(&handle, Duration::from_secs(5));
    runner.cancel(&handle);
    let before = runner.await_result(&handle);

    session.reap_orphan(&runner);
    runner.reap_orphan(Some(&handle));

    assert_eq!(handle.state(), JobState::Cancelled);
    let after = runner.await_result(&handle);
    assert_eq!(before.outcome, after.outcome);
    assert_eq!(before.output, after.output);
}

#[test]
fn kontext_without_image_fails_before_spawn() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = runner_with_script("exit 0", 500);
    let session = Session::new();
    let spec = JobSpec::new(Mode::Kontext, "make it blue", tmp.path().join("out"), "k.png");

    let err = runner.launch(&session, &spec).unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
    assert!(session.current().is_none());
    assert!(!tmp.path().join("out").exists());
}

#[test]
fn uncreatable_output_dir_is_filesystem_error() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let runner = runner_with_script("exit 0", 500);
    let session = Session::new();
    let spec = JobSpec::new(Mode::Schnell, "a cat", blocker.join("sub"), "x.png");

    let err = runner.launch(&session, &spec).unwrap_err();
    assert!(matches!(err, JobError::Filesystem { .. }));
    assert!(session.current().is_none());
}
