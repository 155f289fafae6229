//! End-to-end compile and run sessions with channel-backed frames.
#![cfg(unix)]

use sandpit_core::config::SandpitConfig;
use sandpit_core::mux::{FrameWriter, InboundFrame, OutputChannels, StdinReader};
use sandpit_core::{ArtifactRegistry, NoopSandbox, Playground};
use sandpit_types::{close_code, CloseStatus, OutputFrame, StdinFrame};
use serial_test::serial;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// Stands in for a real compiler: the "source" is a shell script that is
// written to the -o target as the artifact. Sources mentioning
// "syntax error" fail to compile.
const FAKE_COMPILER: &str = r#"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
cat > "$out"
if grep -q "syntax error" "$out"; then
  echo "main.c:1:1: error: syntax error" >&2
  exit 1
fi
chmod +x "$out"
"#;

struct Harness {
    _dir: TempDir,
    playground: Playground,
}

fn harness(configure: impl FnOnce(&mut SandpitConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("fake-cc.sh");
    std::fs::write(&script, FAKE_COMPILER).unwrap();

    let mut config = SandpitConfig::default();
    config.compiler.program = "sh".to_string();
    config.compiler.args = vec![script.display().to_string()];
    config.sandbox.syscall_filter = false;
    configure(&mut config);

    let registry = Arc::new(ArtifactRegistry::open(dir.path().join("scratch")).unwrap());
    let playground = Playground::new(&config, registry, Arc::new(NoopSandbox));
    Harness {
        _dir: dir,
        playground,
    }
}

fn stdin_frames(frames: &[StdinFrame]) -> StdinReader {
    let (tx, rx) = mpsc::channel(16);
    for frame in frames {
        tx.try_send(InboundFrame::Text(serde_json::to_string(frame).unwrap()))
            .unwrap();
    }
    StdinReader::from_channel(rx)
}

async fn run(
    playground: &Playground,
    token: Option<&str>,
    stdin: StdinReader,
) -> (CloseStatus, Vec<OutputFrame>) {
    let OutputChannels {
        stdout,
        stderr,
        mut frames,
    } = FrameWriter::channels(64);
    let status = playground
        .run(token, Vec::new(), stdin, stdout, stderr, CancellationToken::new())
        .await;

    let mut output = Vec::new();
    while let Some(frame) = frames.recv().await {
        output.push(frame);
    }
    (status, output)
}

fn artifact_count(scratch: &Path) -> usize {
    std::fs::read_dir(scratch).unwrap().count()
}

#[tokio::test]
#[serial]
async fn test_hello_program_prints_one_frame_and_exits_normally() {
    let h = harness(|_| {});

    let response = h
        .playground
        .compile("#!/bin/sh\nprintf hi\n")
        .await
        .unwrap();
    assert_eq!(response.return_code, 0);
    assert_eq!(response.error, None);

    let token = response.token.to_string();
    let (status, output) = run(&h.playground, Some(token.as_str()), stdin_frames(&[StdinFrame::eof("")])).await;

    assert_eq!(output, vec![OutputFrame::stdout("hi")]);
    assert_eq!(status.code, close_code::NORMAL);
    assert_eq!(status.reason, "program exited with code 0");

    // The artifact is gone and the token cannot be used again.
    assert_eq!(artifact_count(h.playground.registry().scratch_dir()), 0);
    let (status, _) = run(&h.playground, Some(token.as_str()), stdin_frames(&[])).await;
    assert_eq!(status, CloseStatus::invalid_payload("invalid token"));
}

#[tokio::test]
#[serial]
async fn test_infinite_loop_is_killed_after_deadline() {
    let h = harness(|config| config.execution.run_timeout_secs = 2);

    let response = h
        .playground
        .compile("#!/bin/sh\nwhile :; do :; done\n")
        .await
        .unwrap();
    let token = response.token.to_string();

    let started = Instant::now();
    let (status, output) = run(&h.playground, Some(token.as_str()), stdin_frames(&[])).await;
    let elapsed = started.elapsed();

    assert!(output.is_empty());
    assert_eq!(status.code, close_code::INTERNAL_ERROR);
    assert!(status.reason.contains("timeout"), "{}", status.reason);
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(10));
    assert_eq!(h.playground.engine().available_slots(), h.playground.engine().capacity());
}

#[tokio::test]
#[serial]
async fn test_stdin_frames_reach_the_program() {
    let h = harness(|_| {});

    let response = h
        .playground
        .compile("#!/bin/sh\nwhile read line; do printf '[%s]' \"$line\"; printf 'e' >&2; done\n")
        .await
        .unwrap();
    let token = response.token.to_string();

    let stdin = stdin_frames(&[StdinFrame::data("ab"), StdinFrame::eof("cd\n")]);
    let (status, output) = run(&h.playground, Some(token.as_str()), stdin).await;

    assert!(status.is_normal());
    assert!(output.contains(&OutputFrame::stdout("[abcd]")));
    assert!(output.contains(&OutputFrame::stderr("e")));
}

#[tokio::test]
#[serial]
async fn test_failed_compile_yields_unrunnable_token() {
    let h = harness(|_| {});

    let response = h
        .playground
        .compile("int main() { syntax error }")
        .await
        .unwrap();

    assert_eq!(response.return_code, 1);
    assert!(response.error.is_some());
    assert!(response.stderr.contains("syntax error"));
    assert!(h.playground.registry().is_empty());
    assert_eq!(artifact_count(h.playground.registry().scratch_dir()), 0);

    let token = response.token.to_string();
    let (status, output) = run(&h.playground, Some(token.as_str()), stdin_frames(&[])).await;
    assert_eq!(status.code, close_code::INVALID_PAYLOAD);
    assert!(output.is_empty());
}

#[tokio::test]
async fn test_bad_tokens_are_rejected_before_running() {
    let h = harness(|_| {});

    for token in [None, Some(""), Some("abc"), Some("-1"), Some("99999999999999999999"), Some("12345")] {
        let (status, output) = run(&h.playground, token, stdin_frames(&[])).await;
        assert_eq!(status, CloseStatus::invalid_payload("invalid token"), "{:?}", token);
        assert!(output.is_empty());
    }
}

#[tokio::test]
#[serial]
async fn test_idle_artifact_is_reclaimed() {
    let h = harness(|config| config.artifacts.cache_duration_secs = 1);

    let response = h
        .playground
        .compile("#!/bin/sh\nprintf late\n")
        .await
        .unwrap();
    let scratch = h.playground.registry().scratch_dir().to_path_buf();
    assert_eq!(artifact_count(&scratch), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(h.playground.registry().is_empty());
    assert_eq!(artifact_count(&scratch), 0);
    let token = response.token.to_string();
    let (status, _) = run(&h.playground, Some(token.as_str()), stdin_frames(&[])).await;
    assert_eq!(status.code, close_code::INVALID_PAYLOAD);
}

#[tokio::test]
#[serial]
async fn test_cancelled_run_reports_internal_error() {
    let h = harness(|_| {});

    let response = h
        .playground
        .compile("#!/bin/sh\nread x\n")
        .await
        .unwrap();
    let token = response.token.to_string();

    // Input never ends, like a connection that stays open.
    let (_tx, rx) = mpsc::channel(1);
    let OutputChannels { stdout, stderr, .. } = FrameWriter::channels(8);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let status = h
        .playground
        .run(Some(token.as_str()), Vec::new(), StdinReader::from_channel(rx), stdout, stderr, cancel)
        .await;

    assert_eq!(status.code, close_code::INTERNAL_ERROR);
    assert!(status.reason.contains("cancelled"));
}

#[tokio::test]
async fn test_health_reports_compiler_and_capacity() {
    let h = harness(|config| {
        config.compiler.version_args = vec!["-c".to_string(), "echo sh-cc 2.0".to_string()];
        config.execution.max_concurrent_processes = 7;
    });

    let report = h.playground.health().await;

    assert!(report.healthy);
    assert_eq!(report.compiler.version.as_deref(), Some("sh-cc 2.0"));
    assert_eq!(report.available_slots, 7);
    assert_eq!(report.pending_artifacts, 0);
}
