use std::sync::Arc;

use pilot_core::command_runner::CommandOptions;
use pilot_core::command_runner::CommandRunner;
use pilot_core::event_bus::EventBus;
use pilot_protocol::EventPhase;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn runner(home: &TempDir) -> (CommandRunner, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new());
    (CommandRunner::new(Arc::clone(&bus), home.path()), bus)
}

#[tokio::test]
async fn timeout_kills_the_child() {
    let home = TempDir::new().expect("tempdir");
    let (runner, _bus) = runner(&home);

    let record = runner
        .run("sleep 2", CommandOptions::new(home.path(), 500))
        .await;

    assert!(!record.success);
    assert_eq!(record.exit_code, None);
    assert!(record.stderr.contains("timed out after 500ms"));
    assert!(record.duration_ms >= 500);
    assert_eq!(record.timeout_ms, 500);
}

#[tokio::test]
async fn zero_timeout_means_unlimited() {
    let home = TempDir::new().expect("tempdir");
    let (runner, _bus) = runner(&home);

    let record = runner
        .run("sleep 1.2 && exit 0", CommandOptions::new(home.path(), 0))
        .await;

    assert!(record.success);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.timeout_ms, 0);
    assert!(record.duration_ms >= 1_000);
}

#[tokio::test]
async fn output_is_captured_and_forwarded() {
    let home = TempDir::new().expect("tempdir");
    let (runner, _bus) = runner(&home);

    let mut streamed = String::new();
    let mut on_stdout = |chunk: &str| streamed.push_str(chunk);
    let record = runner
        .run(
            "echo out-line && echo err-line >&2",
            CommandOptions {
                cwd: home.path().to_path_buf(),
                timeout_ms: 10_000,
                log_enabled: false,
                on_stdout: Some(&mut on_stdout),
                on_stderr: None,
            },
        )
        .await;

    assert!(record.success);
    assert!(record.stdout.contains("out-line"));
    assert!(record.stderr.contains("err-line"));
    assert!(streamed.contains("out-line"));
}

#[tokio::test]
async fn spawn_failure_is_captured_not_thrown() {
    let home = TempDir::new().expect("tempdir");
    let (runner, bus) = runner(&home);

    // `sh -c` itself spawns, so break the cwd instead.
    let record = runner
        .run(
            "true",
            CommandOptions::new(home.path().join("missing-subdir"), 1_000),
        )
        .await;

    assert!(!record.success);
    assert_eq!(record.exit_code, None);
    assert!(record.stderr.contains("spawn failed"));
    let history = bus.history();
    assert!(history.iter().any(|e| e.phase == EventPhase::Error));
}

#[tokio::test]
async fn log_lines_append_in_order_and_never_rewrite() {
    let home = TempDir::new().expect("tempdir");
    let (runner, _bus) = runner(&home);

    let mut options = CommandOptions::new(home.path(), 10_000);
    options.log_enabled = true;
    runner.run("echo first", options).await;

    let log_dir = home.path().join("logs");
    let log_path = std::fs::read_dir(&log_dir)
        .expect("logs dir")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("commands-") && n.ends_with(".ndjson"))
        })
        .expect("log file");
    let first_line_before = std::fs::read_to_string(&log_path)
        .expect("read")
        .lines()
        .next()
        .map(str::to_string)
        .expect("first line");

    let mut options = CommandOptions::new(home.path(), 10_000);
    options.log_enabled = true;
    runner.run("echo second", options).await;

    let text = std::fs::read_to_string(&log_path).expect("read");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], first_line_before);

    let recent = runner.read_recent(10);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].command, "echo first");
    assert_eq!(recent[1].command, "echo second");

    let recent_one = runner.read_recent(1);
    assert_eq!(recent_one.len(), 1);
    assert_eq!(recent_one[0].command, "echo second");
}

#[tokio::test]
async fn events_cover_start_progress_and_end() {
    let home = TempDir::new().expect("tempdir");
    let (runner, bus) = runner(&home);
    let rx = bus.subscribe();

    runner
        .run("echo hello", CommandOptions::new(home.path(), 10_000))
        .await;

    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        phases.push((event.phase, event.status));
    }
    use pilot_protocol::EventStatus;
    assert!(phases.contains(&(EventPhase::RunningCommand, EventStatus::Start)));
    assert!(phases.contains(&(EventPhase::RunningCommand, EventStatus::Progress)));
    assert!(phases.contains(&(EventPhase::Finished, EventStatus::End)));
}
