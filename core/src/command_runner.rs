//! Child-process execution with timeout, streamed output and a per-day
//! append-only NDJSON log.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use pilot_protocol::CommandExecutionRecord;
use pilot_protocol::EventPhase;
use pilot_protocol::EventStatus;
use pilot_protocol::ExecutionEvent;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::warn;

use crate::event_bus::EventBus;

/// Cap on captured output per stream; callbacks still see every batch.
const MAX_CAPTURE: usize = 64 * 1024;
/// Kill timers never arm below this.
const MIN_TIMEOUT_MS: u64 = 1000;
/// Snippet length for progress events.
const EVENT_SNIPPET: usize = 200;

pub struct CommandOptions<'a> {
    pub cwd: PathBuf,
    /// 0 means unlimited.
    pub timeout_ms: u64,
    pub log_enabled: bool,
    pub on_stdout: Option<&'a mut (dyn FnMut(&str) + Send)>,
    pub on_stderr: Option<&'a mut (dyn FnMut(&str) + Send)>,
}

impl CommandOptions<'_> {
    pub fn new(cwd: impl Into<PathBuf>, timeout_ms: u64) -> Self {
        CommandOptions {
            cwd: cwd.into(),
            timeout_ms,
            log_enabled: false,
            on_stdout: None,
            on_stderr: None,
        }
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

pub struct CommandRunner {
    bus: Arc<EventBus>,
    logs_dir: PathBuf,
}

impl CommandRunner {
    pub fn new(bus: Arc<EventBus>, home: &Path) -> Self {
        Self {
            bus,
            logs_dir: home.join("logs"),
        }
    }

    /// Run `command` under the platform shell. Never returns an error: a
    /// spawn failure or timeout is captured in the record with
    /// `exit_code = None` and `success = false`.
    pub async fn run(&self, command: &str, options: CommandOptions<'_>) -> CommandExecutionRecord {
        let CommandOptions {
            cwd,
            timeout_ms,
            log_enabled,
            mut on_stdout,
            mut on_stderr,
        } = options;

        let started_at = Utc::now();
        let start = Instant::now();

        self.bus.emit(
            ExecutionEvent::new(EventPhase::RunningCommand, EventStatus::Start, command)
                .with_command(command),
        );

        let mut record = CommandExecutionRecord {
            command: command.to_string(),
            cwd: cwd.to_string_lossy().into_owned(),
            started_at,
            ended_at: started_at,
            duration_ms: 0,
            timeout_ms,
            exit_code: None,
            success: false,
            stdout: String::new(),
            stderr: String::new(),
        };

        let mut child = match shell_command(command, &cwd).spawn() {
            Ok(child) => child,
            Err(err) => {
                record.stderr = format!("spawn failed: {err}");
                record.ended_at = Utc::now();
                record.duration_ms = start.elapsed().as_millis() as u64;
                self.finish(&mut record, log_enabled);
                return record;
            }
        };

        let (tx, mut rx) = mpsc::channel::<(StreamKind, String)>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        let kill_after = if timeout_ms == 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(timeout_ms.max(MIN_TIMEOUT_MS)))
        };
        let timeout_sleep = async {
            match kill_after {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout_sleep);

        let mut timed_out = false;
        let mut exit_status = None;

        loop {
            tokio::select! {
                batch = rx.recv() => match batch {
                    Some((kind, text)) => self.on_batch(
                        &mut record,
                        kind,
                        &text,
                        command,
                        &mut on_stdout,
                        &mut on_stderr,
                    ),
                    None => {
                        // Pumps done; reap the child unless it was killed.
                        if exit_status.is_none() && !timed_out {
                            exit_status = child.wait().await.ok();
                        }
                        break;
                    }
                },
                status = child.wait(), if exit_status.is_none() && !timed_out => {
                    exit_status = status.ok();
                    // Keep draining the channel until the pumps close it.
                }
                _ = &mut timeout_sleep, if !timed_out && exit_status.is_none() => {
                    timed_out = true;
                    let _ = child.start_kill();
                }
            }
            if timed_out {
                break;
            }
        }

        // Collect whatever the pumps flushed before shutdown.
        while let Ok((kind, text)) = rx.try_recv() {
            self.on_batch(&mut record, kind, &text, command, &mut on_stdout, &mut on_stderr);
        }

        record.ended_at = Utc::now();
        record.duration_ms = start.elapsed().as_millis() as u64;

        if timed_out {
            record
                .stderr
                .push_str(&format!("Process timed out after {timeout_ms}ms."));
            record.exit_code = None;
            record.success = false;
        } else if let Some(status) = exit_status {
            record.exit_code = status.code().map(i64::from);
            record.success = status.success();
        }

        self.finish(&mut record, log_enabled);
        record
    }

    fn on_batch(
        &self,
        record: &mut CommandExecutionRecord,
        kind: StreamKind,
        text: &str,
        command: &str,
        on_stdout: &mut Option<&mut (dyn FnMut(&str) + Send)>,
        on_stderr: &mut Option<&mut (dyn FnMut(&str) + Send)>,
    ) {
        match kind {
            StreamKind::Stdout => {
                Self::append_and_callback(&mut record.stdout, text, on_stdout);
            }
            StreamKind::Stderr => {
                Self::append_and_callback(&mut record.stderr, text, on_stderr);
            }
        }

        let snippet: String = text.chars().take(EVENT_SNIPPET).collect();
        self.bus.emit(
            ExecutionEvent::new(EventPhase::RunningCommand, EventStatus::Progress, snippet)
                .with_command(command),
        );
    }

    fn append_and_callback(
        capture: &mut String,
        text: &str,
        callback: &mut Option<&mut (dyn FnMut(&str) + Send)>,
    ) {
        if capture.len() < MAX_CAPTURE {
            let room = MAX_CAPTURE - capture.len();
            let mut cut = text.len().min(room);
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            capture.push_str(&text[..cut]);
        }
        if let Some(cb) = callback {
            cb(text);
        }
    }

    fn finish(&self, record: &mut CommandExecutionRecord, log_enabled: bool) {
        let phase = if record.success {
            EventPhase::Finished
        } else {
            EventPhase::Error
        };
        self.bus.emit(
            ExecutionEvent::new(phase, EventStatus::End, record.command.clone())
                .with_command(record.command.clone())
                .with_outcome(record.exit_code, record.success),
        );
        if log_enabled
            && let Err(err) = self.append_log(record)
        {
            warn!("failed to append command log: {err}");
        }
    }

    fn log_path_for_today(&self) -> PathBuf {
        self.logs_dir
            .join(format!("commands-{}.ndjson", Utc::now().format("%Y-%m-%d")))
    }

    /// One serialized record per line, append-only.
    fn append_log(&self, record: &CommandExecutionRecord) -> std::io::Result<()> {
        use std::io::Write;

        std::fs::create_dir_all(&self.logs_dir)?;
        let mut line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::other(format!("serialize command record: {e}")))?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.log_path_for_today())?;
        file.write_all(line.as_bytes())
    }

    /// Last `n` records from today's log, in arrival order.
    pub fn read_recent(&self, n: usize) -> Vec<CommandExecutionRecord> {
        let Ok(text) = std::fs::read_to_string(self.log_path_for_today()) else {
            return Vec::new();
        };
        let records: Vec<CommandExecutionRecord> = text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = records.len().saturating_sub(n);
        records.into_iter().skip(skip).collect()
    }
}

fn shell_command(command: &str, cwd: &Path) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    cmd.current_dir(cwd)
        // No stdin: some tools try to read from it and hang forever.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

async fn pump<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    kind: StreamKind,
    tx: mpsc::Sender<(StreamKind, String)>,
) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send((kind, text)).await.is_err() {
                    break;
                }
            }
        }
    }
}
