//! Long-lived background terminals keyed by opaque handles.
//!
//! `spawn` starts a shell child and returns a handle; `input` writes a
//! line to its stdin; `read` drains whatever stdout/stderr arrived since
//! the last read; `kill` terminates it. Adapter results are model-facing
//! text, so errors are plain strings.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use uuid::Uuid;

struct TerminalSession {
    child: Child,
    stdin: Option<ChildStdin>,
    buffer: Arc<Mutex<String>>,
}

#[derive(Default)]
pub struct TerminalRegistry {
    sessions: tokio::sync::Mutex<HashMap<String, TerminalSession>>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn spawn(&self, command: &str, cwd: &Path) -> Result<String, String> {
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
        let mut child = cmd
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn `{command}`: {e}"))?;

        let buffer = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_into(stdout, Arc::clone(&buffer)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_into(stderr, Arc::clone(&buffer)));
        }
        let stdin = child.stdin.take();

        let id = Uuid::new_v4().to_string();
        self.sessions.lock().await.insert(
            id.clone(),
            TerminalSession {
                child,
                stdin,
                buffer,
            },
        );
        Ok(id)
    }

    pub async fn input(&self, id: &str, line: &str) -> Result<(), String> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| format!("unknown terminal handle {id}"))?;
        let stdin = session
            .stdin
            .as_mut()
            .ok_or_else(|| format!("terminal {id} has no stdin"))?;
        stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| format!("failed to write to terminal {id}: {e}"))?;
        stdin
            .flush()
            .await
            .map_err(|e| format!("failed to flush terminal {id}: {e}"))
    }

    /// Drain queued output. Empty result means nothing arrived since the
    /// last read.
    pub async fn read(&self, id: &str) -> Result<String, String> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| format!("unknown terminal handle {id}"))?;
        let mut buffer = session
            .buffer
            .lock()
            .map_err(|_| format!("terminal {id} buffer poisoned"))?;
        Ok(std::mem::take(&mut *buffer))
    }

    pub async fn kill(&self, id: &str) -> Result<(), String> {
        let mut sessions = self.sessions.lock().await;
        let mut session = sessions
            .remove(id)
            .ok_or_else(|| format!("unknown terminal handle {id}"))?;
        session
            .child
            .start_kill()
            .map_err(|e| format!("failed to kill terminal {id}: {e}"))
    }

    /// Kill everything still running (process shutdown).
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, mut session) in sessions.drain() {
            let _ = session.child.start_kill();
        }
    }

    pub async fn active_handles(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }
}

async fn drain_into<R: tokio::io::AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<String>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                if let Ok(mut guard) = buffer.lock() {
                    guard.push_str(&text);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn spawn_read_kill_round_trip() {
        let registry = TerminalRegistry::new();
        let cwd = std::env::temp_dir();
        let id = registry
            .spawn("echo ready && sleep 5", &cwd)
            .await
            .expect("spawn");

        // Give the pump a moment to collect the echo.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let output = registry.read(&id).await.expect("read");
        assert!(output.contains("ready"));

        // Drained: a second read is empty.
        let again = registry.read(&id).await.expect("read");
        assert!(again.is_empty());

        registry.kill(&id).await.expect("kill");
        assert!(registry.read(&id).await.is_err());
    }

    #[tokio::test]
    async fn unknown_handles_are_errors() {
        let registry = TerminalRegistry::new();
        assert!(registry.read("nope").await.is_err());
        assert!(registry.input("nope", "hi").await.is_err());
        assert!(registry.kill("nope").await.is_err());
    }

    #[tokio::test]
    async fn input_reaches_the_child() {
        let registry = TerminalRegistry::new();
        let cwd = std::env::temp_dir();
        let id = registry.spawn("cat", &cwd).await.expect("spawn");
        registry.input(&id, "echo-me").await.expect("input");
        tokio::time::sleep(Duration::from_millis(300)).await;
        let output = registry.read(&id).await.expect("read");
        assert!(output.contains("echo-me"));
        registry.kill(&id).await.expect("kill");
    }
}
