//! Console front-end: blocking prompts for the core's interaction seam and
//! a background printer for execution events.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use pilot_core::GrantChoice;
use pilot_core::Result;
use pilot_core::UserInteraction;
use pilot_core::event_bus::EventBus;
use pilot_protocol::EventPhase;
use pilot_protocol::EventStatus;

pub struct ConsoleInteraction {
    /// `--yes`: approvals succeed without prompting.
    pub assume_yes: bool,
}

async fn read_line() -> Result<String> {
    let line = tokio::task::spawn_blocking(|| {
        let mut buf = String::new();
        std::io::stdin().read_line(&mut buf).map(|_| buf)
    })
    .await??;
    Ok(line.trim().to_string())
}

#[async_trait]
impl UserInteraction for ConsoleInteraction {
    async fn ask(&self, question: &str) -> Result<String> {
        println!("\n? {question}");
        print!("> ");
        let _ = std::io::stdout().flush();
        read_line().await
    }

    async fn confirm(&self, prompt: &str) -> Result<bool> {
        if self.assume_yes {
            println!("✓ {prompt} (auto-approved)");
            return Ok(true);
        }
        print!("\n? {prompt} [y/N] ");
        let _ = std::io::stdout().flush();
        let answer = read_line().await?;
        Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    async fn choose_grant(&self, prompt: &str) -> Result<GrantChoice> {
        if self.assume_yes {
            return Ok(GrantChoice::Full);
        }
        print!("\n? {prompt} [(f)ull/(s)elective/(n)one] ");
        let _ = std::io::stdout().flush();
        let answer = read_line().await?;
        Ok(match answer.to_ascii_lowercase().as_str() {
            "f" | "full" => GrantChoice::Full,
            "s" | "selective" => GrantChoice::Selective,
            _ => GrantChoice::Refused,
        })
    }

    fn notify(&self, message: &str) {
        println!("· {message}");
    }
}

/// Print events as they arrive. Streaming progress overwrites one status
/// line; everything else gets its own line.
pub fn spawn_event_printer(bus: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match (event.phase, event.status) {
                (EventPhase::Streaming, EventStatus::Progress) => {
                    let line: String = event.message.chars().rev().take(80).collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect();
                    eprint!("\r… {}", line.replace('\n', " "));
                    let _ = std::io::stderr().flush();
                }
                (EventPhase::Streaming, EventStatus::End) => {
                    eprint!("\r");
                    let _ = std::io::stderr().flush();
                }
                (EventPhase::RunningCommand, EventStatus::Progress) => {
                    print!("{}", event.message);
                    let _ = std::io::stdout().flush();
                }
                (EventPhase::Error, _) => {
                    eprintln!("✗ {}", event.message);
                }
                (EventPhase::Finished, _) => {}
                (_, EventStatus::Start) => {
                    eprintln!("→ {}", event.message);
                }
                _ => {}
            }
        }
    })
}
