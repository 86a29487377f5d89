//! Retry-with-timeout and non-streaming fallback around provider calls,
//! plus the render throttler that paces streaming UI updates.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::AgentErr;
use crate::error::Result;

/// Diagnostics for one recovered call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHealth {
    pub attempts: u32,
    pub timeout_ms: u64,
    pub fallback_used: bool,
    pub throttled_renders: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryOptions {
    pub stream_retry_count: u32,
    pub stream_timeout_ms: u64,
}

/// Exponential backoff schedule with jitter: 200ms, 400ms, 800ms, ...
fn backoff(attempt: u32) -> Duration {
    let base_delay_ms = 200u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(6));
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((base_delay_ms as f64 * jitter) as u64)
}

/// Run `run(true)` under the configured timeout up to `retry_count + 1`
/// times, then fall back to one `run(false)` attempt, also under the
/// timeout. A timeout rejects only the pending attempt; concurrent work in
/// the turn is unaffected.
pub async fn call_with_recovery<T, F, Fut>(
    options: RecoveryOptions,
    mut run: F,
) -> (Result<T>, StreamHealth)
where
    F: FnMut(bool) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let timeout = Duration::from_millis(options.stream_timeout_ms.max(1));
    let mut health = StreamHealth {
        timeout_ms: options.stream_timeout_ms,
        ..StreamHealth::default()
    };

    for attempt in 0..=options.stream_retry_count {
        health.attempts += 1;
        match tokio::time::timeout(timeout, run(true)).await {
            Ok(Ok(value)) => return (Ok(value), health),
            Ok(Err(err)) => {
                debug!("streamed attempt {attempt} failed: {err}");
                health.last_error = Some(err.to_string());
            }
            Err(_) => {
                debug!("streamed attempt {attempt} timed out");
                health.last_error =
                    Some(format!("stream timed out after {}ms", options.stream_timeout_ms));
            }
        }
        if attempt < options.stream_retry_count {
            tokio::time::sleep(backoff(attempt + 1)).await;
        }
    }

    health.fallback_used = true;
    health.attempts += 1;
    match tokio::time::timeout(timeout, run(false)).await {
        Ok(Ok(value)) => (Ok(value), health),
        Ok(Err(err)) => {
            health.last_error = Some(err.to_string());
            (Err(err), health)
        }
        Err(_) => {
            let message = format!(
                "non-streaming fallback timed out after {}ms",
                options.stream_timeout_ms
            );
            health.last_error = Some(message.clone());
            (Err(AgentErr::Stream(message, None)), health)
        }
    }
}

struct ThrottleState {
    last_render: Option<Instant>,
    pending: bool,
}

/// Paces render callbacks to at most `fps` per second. A request inside the
/// frame window sets a single pending timer instead of rendering
/// immediately; suppressed immediate requests are counted.
pub struct RenderThrottle {
    interval: Duration,
    state: Arc<Mutex<ThrottleState>>,
    render: Arc<dyn Fn() + Send + Sync>,
    throttled: Arc<AtomicU64>,
    pending_task: Mutex<Option<JoinHandle<()>>>,
}

impl RenderThrottle {
    pub fn new(fps: u32, render: impl Fn() + Send + Sync + 'static) -> Self {
        let fps = fps.max(1);
        Self {
            interval: Duration::from_millis(1000 / fps as u64),
            state: Arc::new(Mutex::new(ThrottleState {
                last_render: None,
                pending: false,
            })),
            render: Arc::new(render),
            throttled: Arc::new(AtomicU64::new(0)),
            pending_task: Mutex::new(None),
        }
    }

    pub fn request(&self) {
        let now = Instant::now();
        let delay = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let elapsed = state.last_render.map(|at| now.duration_since(at));
            match elapsed {
                None => {
                    state.last_render = Some(now);
                    drop(state);
                    (self.render)();
                    return;
                }
                Some(elapsed) if elapsed >= self.interval => {
                    state.last_render = Some(now);
                    drop(state);
                    (self.render)();
                    return;
                }
                Some(elapsed) => {
                    self.throttled.fetch_add(1, Ordering::Relaxed);
                    if state.pending {
                        return;
                    }
                    state.pending = true;
                    self.interval - elapsed
                }
            }
        };

        let state = Arc::clone(&self.state);
        let render = Arc::clone(&self.render);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut state) = state.lock() {
                if !state.pending {
                    return;
                }
                state.pending = false;
                state.last_render = Some(Instant::now());
            }
            render();
        });
        if let Ok(mut slot) = self.pending_task.lock() {
            *slot = Some(handle);
        }
    }

    /// Cancel any pending timer and render immediately.
    pub fn force_flush(&self) {
        if let Ok(mut slot) = self.pending_task.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
        if let Ok(mut state) = self.state.lock() {
            state.pending = false;
            state.last_render = Some(Instant::now());
        }
        (self.render)();
    }

    pub fn throttled_renders(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn falls_back_to_non_streaming_after_retries() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_in = Arc::clone(&calls);

        let (result, health) = call_with_recovery(
            RecoveryOptions {
                stream_retry_count: 1,
                stream_timeout_ms: 5_000,
            },
            move |streaming| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.lock().expect("lock").push(streaming);
                    if streaming {
                        Err(AgentErr::Stream("boom".to_string(), None))
                    } else {
                        Ok("fallback value".to_string())
                    }
                }
            },
        )
        .await;

        assert_eq!(result.expect("fallback succeeds"), "fallback value");
        assert_eq!(health.attempts, 3);
        assert!(health.fallback_used);
        assert_eq!(*calls.lock().expect("lock"), vec![true, true, false]);
    }

    #[tokio::test]
    async fn first_success_skips_retries() {
        let (result, health) = call_with_recovery(
            RecoveryOptions {
                stream_retry_count: 3,
                stream_timeout_ms: 5_000,
            },
            |_| async { Ok(42u32) },
        )
        .await;
        assert_eq!(result.expect("ok"), 42);
        assert_eq!(health.attempts, 1);
        assert!(!health.fallback_used);
    }

    #[tokio::test]
    async fn timeout_rejects_only_the_pending_attempt() {
        let (result, health) = call_with_recovery(
            RecoveryOptions {
                stream_retry_count: 0,
                stream_timeout_ms: 50,
            },
            |streaming| async move {
                if streaming {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok("fallback")
            },
        )
        .await;
        assert_eq!(result.expect("fallback"), "fallback");
        assert!(health.fallback_used);
        assert!(health.last_error.is_some());
    }

    #[tokio::test]
    async fn throttle_counts_suppressed_requests() {
        let renders = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&renders);
        let throttle = RenderThrottle::new(10, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        throttle.request();
        throttle.request();
        throttle.request();
        assert_eq!(renders.load(Ordering::Relaxed), 1);
        assert_eq!(throttle.throttled_renders(), 2);

        throttle.force_flush();
        assert_eq!(renders.load(Ordering::Relaxed), 2);
    }
}
