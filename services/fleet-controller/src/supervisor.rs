//! Restarting long-running tasks.
//!
//! Each background loop (lease election, heartbeat) runs as a child task
//! created by a factory. If the child panics, fails, or returns before
//! shutdown, it is recreated after a backoff delay. A task that keeps
//! failing is marked degraded and restarted at the maximum delay; it is
//! never given up on while the process is running.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use fleet_reconcile::BackoffPolicy;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::shutdown::sleep_or_shutdown;

/// Task restart policy.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restarts allowed within `window` before the task counts as degraded.
    pub max_restarts: u32,

    /// Time window for counting restarts.
    pub window: Duration,

    /// Delay between restarts.
    pub backoff: BackoffPolicy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(300),
            backoff: BackoffPolicy {
                base: Duration::from_millis(100),
                max: Duration::from_secs(30),
                jitter: 0.25,
            },
        }
    }
}

/// Spawns `factory()` as a child task and keeps recreating it until
/// shutdown.
///
/// The child is expected to watch the same shutdown signal and return once
/// it fires; the supervisor then returns too.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    policy: RestartPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts: VecDeque<Instant> = VecDeque::new();

        loop {
            let outcome = tokio::spawn(factory()).await;
            if *shutdown.borrow() {
                info!(task = name, "Supervised task stopped");
                return;
            }

            match outcome {
                Ok(Ok(())) => warn!(task = name, "Supervised task exited before shutdown"),
                Ok(Err(e)) => error!(task = name, error = %e, "Supervised task failed"),
                Err(e) if e.is_panic() => error!(
                    task = name,
                    panic = %panic_message(e.into_panic()),
                    "Supervised task panicked"
                ),
                Err(e) => warn!(task = name, error = %e, "Supervised task cancelled"),
            }

            let now = Instant::now();
            restarts.retain(|t| now.duration_since(*t) < policy.window);

            let delay = if restarts.len() >= policy.max_restarts as usize {
                warn!(
                    task = name,
                    restarts = restarts.len(),
                    "Task exceeded max restarts, marking as degraded"
                );
                policy.backoff.max
            } else {
                policy.backoff.delay(restarts.len() as u32)
            };
            restarts.push_back(now);

            info!(task = name, delay_ms = delay.as_millis() as u64, "Scheduling task restart");
            if sleep_or_shutdown(&mut shutdown, delay).await {
                info!(task = name, "Supervised task stopped");
                return;
            }
        }
    })
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
