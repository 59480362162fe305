//! Periodic Task Runner
//!
//! Runs a background task on a fixed interval. After a failure the next run
//! is delayed with exponential backoff; a success restores the interval.
//! Failures are logged and never stop the loop.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Backoff configuration for periodic tasks
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure
    pub initial_retry_delay: Duration,
    /// Maximum delay between retries
    pub max_retry_delay: Duration,
    /// Failures in a row after which every failure is logged at error level
    pub escalate_after: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(300),
            escalate_after: 5,
        }
    }
}

#[derive(Debug)]
struct RetryState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl RetryState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    /// Returns the delay to wait before the next attempt
    fn record_failure(&mut self, config: &RetryConfig) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = if self.consecutive_failures == 1 {
            config.initial_retry_delay
        } else {
            std::cmp::min(self.current_retry_delay.saturating_mul(2), config.max_retry_delay)
        };
        self.current_retry_delay = delay;
        delay
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Run `task_fn` every `interval` until `shutdown` flips to true
///
/// # Arguments
/// * `task_name` - Name of the task for logging purposes
/// * `interval` - Delay between two successful runs
/// * `config` - Backoff configuration
/// * `shutdown` - Stops the loop between runs
/// * `task_fn` - Async function that executes one iteration of the task
pub async fn run_periodic<F, Fut, E>(
    task_name: &str,
    interval: Duration,
    config: RetryConfig,
    mut shutdown: watch::Receiver<bool>,
    mut task_fn: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut state = RetryState::new(config.initial_retry_delay);
    info!(task = task_name, interval_ms = interval.as_millis() as u64, "periodic task started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
                interval
            }
            Err(e) => {
                let delay = state.record_failure(&config);
                if state.consecutive_failures >= config.escalate_after {
                    error!(
                        task = task_name,
                        failures = state.consecutive_failures,
                        "Task '{}' keeps failing: {}",
                        task_name,
                        e
                    );
                } else {
                    warn!(
                        task = task_name,
                        failures = state.consecutive_failures,
                        "Task '{}' failed: {}, retrying in {:?}",
                        task_name,
                        e,
                        delay
                    );
                }
                delay
            }
        };

        tokio::select! {
            _ = sleep(delay) => {}
            changed = shutdown.changed() => {
                // a dropped sender also means shut down
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(task = task_name, "periodic task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            initial_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(20),
            escalate_after: 2,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = fast();
        let mut state = RetryState::new(config.initial_retry_delay);
        assert_eq!(state.record_failure(&config), Duration::from_millis(5));
        assert_eq!(state.record_failure(&config), Duration::from_millis(10));
        assert_eq!(state.record_failure(&config), Duration::from_millis(20));
        assert_eq!(state.record_failure(&config), Duration::from_millis(20));
        state.reset(config.initial_retry_delay);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.record_failure(&config), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_recovers_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            run_periodic("test_task", Duration::from_millis(5), fast(), rx, move || {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err("Simulated failure".to_string())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_persistent_failure_never_panics() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            run_periodic("failing_task", Duration::from_millis(1), fast(), rx, || async {
                Err::<(), _>("Always fails")
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        // the loop exits cleanly instead of panicking
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_loop() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            run_periodic("orphaned", Duration::from_secs(60), fast(), rx, || async {
                Ok::<(), String>(())
            })
            .await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
