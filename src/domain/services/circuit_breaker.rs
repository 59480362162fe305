use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::domain::errors::KvError;
use crate::domain::repositories::kv_store::KvStore;

/// Circuit breaker states following the standard pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, all requests fail immediately
    Open,
    /// Circuit is half-open, a single trial call tests the service
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    fn parse(key: &str, raw: &str) -> Result<Self, KvError> {
        match raw {
            "CLOSED" => Ok(CircuitState::Closed),
            "OPEN" => Ok(CircuitState::Open),
            "HALF_OPEN" => Ok(CircuitState::HalfOpen),
            other => Err(KvError::Corrupt {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before letting a trial call through
    pub recovery_timeout: Duration,
    /// Per-call timeout; exceeding it counts as a failure
    pub call_timeout: Duration,
    pub state_ttl: Duration,
    pub failure_ttl: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
            state_ttl: Duration::from_secs(24 * 3600),
            failure_ttl: Duration::from_secs(3600),
        }
    }
}

/// Snapshot of one service's breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStatus {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub recovery_at: Option<DateTime<Utc>>,
}

/// Error type for circuit breaker operations
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not invoked
    CircuitOpen {
        service: String,
        retry_at: Option<DateTime<Utc>>,
    },
    /// Operation failed
    OperationFailed(E),
    /// Operation exceeded the call timeout
    Timeout { service: String, after: Duration },
    /// Breaker state could not be read; the operation was not invoked
    Store(KvError),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen { service, retry_at } => match retry_at {
                Some(at) => write!(f, "Circuit for {} is open until {}", service, at),
                None => write!(f, "Circuit for {} is open", service),
            },
            CircuitBreakerError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
            CircuitBreakerError::Timeout { service, after } => {
                write!(f, "Call to {} timed out after {:?}", service, after)
            }
            CircuitBreakerError::Store(e) => write!(f, "Circuit state unavailable: {}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CircuitBreakerError<E> {}

/// Circuit breaker keyed by service name, with state held in a shared store
///
/// Implements the circuit breaker pattern:
/// - **Closed**: Normal operation, requests pass through
/// - **Open**: Service is failing, requests fail immediately
/// - **Half-Open**: Recovery deadline passed, the next call decides
///
/// Because state lives in a [`KvStore`], every process sharing the store sees
/// the same breaker. A store that cannot be read blocks the call.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use consensus_trader::domain::repositories::kv_store::InMemoryKvStore;
/// use consensus_trader::domain::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
///
/// # async fn demo() {
/// let breaker = CircuitBreaker::new(Arc::new(InMemoryKvStore::new()), CircuitBreakerConfig::default());
///
/// match breaker.call("exchange:paper", || async { Ok::<_, String>("filled") }).await {
///     Ok(result) => println!("Success: {:?}", result),
///     Err(e) => println!("Circuit breaker rejected or operation failed: {}", e),
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn KvStore>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn KvStore>, config: CircuitBreakerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn state_key(service: &str) -> String {
        format!("circuit_breaker:state:{}", service)
    }

    fn failures_key(service: &str) -> String {
        format!("circuit_breaker:failures:{}", service)
    }

    fn recovery_key(service: &str) -> String {
        format!("circuit_breaker:recovery:{}", service)
    }

    fn last_failure_key(service: &str) -> String {
        format!("circuit_breaker:last_failure:{}", service)
    }

    fn trial_key(service: &str) -> String {
        format!("circuit_breaker:half_open_trial:{}", service)
    }

    async fn read_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, KvError> {
        match self.store.get(key).await? {
            None => Ok(None),
            Some(raw) => {
                let millis: i64 = raw.parse().map_err(|_| KvError::Corrupt {
                    key: key.to_string(),
                    value: raw.clone(),
                })?;
                Ok(Utc.timestamp_millis_opt(millis).single())
            }
        }
    }

    async fn write_state(&self, service: &str, state: CircuitState) -> Result<(), KvError> {
        self.store
            .set(
                &Self::state_key(service),
                state.as_str(),
                Some(self.config.state_ttl),
            )
            .await
    }

    /// Current state of `service`'s circuit
    pub async fn state(&self, service: &str) -> Result<CircuitState, KvError> {
        let key = Self::state_key(service);
        match self.store.get(&key).await? {
            Some(raw) => CircuitState::parse(&key, &raw),
            None => Ok(CircuitState::Closed),
        }
    }

    pub async fn status(&self, service: &str) -> Result<CircuitStatus, KvError> {
        let failures_key = Self::failures_key(service);
        let failure_count = match self.store.get(&failures_key).await? {
            Some(raw) => raw.parse().map_err(|_| KvError::Corrupt {
                key: failures_key.clone(),
                value: raw.clone(),
            })?,
            None => 0,
        };
        Ok(CircuitStatus {
            service: service.to_string(),
            state: self.state(service).await?,
            failure_count,
            last_failure_at: self.read_timestamp(&Self::last_failure_key(service)).await?,
            recovery_at: self.read_timestamp(&Self::recovery_key(service)).await?,
        })
    }

    /// Decide whether a call may go through, moving OPEN to HALF_OPEN once
    /// the recovery deadline has passed or its key has expired.
    ///
    /// In HALF_OPEN exactly one caller holds the trial slot; everyone else is
    /// turned away as if the circuit were still open.
    async fn admit<E>(&self, service: &str) -> Result<CircuitState, CircuitBreakerError<E>> {
        let state = self.state(service).await.map_err(|e| {
            warn!(service, error = %e, "circuit state unreadable, blocking call");
            CircuitBreakerError::Store(e)
        })?;
        match state {
            CircuitState::Closed => return Ok(state),
            CircuitState::HalfOpen => {}
            CircuitState::Open => {
                let recovery_at = self
                    .read_timestamp(&Self::recovery_key(service))
                    .await
                    .map_err(CircuitBreakerError::Store)?;
                if let Some(at) = recovery_at {
                    if Utc::now() < at {
                        return Err(CircuitBreakerError::CircuitOpen {
                            service: service.to_string(),
                            retry_at: Some(at),
                        });
                    }
                }
                self.write_state(service, CircuitState::HalfOpen)
                    .await
                    .map_err(CircuitBreakerError::Store)?;
                info!(service, "circuit OPEN -> HALF_OPEN");
            }
        }

        // the slot outlives a timed-out call so a slow trial is not doubled
        let won = self
            .store
            .set_nx(&Self::trial_key(service), "1", self.config.call_timeout * 2)
            .await
            .map_err(CircuitBreakerError::Store)?;
        if !won {
            debug!(service, "half-open trial already in flight");
            return Err(CircuitBreakerError::CircuitOpen {
                service: service.to_string(),
                retry_at: None,
            });
        }
        Ok(CircuitState::HalfOpen)
    }

    async fn on_success(&self, service: &str, state: CircuitState) -> Result<(), KvError> {
        if state == CircuitState::HalfOpen {
            self.write_state(service, CircuitState::Closed).await?;
            self.store.delete(&Self::recovery_key(service)).await?;
            self.store.delete(&Self::trial_key(service)).await?;
            info!(service, "circuit HALF_OPEN -> CLOSED");
        }
        // consecutive count: any success clears it
        self.store.delete(&Self::failures_key(service)).await
    }

    async fn on_failure(&self, service: &str, state: CircuitState) -> Result<(), KvError> {
        let now = Utc::now();
        self.store
            .set(
                &Self::last_failure_key(service),
                &now.timestamp_millis().to_string(),
                Some(self.config.state_ttl),
            )
            .await?;

        let failures = self
            .store
            .incr(&Self::failures_key(service), Some(self.config.failure_ttl))
            .await?;

        let should_open = state == CircuitState::HalfOpen
            || failures >= i64::from(self.config.failure_threshold);
        if should_open {
            let recovery_at = now
                + chrono::Duration::from_std(self.config.recovery_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            self.store
                .set(
                    &Self::recovery_key(service),
                    &recovery_at.timestamp_millis().to_string(),
                    Some(self.config.state_ttl),
                )
                .await?;
            self.write_state(service, CircuitState::Open).await?;
            self.store.delete(&Self::trial_key(service)).await?;
            warn!(
                service,
                failures,
                from = %state,
                recovery_at = %recovery_at,
                "circuit opened"
            );
        }
        Ok(())
    }

    /// Execute `f` with circuit breaker protection
    ///
    /// While the circuit is open and the recovery deadline has not passed,
    /// returns `CircuitOpen` without invoking `f`. Timeouts count as failures.
    pub async fn call<F, Fut, T, E>(&self, service: &str, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let state = self.admit(service).await?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.call_timeout, f()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (bookkeeping, result) = match outcome {
            Ok(Ok(value)) => {
                debug!(service, duration_ms, "call succeeded");
                (self.on_success(service, state).await, Ok(value))
            }
            Ok(Err(e)) => {
                debug!(service, duration_ms, "call failed");
                (
                    self.on_failure(service, state).await,
                    Err(CircuitBreakerError::OperationFailed(e)),
                )
            }
            Err(_) => {
                warn!(service, duration_ms, "call timed out");
                (
                    self.on_failure(service, state).await,
                    Err(CircuitBreakerError::Timeout {
                        service: service.to_string(),
                        after: self.config.call_timeout,
                    }),
                )
            }
        };
        if let Err(e) = bookkeeping {
            warn!(service, error = %e, "failed to record circuit outcome");
        }
        result
    }

    /// Operator override
    pub async fn force_state(&self, service: &str, state: CircuitState) -> Result<(), KvError> {
        if state == CircuitState::Open {
            let recovery_at = Utc::now()
                + chrono::Duration::from_std(self.config.recovery_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            self.store
                .set(
                    &Self::recovery_key(service),
                    &recovery_at.timestamp_millis().to_string(),
                    Some(self.config.state_ttl),
                )
                .await?;
        }
        self.write_state(service, state).await?;
        self.store.delete(&Self::trial_key(service)).await?;
        info!(service, state = %state, "circuit state forced");
        Ok(())
    }

    /// Forget everything about `service`; the circuit reads as CLOSED
    pub async fn reset(&self, service: &str) -> Result<(), KvError> {
        for key in [
            Self::state_key(service),
            Self::failures_key(service),
            Self::recovery_key(service),
            Self::last_failure_key(service),
            Self::trial_key(service),
        ] {
            self.store.delete(&key).await?;
        }
        info!(service, "circuit reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::kv_store::InMemoryKvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(InMemoryKvStore::new()),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                call_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    async fn fail(b: &CircuitBreaker, service: &str) {
        let _ = b.call(service, || async { Err::<(), _>("boom") }).await;
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let b = breaker(3, Duration::from_secs(60));
        assert_eq!(b.state("svc").await.unwrap(), CircuitState::Closed);
        assert!(b.call("svc", || async { Ok::<_, String>(1) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_operation() {
        let b = breaker(3, Duration::from_secs(60));
        for _ in 0..3 {
            fail(&b, "svc").await;
        }
        assert_eq!(b.state("svc").await.unwrap(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result = b
            .call("svc", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let b = breaker(3, Duration::from_secs(60));
        fail(&b, "svc").await;
        fail(&b, "svc").await;
        b.call("svc", || async { Ok::<_, String>(()) }).await.unwrap();
        fail(&b, "svc").await;
        fail(&b, "svc").await;
        assert_eq!(b.state("svc").await.unwrap(), CircuitState::Closed);
        assert_eq!(b.status("svc").await.unwrap().failure_count, 2);
    }

    #[tokio::test]
    async fn test_half_open_success_closes_and_resets_count() {
        let b = breaker(2, Duration::from_millis(100));
        fail(&b, "svc").await;
        fail(&b, "svc").await;
        assert_eq!(b.state("svc").await.unwrap(), CircuitState::Open);

        // still inside the recovery window
        assert!(b
            .call("svc", || async { Ok::<_, String>(()) })
            .await
            .unwrap_err()
            .is_circuit_open());

        sleep(Duration::from_millis(150)).await;

        let seen = Arc::new(std::sync::Mutex::new(None));
        let trial_state = seen.clone();
        let store_view = b.clone();
        b.call("svc", || async move {
            *trial_state.lock().unwrap() = Some(store_view.state("svc").await.unwrap());
            Ok::<_, String>(())
        })
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(CircuitState::HalfOpen));
        let status = b.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_with_new_deadline() {
        let b = breaker(2, Duration::from_millis(80));
        fail(&b, "svc").await;
        fail(&b, "svc").await;
        let first_deadline = b.status("svc").await.unwrap().recovery_at.unwrap();

        sleep(Duration::from_millis(120)).await;
        fail(&b, "svc").await;

        let status = b.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.recovery_at.unwrap() > first_deadline);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let b = breaker(1, Duration::from_secs(60));
        let result = b
            .call("slow", || async {
                sleep(Duration::from_millis(400)).await;
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
        assert_eq!(b.state("slow").await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_services_are_independent() {
        let b = breaker(1, Duration::from_secs(60));
        fail(&b, "a").await;
        assert_eq!(b.state("a").await.unwrap(), CircuitState::Open);
        assert_eq!(b.state("b").await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_state_and_reset() {
        let b = breaker(5, Duration::from_secs(60));
        b.force_state("svc", CircuitState::Open).await.unwrap();
        assert!(b
            .call("svc", || async { Ok::<_, String>(()) })
            .await
            .unwrap_err()
            .is_circuit_open());

        b.reset("svc").await.unwrap();
        let status = b.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert!(status.recovery_at.is_none());
        assert!(b.call("svc", || async { Ok::<_, String>(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_half_open_admits_a_single_trial() {
        let b = breaker(5, Duration::from_secs(60));
        b.force_state("svc", CircuitState::HalfOpen).await.unwrap();

        let invoked = AtomicUsize::new(0);
        let slow = b.call("svc", || async {
            invoked.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(60)).await;
            Ok::<_, String>(())
        });
        let late = async {
            sleep(Duration::from_millis(10)).await;
            b.call("svc", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
        };
        let (first, second) = tokio::join!(slow, late);

        assert!(first.is_ok());
        assert!(second.unwrap_err().is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(b.state("svc").await.unwrap(), CircuitState::Closed);

        // the slot is released once the trial settles
        assert!(b.call("svc", || async { Ok::<_, String>(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_trial_frees_slot_for_next_recovery() {
        let b = breaker(1, Duration::from_millis(50));
        fail(&b, "svc").await;
        sleep(Duration::from_millis(80)).await;
        fail(&b, "svc").await;
        assert_eq!(b.state("svc").await.unwrap(), CircuitState::Open);

        sleep(Duration::from_millis(80)).await;
        assert!(b.call("svc", || async { Ok::<_, String>(()) }).await.is_ok());
        assert_eq!(b.state("svc").await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_without_recovery_deadline_moves_to_half_open() {
        let store = Arc::new(InMemoryKvStore::new());
        let b = CircuitBreaker::new(store.clone(), CircuitBreakerConfig::default());
        b.force_state("svc", CircuitState::Open).await.unwrap();
        // recovery key lapsed while the longer-lived state key survived
        store.delete("circuit_breaker:recovery:svc").await.unwrap();

        let result = b.call("svc", || async { Ok::<_, String>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(b.state("svc").await.unwrap(), CircuitState::Closed);
    }
}
