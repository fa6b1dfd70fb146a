//! Circuit breakers around the object-store collaborator.
//!
//! The reliable sync tracker reads desired state on every sweep and the router
//! forwards node uploads on every inbound data frame. When the collaborator is
//! struggling, both paths would otherwise keep hammering it. Each path gets
//! its own breaker (built on `recloser`) so a dead upstream sink does not stop
//! resync reads and vice versa.
//!
//! # States
//!
//! - **Closed**: calls pass through
//! - **Open**: calls fail fast with [`CircuitError::Rejected`]
//! - **HalfOpen**: a limited number of probe calls decide whether to close
//!
//! # Usage
//!
//! ```rust,no_run
//! # use cloudhub::circuit_breaker::{ObjectStoreCircuit, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = ObjectStoreCircuit::new();
//!
//! match circuit.reads.call(|| async { Ok::<u64, String>(7) }).await {
//!     Ok(version) => { /* use it */ }
//!     Err(CircuitError::Rejected) => { /* open, skip this node until next sweep */ }
//!     Err(CircuitError::Inner(e)) => { /* lookup failed */ }
//! }
//! # Ok(())
//! # }
//! ```

use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Rejected => None,
        }
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

impl From<CircuitError<crate::error::HubError>> for crate::error::HubError {
    fn from(err: CircuitError<crate::error::HubError>) -> Self {
        match err {
            CircuitError::Rejected => crate::error::HubError::ObjectStore("circuit open".into()),
            CircuitError::Inner(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Successful half-open probes needed to close it again.
    pub success_threshold: u32,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips quickly and waits longer before probing.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Tolerates bursts of failures.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker. The future is only created if the circuit admits the call.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_rejection(&self.name);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Heuristic: more rejections than successes so far.
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.rejections() > 0 && self.rejections() > self.successes()
    }
}

/// Breakers for the two collaborator paths.
pub struct ObjectStoreCircuit {
    /// Desired-state lookups by the sync tracker.
    pub reads: CircuitBreaker,
    /// Upstream forwards by the router.
    pub writes: CircuitBreaker,
}

impl Default for ObjectStoreCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStoreCircuit {
    pub fn new() -> Self {
        Self {
            reads: CircuitBreaker::new("object_store_reads", CircuitConfig::default()),
            // Upload bursts from many nodes at once are normal
            writes: CircuitBreaker::new("object_store_writes", CircuitConfig::lenient()),
        }
    }

    pub fn with_configs(reads: CircuitConfig, writes: CircuitConfig) -> Self {
        Self {
            reads: CircuitBreaker::new("object_store_reads", reads),
            writes: CircuitBreaker::new("object_store_writes", writes),
        }
    }

    pub fn metrics(&self) -> ObjectStoreCircuitMetrics {
        ObjectStoreCircuitMetrics {
            reads_total: self.reads.calls_total(),
            reads_failures: self.reads.failures(),
            reads_rejections: self.reads.rejections(),
            writes_total: self.writes.calls_total(),
            writes_failures: self.writes.failures(),
            writes_rejections: self.writes.rejections(),
        }
    }

    pub fn any_open(&self) -> bool {
        self.reads.is_likely_open() || self.writes.is_likely_open()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStoreCircuitMetrics {
    pub reads_total: u64,
    pub reads_failures: u64,
    pub reads_rejections: u64,
    pub writes_total: u64,
    pub writes_failures: u64,
    pub writes_rejections: u64,
}
