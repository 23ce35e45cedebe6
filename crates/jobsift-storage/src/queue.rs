//! The single authority for outbound provider calls: quota admission,
//! bounded concurrency with priorities, pacing, and retry with backoff.
//!
//! Data sources hand the queue a closure that performs exactly one attempt
//! and classifies its own failure. Everything that waits (admission, a free
//! slot, the inter-request delay, backoff) happens here.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::ledger::{CallType, UsageLedger};
use crate::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Exponential delay plus up to 50% random jitter, never below the
    /// provider's `Retry-After` hint.
    pub fn jittered_delay(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        let base = self.delay_for_attempt(attempt_index);
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        let delay = base + jitter;
        match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// What to do when the ledger refuses admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    NonBlocking,
    /// Wait for a period rollover or [`RequestQueue::resume`].
    Park,
}

/// Failure of one attempt, as classified by the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("provider quota exhausted: {0}")]
    QuotaExhausted(String),
}

impl TaskFailure {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) | Self::RateLimited { .. } => RetryDisposition::Retryable,
            Self::Permanent(_) | Self::QuotaExhausted(_) => RetryDisposition::NonRetryable,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("monthly quota exceeded for {call_type} (remaining: {remaining:?})")]
    QuotaExceeded {
        call_type: CallType,
        remaining: Option<u64>,
    },
    #[error("{call_type} failed after {attempts} attempt(s): {last}")]
    Provider {
        call_type: CallType,
        attempts: usize,
        last: TaskFailure,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueueError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub min_request_delay: Duration,
    pub backoff: BackoffPolicy,
    /// How often a parked submit re-checks for a period rollover.
    pub park_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            min_request_delay: Duration::ZERO,
            backoff: BackoffPolicy::default(),
            park_poll_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    priority: Priority,
    seq: u64,
}

impl Ord for Ticket {
    // Higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    waiting: BinaryHeap<Ticket>,
}

#[derive(Debug)]
struct Inner {
    config: QueueConfig,
    ledger: Arc<UsageLedger>,
    gate: Mutex<GateState>,
    gate_changed: Notify,
    resumed: Notify,
    last_dispatch: tokio::sync::Mutex<Option<Instant>>,
    next_seq: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig, ledger: Arc<UsageLedger>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: QueueConfig {
                    max_concurrent: config.max_concurrent.max(1),
                    ..config
                },
                ledger,
                gate: Mutex::new(GateState::default()),
                gate_changed: Notify::new(),
                resumed: Notify::new(),
                last_dispatch: tokio::sync::Mutex::new(None),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Queue over an unmetered ledger, for providers without a quota.
    pub fn unmetered(config: QueueConfig) -> Self {
        Self::new(config, Arc::new(UsageLedger::unmetered()))
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.inner.ledger
    }

    /// Submits waiting for a slot, not yet dispatched.
    pub fn queued(&self) -> usize {
        lock(&self.inner.gate).waiting.len()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner.gate).in_flight
    }

    /// Wakes parked submits so they re-check admission.
    pub fn resume(&self) {
        self.inner.resumed.notify_waiters();
    }

    /// Runs `task` under admission control. `task` is invoked once per
    /// attempt; it is never invoked when the ledger refuses the call.
    pub async fn submit<T, F, Fut>(
        &self,
        call_type: CallType,
        priority: Priority,
        mode: SubmitMode,
        task: F,
    ) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TaskFailure>>,
    {
        let span = info_span!("request_queue", call_type = call_type.as_str(), ?priority);
        self.submit_inner(call_type, priority, mode, task)
            .instrument(span)
            .await
    }

    async fn submit_inner<T, F, Fut>(
        &self,
        call_type: CallType,
        priority: Priority,
        mode: SubmitMode,
        mut task: F,
    ) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TaskFailure>>,
    {
        let reservation = self.admit(call_type, mode).await?;
        let backoff = self.inner.config.backoff;
        let mut attempt = 0usize;

        loop {
            let outcome = {
                let _slot = self.acquire_slot(priority).await;
                self.pace().await;
                debug!(attempt, "dispatching");
                task().await
            };

            match outcome {
                Ok(value) => {
                    reservation.commit().await?;
                    return Ok(value);
                }
                Err(TaskFailure::QuotaExhausted(message)) => {
                    drop(reservation);
                    warn!(%message, "provider refused call, quota exhausted upstream");
                    self.inner.ledger.mark_exhausted().await?;
                    return Err(QueueError::QuotaExceeded {
                        call_type,
                        remaining: Some(0),
                    });
                }
                Err(failure)
                    if failure.disposition() == RetryDisposition::Retryable
                        && attempt < backoff.max_retries =>
                {
                    let delay = backoff.jittered_delay(attempt, failure.retry_after());
                    warn!(attempt, ?delay, error = %failure, "retrying after transient failure");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    warn!(attempts = attempt + 1, error = %failure, "giving up on provider call");
                    return Err(QueueError::Provider {
                        call_type,
                        attempts: attempt + 1,
                        last: failure,
                    });
                }
            }
        }
    }

    async fn admit(&self, call_type: CallType, mode: SubmitMode) -> Result<HeldReservation<'_>, QueueError> {
        let ledger = &self.inner.ledger;
        loop {
            let resumed = self.inner.resumed.notified();
            let reservation = ledger.try_reserve(call_type);
            if reservation.granted {
                return Ok(HeldReservation {
                    ledger,
                    call_type,
                    settled: false,
                });
            }
            match mode {
                SubmitMode::NonBlocking => {
                    warn!(remaining = ?reservation.remaining, "quota exceeded, call refused");
                    return Err(QueueError::QuotaExceeded {
                        call_type,
                        remaining: reservation.remaining,
                    });
                }
                SubmitMode::Park => {
                    warn!("quota exceeded, parking until rollover or resume");
                    tokio::select! {
                        _ = resumed => {}
                        _ = tokio::time::sleep(self.inner.config.park_poll_interval) => {}
                    }
                    ledger.reset_if_new_period();
                }
            }
        }
    }

    async fn acquire_slot(&self, priority: Priority) -> Slot<'_> {
        let ticket = Ticket {
            priority,
            seq: self.inner.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
        };
        lock(&self.inner.gate).waiting.push(ticket);
        let mut waiter = Waiter {
            inner: &self.inner,
            ticket,
            admitted: false,
        };

        loop {
            let changed = self.inner.gate_changed.notified();
            {
                let mut gate = lock(&self.inner.gate);
                if gate.in_flight < self.inner.config.max_concurrent && gate.waiting.peek() == Some(&ticket) {
                    gate.waiting.pop();
                    gate.in_flight += 1;
                    waiter.admitted = true;
                }
            }
            if waiter.admitted {
                // The next head may also fit.
                self.inner.gate_changed.notify_waiters();
                return Slot { inner: &self.inner };
            }
            changed.await;
        }
    }

    async fn pace(&self) {
        let min_delay = self.inner.config.min_request_delay;
        if min_delay.is_zero() {
            return;
        }
        let mut last = self.inner.last_dispatch.lock().await;
        if let Some(previous) = *last {
            let next = previous + min_delay;
            if Instant::now() < next {
                tokio::time::sleep_until(next).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Reservation that is released unless committed, including when the
/// submitting future is dropped mid-flight.
struct HeldReservation<'a> {
    ledger: &'a UsageLedger,
    call_type: CallType,
    settled: bool,
}

impl HeldReservation<'_> {
    async fn commit(mut self) -> Result<(), StorageError> {
        self.settled = true;
        self.ledger.commit(self.call_type).await
    }
}

impl Drop for HeldReservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.release(self.call_type);
        }
    }
}

/// Queued ticket; leaves the heap if the waiter is cancelled.
struct Waiter<'a> {
    inner: &'a Inner,
    ticket: Ticket,
    admitted: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.admitted {
            let ticket = self.ticket;
            lock(&self.inner.gate).waiting.retain(|t| *t != ticket);
            self.inner.gate_changed.notify_waiters();
        }
    }
}

struct Slot<'a> {
    inner: &'a Inner,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        {
            let mut gate = lock(&self.inner.gate);
            gate.in_flight = gate.in_flight.saturating_sub(1);
        }
        self.inner.gate_changed.notify_waiters();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
