//! Error classification bookkeeping and exponential-backoff retry.
//!
//! # Attempt state machine
//!
//! ```text
//! ATTEMPTING --[ok]--------------------------------------------> SUCCESS
//!     |
//!     +--[retryable, attempts left]--> (sleep delay) --> ATTEMPTING   (delay *= backoff_factor)
//!     |
//!     +--[not retryable]-------------------------------------------> FAILED
//!     |
//!     +--[retryable, attempts exhausted]---------------------------> FAILED
//! ```
//!
//! Every failed attempt is recorded in the [`ErrorTracker`], retried or not.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Default size of the recent-errors ring buffer.
pub const DEFAULT_RECENT_ERRORS: usize = 100;

/// Where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub row: Option<usize>,
    pub target: Option<String>,
    pub operation: String,
    /// 1-indexed attempt number that produced the error.
    pub attempt: u32,
    pub max_retries: u32,
    pub retryable: bool,
    /// True when a retryable error ran out of attempts.
    pub exhausted: bool,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_row(mut self, row: usize, target: impl Into<String>) -> Self {
        self.row = Some(row);
        self.target = Some(target.into());
        self
    }
}

/// One recorded failure, kept for post-run diagnostics only.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate view over everything the tracker has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    pub total_errors: u64,
    pub error_types: BTreeMap<String, u64>,
    pub recent_errors_count: usize,
    pub most_common_error: Option<String>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    counts: HashMap<String, u64>,
    recent: VecDeque<ErrorRecord>,
}

/// Thread-safe per-classification error counters plus a bounded ring buffer
/// of recent failures (oldest evicted first).
#[derive(Clone)]
pub struct ErrorTracker {
    capacity: usize,
    inner: Arc<Mutex<TrackerInner>>,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RECENT_ERRORS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Arc::new(Mutex::new(TrackerInner::default())),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned error tracker mutex");
            poisoned.into_inner()
        })
    }

    /// Record a failure: bump its classification counter, append it to the
    /// ring buffer and log it at a level matching its category.
    pub fn log_error(&self, error: &AppError, context: ErrorContext) {
        let kind = error.kind();
        let message = error.to_string();

        if error.is_network() {
            tracing::warn!(
                category = "network",
                %kind,
                row = ?context.row,
                target = context.target.as_deref().unwrap_or("n/a"),
                operation = %context.operation,
                attempt = context.attempt,
                "{message}"
            );
        } else if error.is_dom() {
            tracing::info!(
                category = "dom",
                %kind,
                row = ?context.row,
                target = context.target.as_deref().unwrap_or("n/a"),
                operation = %context.operation,
                attempt = context.attempt,
                "{message}"
            );
        } else {
            tracing::error!(
                category = "general",
                %kind,
                row = ?context.row,
                target = context.target.as_deref().unwrap_or("n/a"),
                operation = %context.operation,
                attempt = context.attempt,
                "{message}"
            );
        }

        let mut inner = self.lock_inner();
        *inner.counts.entry(kind.to_string()).or_insert(0) += 1;
        inner.recent.push_back(ErrorRecord {
            kind: kind.to_string(),
            message,
            context,
            timestamp: Utc::now(),
        });
        while inner.recent.len() > self.capacity {
            inner.recent.pop_front();
        }
    }

    pub fn summary(&self) -> ErrorSummary {
        let inner = self.lock_inner();
        let error_types: BTreeMap<String, u64> = inner
            .counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        // Ties resolve to the alphabetically first label.
        let most_common_error = error_types
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(k, _)| k.clone());

        ErrorSummary {
            total_errors: error_types.values().sum(),
            error_types,
            recent_errors_count: inner.recent.len(),
            most_common_error,
        }
    }

    /// Release spare buffer capacity. Counters and recent records are kept.
    pub fn compact(&self) {
        let mut inner = self.lock_inner();
        inner.recent.shrink_to_fit();
        inner.counts.shrink_to_fit();
    }

    /// Snapshot of the recent-errors buffer, oldest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.lock_inner().recent.iter().cloned().collect()
    }
}

/// Exponential-backoff retry around a single task invocation.
///
/// Delay schedule with the defaults: 2s, 4s, 8s (capped at `max_delay`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay slept before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let mut delay = std::cmp::min(self.initial_delay, self.max_delay);
        for _ in 1..retry {
            delay = self.next_delay(delay);
        }
        delay
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        let next_secs = current.as_secs_f64() * factor;
        if next_secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(next_secs)
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or exhausts `max_retries` retries.
    ///
    /// The in-flight attempt is never interrupted; cancellation is only
    /// observed while sleeping between attempts and yields
    /// [`AppError::Cancelled`].
    pub async fn execute<T, F, Fut>(
        &self,
        tracker: &ErrorTracker,
        context: ErrorContext,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut delay = std::cmp::min(self.initial_delay, self.max_delay);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let retryable = error.is_retryable();
            let attempts_left = attempt <= self.max_retries;
            let will_retry = retryable && attempts_left;

            tracker.log_error(
                &error,
                ErrorContext {
                    attempt,
                    max_retries: self.max_retries,
                    retryable,
                    exhausted: retryable && !attempts_left,
                    ..context.clone()
                },
            );

            if !will_retry {
                return Err(error);
            }

            tracing::warn!(
                operation = %context.operation,
                target = context.target.as_deref().unwrap_or("n/a"),
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient failure"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            }
            delay = self.next_delay(delay);
        }
    }
}
