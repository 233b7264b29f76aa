//! Test utilities: mock sessions, extractors and reporters.
//!
//! Handwritten mocks for dependency injection in unit tests. Shared state
//! lives behind `Arc<Mutex<_>>` or atomics so clones handed to workers
//! record into the same place the test asserts on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use url::Url;

use crate::error::AppError;
use crate::models::ContactInfo;
use crate::orchestrator::{RunEvent, RunReporter};
use crate::traits::{Extractor, Session, SessionFactory};

// ---------------------------------------------------------------------------
// MockSession / MockSessionFactory
// ---------------------------------------------------------------------------

pub struct MockSession {
    closed: Arc<AtomicUsize>,
}

impl Session for MockSession {
    async fn close(self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Session factory counting opened and closed sessions.
#[derive(Clone, Default)]
pub struct MockSessionFactory {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    fail_open: bool,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose every `open` call fails.
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    async fn open(&self) -> Result<MockSession, AppError> {
        if self.fail_open {
            return Err(AppError::SessionError("driver binary not found".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            closed: Arc::clone(&self.closed),
        })
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    /// url → (number of leading failing attempts, error factory).
    failures: HashMap<String, (u32, fn() -> AppError)>,
    delays: HashMap<String, Duration>,
}

/// Extractor returning `info@<host>` for every URL unless scripted otherwise.
#[derive(Clone, Default)]
pub struct MockExtractor {
    script: Arc<Script>,
    calls: Arc<Mutex<HashMap<String, u32>>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every attempt for `url`.
    pub fn failing(self, url: &str, error: fn() -> AppError) -> Self {
        self.failing_times(url, u32::MAX, error)
    }

    /// Fail the first `times` attempts for `url`, then succeed.
    pub fn failing_times(mut self, url: &str, times: u32, error: fn() -> AppError) -> Self {
        self.script_mut()
            .failures
            .insert(url.to_string(), (times, error));
        self
    }

    pub fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        self.script_mut()
            .delays
            .insert(url.to_string(), delay);
        self
    }

    /// Scripts are configured before any clone is handed out.
    fn script_mut(&mut self) -> &mut Script {
        Arc::get_mut(&mut self.script).expect("configure MockExtractor before cloning it")
    }

    /// Number of `extract` calls made for `url`.
    pub fn calls(&self, url: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    /// The contacts returned for a successful extraction of `url`.
    pub fn expected(url: &str) -> ContactInfo {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let mut info = ContactInfo {
            emails: vec![format!("info@{host}")],
            ..Default::default()
        };
        info.social_links
            .insert("x".into(), vec![format!("https://x.com/{host}")]);
        info
    }
}

impl<S: Session> Extractor<S> for MockExtractor {
    async fn extract(
        &self,
        _session: &S,
        url: &str,
        _timeout: Duration,
    ) -> Result<ContactInfo, AppError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if let Some(delay) = self.script.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }

        if let Some((times, error)) = self.script.failures.get(url)
            && attempt <= *times
        {
            return Err(error());
        }

        Ok(Self::expected(url))
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that records a short label for every event.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl RunReporter for RecordingReporter {
    fn report(&self, event: RunEvent<'_>) {
        let label = match event {
            RunEvent::Started { .. } => "started".to_string(),
            RunEvent::AlreadyCompleted { .. } => "already_completed".to_string(),
            RunEvent::WorkerStarted { worker_id } => format!("worker_started:{worker_id}"),
            RunEvent::WorkerStopped { worker_id, .. } => format!("worker_stopped:{worker_id}"),
            RunEvent::RowSkipped { index } => format!("skipped:{index}"),
            RunEvent::RowCompleted { index, .. } => format!("completed:{index}"),
            RunEvent::RowFailed { index, error, .. } => {
                format!("failed:{index}:{}", error.kind())
            }
            RunEvent::Throttled { .. } => "throttled".to_string(),
            RunEvent::CheckpointSaved { .. } => "saved".to_string(),
            RunEvent::Interrupted { .. } => "interrupted".to_string(),
            RunEvent::Finished { .. } => "finished".to_string(),
        };
        self.events.lock().unwrap().push(label);
    }
}
