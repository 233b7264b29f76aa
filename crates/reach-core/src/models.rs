use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::AppError;
use crate::retry::ErrorSummary;

/// Social platforms reported by the contact extractor, in output column order.
pub const SOCIAL_PLATFORMS: &[&str] = &["facebook", "instagram", "linkedin", "x"];

/// One unit of work: a target site plus the original input record.
///
/// The position of a row in the input sequence is its identity; row ordering
/// is assumed stable across resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Target identifier (a URL). May be empty or malformed in raw input.
    pub target: String,
    /// Original input columns, passed through untouched to the output.
    pub fields: BTreeMap<String, String>,
}

impl Row {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Validate the target and return its trimmed form.
    ///
    /// Only absolute `http`/`https` URLs with a host are dispatchable.
    pub fn validated_target(&self) -> Result<String, AppError> {
        let target = self.target.trim();
        if target.is_empty() {
            return Err(AppError::InvalidTarget("missing target".into()));
        }
        let parsed = Url::parse(target)
            .map_err(|e| AppError::InvalidTarget(format!("{target}: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::InvalidTarget(format!(
                    "{target}: scheme '{scheme}' is not http/https"
                )));
            }
        }
        if parsed.host_str().is_none() {
            return Err(AppError::InvalidTarget(format!("{target}: no host")));
        }
        Ok(target.to_string())
    }
}

/// Contact data extracted from one target site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    #[serde(default)]
    pub emails: Vec<String>,
    /// Platform name → profile URLs.
    #[serde(default)]
    pub social_links: BTreeMap<String, Vec<String>>,
}

impl ContactInfo {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.social_links.values().all(Vec::is_empty)
    }

    pub fn links_for(&self, platform: &str) -> &[String] {
        self.social_links
            .get(platform)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Terminal (or pending) state of a row in the final output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RowStatus {
    Completed,
    Failed { kind: String, message: String },
    /// Not processed, e.g. because the run was interrupted.
    Pending,
}

/// One entry of the aggregated, order-preserving output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowResult {
    pub index: usize,
    pub row: Row,
    /// Extracted contacts; `None` for failed or pending rows.
    pub contacts: Option<ContactInfo>,
    #[serde(flatten)]
    pub status: RowStatus,
}

/// Summary counts for one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job_name: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    /// Rows handed to a worker during this run.
    pub dispatched: usize,
    pub throttle_events: u64,
    pub interrupted: bool,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub most_common_error: Option<String>,
}

/// Everything the orchestrator hands to the result sink.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Indexed by original row position.
    pub rows: Vec<RowResult>,
    pub summary: RunSummary,
    pub errors: ErrorSummary,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
