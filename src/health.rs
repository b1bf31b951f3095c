//! Worker staleness classification.
//!
//! A worker proves it is alive by rewriting its heartbeat record on every
//! request and response. [`classify`] decides from that record alone whether
//! the worker is stuck; it has no side effects and reads no clock.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pulsewatch_types::HealthRecord;

/// Thresholds for [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Time after start during which a worker is never stale.
    pub grace: Duration,
    /// Maximum age of the last request and the last response.
    pub timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(90),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Why a worker was judged stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaleReason {
    HealthMissing,
    NoRequest,
    RequestTimeout,
    NoResponse,
    ResponseTimeout,
}

impl StaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaleReason::HealthMissing => "health_missing",
            StaleReason::NoRequest => "no_request",
            StaleReason::RequestTimeout => "request_timeout",
            StaleReason::NoResponse => "no_response",
            StaleReason::ResponseTimeout => "response_timeout",
        }
    }
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Inside the startup grace period.
    Grace,
    Fresh,
    Stale(StaleReason),
}

impl Health {
    pub fn is_stale(&self) -> bool {
        matches!(self, Health::Stale(_))
    }

    pub fn reason(&self) -> Option<StaleReason> {
        match self {
            Health::Stale(reason) => Some(*reason),
            _ => None,
        }
    }
}

fn older_than(ts: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    match (now - ts).to_std() {
        Ok(age) => age > limit,
        // Timestamps in the future are fresh.
        Err(_) => false,
    }
}

/// Classify a worker from its heartbeat.
///
/// `started_at` is when the supervisor started the worker, if known. Without
/// it there is no grace period.
pub fn classify(
    record: Option<&HealthRecord>,
    started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &HealthPolicy,
) -> Health {
    if let Some(started) = started_at {
        if !older_than(started, now, policy.grace) {
            return Health::Grace;
        }
    }

    let Some(record) = record else {
        return Health::Stale(StaleReason::HealthMissing);
    };
    let Some(request) = record.last_request_ts_utc else {
        return Health::Stale(StaleReason::NoRequest);
    };
    if older_than(request, now, policy.timeout) {
        return Health::Stale(StaleReason::RequestTimeout);
    }
    let Some(response) = record.last_response_ts_utc else {
        return Health::Stale(StaleReason::NoResponse);
    };
    if older_than(response, now, policy.timeout) {
        return Health::Stale(StaleReason::ResponseTimeout);
    }
    Health::Fresh
}

/// Read a heartbeat file. Missing or unreadable files read as `None`.
pub fn read_heartbeat(path: &Path) -> Option<HealthRecord> {
    let content = std::fs::read_to_string(path).ok()?;
    HealthRecord::from_json(&content)
}
