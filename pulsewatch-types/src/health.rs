//! Heartbeat records written by workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::lenient;
use crate::WorkerKind;

/// A worker's heartbeat side-channel document.
///
/// Workers rewrite this after every request, response, and error. Unknown keys
/// are ignored on read; missing or unparsable timestamps read as `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthRecord {
    #[serde(default, alias = "parser", skip_serializing_if = "Option::is_none")]
    pub kind: Option<WorkerKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    #[serde(default, alias = "started_at", with = "lenient")]
    pub started_at_utc: Option<DateTime<Utc>>,

    #[serde(default, alias = "last_request_ts", with = "lenient")]
    pub last_request_ts_utc: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_url: Option<String>,

    #[serde(default, alias = "last_response_ts", with = "lenient")]
    pub last_response_ts_utc: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response_status: Option<u16>,

    #[serde(default, alias = "last_error_ts", with = "lenient")]
    pub last_error_ts_utc: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, alias = "updated_at", with = "lenient")]
    pub updated_at_utc: Option<DateTime<Utc>>,
}

impl HealthRecord {
    /// A fresh record for a worker that just started.
    pub fn started(kind: WorkerKind, pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            kind: Some(kind),
            pid: Some(pid),
            started_at_utc: Some(now),
            updated_at_utc: Some(now),
            ..Self::default()
        }
    }

    /// Decode a heartbeat file's contents, tolerating a UTF-8 BOM.
    ///
    /// Returns `None` if the content is not a JSON object.
    pub fn from_json(content: &str) -> Option<Self> {
        let content = content.trim_start_matches('\u{feff}');
        let value: serde_json::Value = serde_json::from_str(content).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}
