//! Worker kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EventType;

/// The kind of a supervised scraping worker.
///
/// Each kind has at most one live process and writes its own heartbeat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Accounts,
    Posts,
}

impl WorkerKind {
    /// Every kind, in the order control actions apply them.
    pub const ALL: [WorkerKind; 2] = [WorkerKind::Accounts, WorkerKind::Posts];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Accounts => "accounts",
            WorkerKind::Posts => "posts",
        }
    }

    /// Default heartbeat file name under the runtime directory.
    pub fn heartbeat_file_name(&self) -> String {
        format!("parser_health_{}.json", self.as_str())
    }

    /// The batch type this kind of worker submits.
    pub fn event_type(&self) -> EventType {
        match self {
            WorkerKind::Accounts => EventType::AccountsStatsBatch,
            WorkerKind::Posts => EventType::PostsStatsBatch,
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "accounts" => Ok(WorkerKind::Accounts),
            "posts" => Ok(WorkerKind::Posts),
            other => Err(format!("unknown worker kind: {other}")),
        }
    }
}
