//! # pulsewatch-sdk
//!
//! Worker-side instrumentation for processes supervised by pulsewatch.
//!
//! A worker does two things besides scraping: it keeps a heartbeat file
//! current so the coordinator's watchdog can tell it is alive, and it pushes
//! snapshot batches to the coordinator's intake queue.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use pulsewatch_sdk::{Heartbeat, Reporter, SdkError};
//! use pulsewatch_types::{EventType, WorkerKind};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SdkError> {
//!     let heartbeat = Heartbeat::open("runtime/parser_health_posts.json", WorkerKind::Posts)?;
//!     let reporter = Reporter::from_env()?;
//!
//!     let url = "https://www.threads.com/@someone/post/abc";
//!     heartbeat.record_request(url)?;
//!     // ... fetch and extract ...
//!     heartbeat.record_response(200)?;
//!
//!     let mut batch = BTreeMap::new();
//!     if let serde_json::Value::Object(snapshot) = json!({"views": 120, "likes": 4}) {
//!         batch.insert(url.to_string(), snapshot);
//!     }
//!     match reporter.submit(EventType::PostsStatsBatch, batch).await {
//!         Err(SdkError::Backpressure) => { /* keep it for next cycle */ }
//!         other => { other?; }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Atomic heartbeats**: temp file plus rename on every update
//! - **Backpressure aware**: a full coordinator queue is a distinct error
//! - **Thread-safe**: share one `Heartbeat` across threads

mod error;
mod heartbeat;
mod reporter;

pub use error::SdkError;
pub use heartbeat::Heartbeat;
pub use reporter::{Reporter, DEFAULT_ENDPOINT, TOKEN_HEADER};

// Re-export types for convenience
pub use pulsewatch_types::{EventType, HealthRecord, ParserEvent, RawSnapshot, WorkerKind};
