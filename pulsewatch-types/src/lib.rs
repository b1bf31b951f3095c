//! # pulsewatch-types
//!
//! Record schemas shared by pulsewatch workers and the coordinator.
//!
//! Workers talk to the coordinator over two channels only: a heartbeat file
//! they rewrite after every request ([`HealthRecord`]) and batched snapshot
//! submissions over HTTP ([`ParserEvent`]). Both are defined here so the two
//! sides cannot drift.
//!
//! ## Design Goals
//!
//! - **Explicit schemas**: optional fields instead of free-form maps
//! - **Lenient reads**: unknown keys are ignored, bad timestamps become `None`
//! - **One time format**: everything persisted is RFC 3339 UTC
//!
//! ## Example
//!
//! ```rust
//! use pulsewatch_types::{HealthRecord, WorkerKind};
//!
//! let record = HealthRecord::from_json(r#"{"kind": "posts", "pid": 12}"#).unwrap();
//! assert_eq!(record.kind, Some(WorkerKind::Posts));
//! assert!(record.last_request_ts_utc.is_none());
//! ```

mod event;
mod health;
mod metric;
mod time;
mod worker;

pub use event::*;
pub use health::*;
pub use metric::*;
pub use time::*;
pub use worker::*;
