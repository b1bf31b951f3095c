//! Bounded event intake.
//!
//! Many producers submit batches over HTTP; a single consumer drains them
//! into the store. The queue never grows past its capacity: a full queue
//! rejects the submission and the producer retries later.
//!
//! ```text
//!  POST /internal/parser-events ──submit──▶ [ mpsc, capacity N ] ──▶ consumer ──▶ EventSink
//!                                  │                                              (spawn_blocking)
//!                                  └── SubmitError::{InvalidPayload, InvalidType, EmptyStats, QueueFull, Closed}
//! ```

mod apply;
mod worker;

pub use apply::Applier;
pub use worker::{ConsumerHandle, EventSink};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pulsewatch_types::{
    format_timestamp, normalize_stats_map, parse_timestamp_value, EventType, ParserEvent,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 200;

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("payload is not an object")]
    InvalidPayload,
    #[error("unrecognized event type")]
    InvalidType,
    #[error("no usable snapshots in stats_by_url")]
    EmptyStats,
    #[error("queue is full")]
    QueueFull,
    #[error("queue is closed")]
    Closed,
}

impl SubmitError {
    /// Wire code returned to producers.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitError::InvalidPayload => "invalid_payload",
            SubmitError::InvalidType => "invalid_type",
            SubmitError::EmptyStats => "empty_stats",
            SubmitError::QueueFull => "queue_full",
            SubmitError::Closed => "queue_closed",
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConsumerState {
    pub(crate) last_ok_utc: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<String>,
}

/// Snapshot of the queue and its consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntakeStatus {
    pub ok: bool,
    pub queue_size: usize,
    pub capacity: usize,
    pub last_ok_utc: Option<String>,
    pub last_error: Option<String>,
    pub worker_running: bool,
}

/// The bounded queue between producers and the consumer.
#[derive(Debug)]
pub struct IntakeQueue {
    tx: mpsc::Sender<ParserEvent>,
    rx: Mutex<Option<mpsc::Receiver<ParserEvent>>>,
    capacity: usize,
    state: Arc<Mutex<ConsumerState>>,
    running: Arc<AtomicBool>,
}

impl IntakeQueue {
    /// Create a queue. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
            state: Arc::new(Mutex::new(ConsumerState::default())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events waiting to be consumed.
    pub fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    /// Validate and enqueue a raw submission without blocking.
    ///
    /// Stamps `received_at_utc` with `now` when the producer did not. Returns
    /// the queue depth after the enqueue.
    pub fn submit(&self, payload: Value, now: DateTime<Utc>) -> Result<usize, SubmitError> {
        let Value::Object(payload) = payload else {
            return Err(SubmitError::InvalidPayload);
        };
        let event_type: EventType = payload
            .get("type")
            .and_then(Value::as_str)
            .and_then(|t| t.parse().ok())
            .ok_or(SubmitError::InvalidType)?;
        let stats_by_url = normalize_stats_map(payload.get("stats_by_url"));
        if stats_by_url.is_empty() {
            return Err(SubmitError::EmptyStats);
        }

        let event = ParserEvent {
            event_type,
            stats_by_url,
            sent_at_utc: parse_timestamp_value(payload.get("sent_at_utc")),
            received_at_utc: parse_timestamp_value(payload.get("received_at_utc")).or(Some(now)),
        };

        match self.tx.try_send(event) {
            Ok(()) => Ok(self.depth()),
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    pub fn status(&self) -> IntakeStatus {
        let state = self.state.lock();
        IntakeStatus {
            ok: true,
            queue_size: self.depth(),
            capacity: self.capacity,
            last_ok_utc: state.last_ok_utc.map(format_timestamp),
            last_error: state.last_error.clone(),
            worker_running: self.running.load(Ordering::SeqCst),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn posts_batch(n: usize) -> Value {
        json!({
            "type": "posts_stats_batch",
            "stats_by_url": { format!("https://p/{n}"): {"views": n} }
        })
    }

    #[test]
    fn rejects_malformed_submissions() {
        let queue = IntakeQueue::new(4);
        assert_eq!(queue.submit(json!([1]), now()), Err(SubmitError::InvalidPayload));
        assert_eq!(
            queue.submit(json!({"type": "bogus", "stats_by_url": {"a": {}}}), now()),
            Err(SubmitError::InvalidType)
        );
        assert_eq!(queue.submit(json!({"stats_by_url": {"a": {}}}), now()), Err(SubmitError::InvalidType));
        assert_eq!(
            queue.submit(json!({"type": "accounts_stats_batch", "stats_by_url": {}}), now()),
            Err(SubmitError::EmptyStats)
        );
        assert_eq!(
            queue.submit(json!({"type": "accounts_stats_batch", "stats_by_url": {" ": {}, "x": 3}}), now()),
            Err(SubmitError::EmptyStats)
        );
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn full_queue_rejects_without_growing() {
        let queue = IntakeQueue::new(2);
        assert_eq!(queue.submit(posts_batch(1), now()), Ok(1));
        assert_eq!(queue.submit(posts_batch(2), now()), Ok(2));
        assert_eq!(queue.submit(posts_batch(3), now()), Err(SubmitError::QueueFull));
        assert_eq!(queue.depth(), 2);

        let mut rx = queue.rx.lock().take().unwrap();
        let first = rx.try_recv().unwrap();
        assert!(first.stats_by_url.contains_key("https://p/1"));
        assert_eq!(queue.submit(posts_batch(3), now()), Ok(2));
    }

    #[test]
    fn received_at_is_stamped_when_absent() {
        let queue = IntakeQueue::new(2);
        queue.submit(posts_batch(1), now()).unwrap();
        let mut with_stamp = posts_batch(2);
        with_stamp["received_at_utc"] = json!("2024-04-30T00:00:00Z");
        queue.submit(with_stamp, now()).unwrap();

        let mut rx = queue.rx.lock().take().unwrap();
        assert_eq!(rx.try_recv().unwrap().received_at_utc, Some(now()));
        assert_eq!(
            rx.try_recv().unwrap().received_at_utc,
            Some(Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn status_reports_depth_and_capacity() {
        let queue = IntakeQueue::new(0);
        queue.submit(posts_batch(1), now()).unwrap();
        let status = queue.status();
        assert_eq!(status.capacity, 1);
        assert_eq!(status.queue_size, 1);
        assert!(!status.worker_running);
        assert_eq!(status.last_error, None);
    }
}
