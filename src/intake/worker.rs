//! The single consumer draining the intake queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pulsewatch_types::ParserEvent;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::IntakeQueue;
use crate::store::StoreError;

/// Destination for consumed events. Called on a blocking thread.
pub trait EventSink: Send + Sync + 'static {
    /// Apply one event, returning how many entities were written.
    fn apply(&self, event: &ParserEvent, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Handle to a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Signal stop and wait for the in-flight event, if any, to finish.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

impl IntakeQueue {
    /// Start the consumer. Returns `None` if it was already started.
    ///
    /// `poll` bounds how long the consumer waits for an event before
    /// rechecking the stop signal.
    pub fn start_consumer(&self, sink: Arc<dyn EventSink>, poll: Duration) -> Option<ConsumerHandle> {
        let mut rx = self.rx.lock().take()?;
        let state = self.state.clone();
        let running = self.running.clone();
        let (stop_tx, stop_rx) = watch::channel(false);

        running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(async move {
            info!("intake consumer started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let event = match tokio::time::timeout(poll, rx.recv()).await {
                    Err(_) => continue,
                    Ok(None) => break,
                    Ok(Some(event)) => event,
                };

                let kind = event.event_type;
                let entities = event.stats_by_url.len();
                let sink = sink.clone();
                let result =
                    tokio::task::spawn_blocking(move || sink.apply(&event, Utc::now())).await;

                let mut guard = state.lock();
                match result {
                    Ok(Ok(updated)) => {
                        debug!(%kind, entities, updated, "event applied");
                        guard.last_ok_utc = Some(Utc::now());
                        guard.last_error = None;
                    }
                    Ok(Err(e)) => {
                        error!(%kind, error = %e, "failed to apply event");
                        guard.last_error = Some(format!("{}: {}", e.kind(), e));
                    }
                    Err(e) => {
                        error!(%kind, error = %e, "apply task panicked");
                        guard.last_error = Some(format!("Panic: {e}"));
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("intake consumer stopped");
        });

        Some(ConsumerHandle { stop_tx, task })
    }
}
