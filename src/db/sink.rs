//! Fire-and-forget persistence of readings.
//!
//! Readings are queued on a channel and flushed to the [`Store`] by a
//! background writer in batches, so the poll cycle never waits on SQLite.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;

use super::Store;
use crate::monitor::{Reading, ReadingSink};

const QUEUE_CAPACITY: usize = 1000;
const FLUSH_THRESHOLD: usize = 500;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

enum WriterMessage {
    Append(Reading),
    /// Drop everything queued before this point and delete stored readings.
    Clear,
}

/// [`ReadingSink`] backed by SQLite with a batching writer task.
pub struct BatchedSink {
    store: Arc<Store>,
    tx: mpsc::Sender<WriterMessage>,
}

impl BatchedSink {
    /// Create the sink and spawn its writer. Must be called inside a tokio
    /// runtime.
    pub fn new(store: Arc<Store>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run_batch_writer(rx, store.clone()));
        Self { store, tx }
    }
}

impl ReadingSink for BatchedSink {
    fn append(&self, readings: Vec<Reading>) {
        for reading in readings {
            if let Err(e) = self.tx.try_send(WriterMessage::Append(reading)) {
                tracing::warn!("Dropping reading, persistence queue unavailable: {}", e);
                return;
            }
        }
    }

    fn prune(&self, older_than_days: u32) {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(older_than_days));
        match self.store.delete_readings_before(cutoff) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Retention: deleted {} readings older than {} days", n, older_than_days),
            Err(e) => tracing::error!("Retention: failed to delete old readings: {}", e),
        }
    }

    fn record_count(&self) -> i64 {
        self.store.count_readings().unwrap_or_else(|e| {
            tracing::error!("Failed to count readings: {}", e);
            0
        })
    }

    fn storage_size(&self) -> i64 {
        self.store.get_db_size_bytes().unwrap_or_else(|e| {
            tracing::error!("Failed to read database size: {}", e);
            0
        })
    }

    fn date_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.store.get_reading_time_range().unwrap_or_else(|e| {
            tracing::error!("Failed to read reading time range: {}", e);
            None
        })
    }

    /// Deletes stored readings now, then again on the writer once it reaches
    /// the marker, so readings queued before the call never reappear.
    fn clear_all(&self) {
        clear_store(&self.store);
        if let Err(e) = self.tx.try_send(WriterMessage::Clear) {
            tracing::warn!("Persistence queue unavailable, queued readings may survive clear: {}", e);
        }
    }
}

/// Accumulate readings and flush them every [`FLUSH_INTERVAL`] or once
/// [`FLUSH_THRESHOLD`] are pending.
async fn run_batch_writer(mut rx: mpsc::Receiver<WriterMessage>, store: Arc<Store>) {
    let mut buffer: Vec<Reading> = Vec::with_capacity(FLUSH_THRESHOLD);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(WriterMessage::Append(r)) => {
                        buffer.push(r);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    Some(WriterMessage::Clear) => {
                        buffer.clear();
                        clear_store(&store);
                    }
                    None => {
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn clear_store(store: &Store) {
    if let Err(e) = store.delete_all_readings() {
        tracing::error!("Failed to clear readings: {}", e);
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<Reading>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_readings(buffer) {
        tracing::error!("Failed to flush {} readings: {}", buffer.len(), e);
    }

    buffer.clear();
}
