//! Batched NDJSON log shipping. Records are buffered on a bounded channel
//! and flushed on an interval or when the batch fills, so bandwidth and
//! memory stay bounded no matter how chatty a container gets.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::CloudApi;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub level: String,
    pub message: String,
}

/// Producer handle. Cheap to clone; drops records when the buffer is full
/// rather than blocking the caller.
#[derive(Clone)]
pub struct LogShipper {
    tx: mpsc::Sender<LogRecord>,
}

impl LogShipper {
    pub fn push(&self, record: LogRecord) {
        if self.tx.try_send(record).is_err() {
            // Buffer full or shut down; shipping is best-effort.
            debug!("log record dropped");
        }
    }
}

/// Serialize a batch as newline-delimited JSON.
pub fn to_ndjson(batch: &[LogRecord]) -> String {
    let mut out = String::new();
    for record in batch {
        if let Ok(line) = serde_json::to_string(record) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

/// Spawn the shipper task. Returns the producer handle and the join handle
/// of the flush loop; the loop drains outstanding records before exiting.
pub fn start_log_shipper(
    api: Arc<CloudApi>,
    uuid: String,
    flush_interval: Duration,
    max_batch: usize,
    cancel: CancellationToken,
) -> (LogShipper, tokio::task::JoinHandle<()>) {
    let max_batch = max_batch.max(1);
    let (tx, mut rx) = mpsc::channel::<LogRecord>(max_batch * 4);
    let handle = tokio::spawn(async move {
        let mut batch: Vec<LogRecord> = Vec::with_capacity(max_batch);
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    flush(&api, &uuid, &mut batch).await;
                }
                record = rx.recv() => match record {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= max_batch {
                            flush(&api, &uuid, &mut batch).await;
                        }
                    }
                    None => break,
                },
            }
        }

        // Drain: ship whatever is still queued before shutdown completes.
        while let Ok(record) = rx.try_recv() {
            batch.push(record);
        }
        flush(&api, &uuid, &mut batch).await;
    });
    (LogShipper { tx }, handle)
}

async fn flush(api: &Arc<CloudApi>, uuid: &str, batch: &mut Vec<LogRecord>) {
    if batch.is_empty() {
        return;
    }
    let body = to_ndjson(batch);
    let count = batch.len();
    batch.clear();
    if let Err(e) = api.ship_logs(uuid, body).await {
        warn!(error = %e, dropped = count, "log shipment failed");
    } else {
        debug!(count, "logs shipped");
    }
}
