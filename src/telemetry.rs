//! Telemetry: a fan-in event queue drained by a single batching consumer
//! that calls into an injected sink, with buffered-on-shutdown persistence.

use crate::error::CoreError;
use crate::fetch::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};

const DEFAULT_BATCH_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_BATCH: usize = 200;
const BUFFER_FILE: &str = "telemetry_buffer.plist";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryEventType {
    DnsQuery,
    RuleUpdate,
    CachePerformance,
    ExtensionLifecycle,
    SecurityViolation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub timestamp: DateTime<Utc>,
    pub fields: HashMap<String, String>,
}

impl TelemetryEvent {
    pub fn new(event_type: TelemetryEventType, fields: HashMap<String, String>) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            fields,
        }
    }
}

#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send_batch(&self, events: &[TelemetryEvent]) -> Result<(), CoreError>;
}

#[derive(Clone)]
pub struct TelemetryHandle {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl TelemetryHandle {
    pub fn emit(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }
}

pub struct TelemetryConfig {
    pub batch_interval_secs: u64,
    pub max_batch: usize,
    pub buffer_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            batch_interval_secs: DEFAULT_BATCH_INTERVAL_SECS,
            max_batch: DEFAULT_MAX_BATCH,
            buffer_dir: PathBuf::from("."),
            retry: RetryPolicy::default(),
        }
    }
}

/// Spawns the draining consumer and returns a cheaply-cloneable handle
/// producers use to emit events. `shutdown` fires once to flush any
/// buffered events to disk and stop the consumer.
pub fn spawn(
    config: TelemetryConfig,
    sink: Arc<dyn TelemetrySink>,
    mut shutdown: broadcast::Receiver<()>,
) -> TelemetryHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<TelemetryEvent>();
    let buffer_path = config.buffer_dir.join(BUFFER_FILE);

    tokio::spawn(async move {
        let mut pending = load_buffer(&buffer_path);
        let interval_duration = std::time::Duration::from_secs(config.batch_interval_secs).max(std::time::Duration::from_millis(10));
        let mut ticker = tokio::time::interval(interval_duration);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    drain_into(&mut rx, &mut pending, config.max_batch);
                    if !pending.is_empty() {
                        flush_with_retry(&sink, &mut pending, &config.retry).await;
                    }
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => pending.push(event),
                        None => break,
                    }
                }
                _ = shutdown.recv() => {
                    drain_into(&mut rx, &mut pending, usize::MAX);
                    if let Err(err) = persist_buffer(&buffer_path, &pending) {
                        error!(error = %err, "failed to persist telemetry buffer on shutdown");
                    }
                    return;
                }
            }
        }
    });

    TelemetryHandle { tx }
}

fn drain_into(rx: &mut mpsc::UnboundedReceiver<TelemetryEvent>, pending: &mut Vec<TelemetryEvent>, max: usize) {
    while pending.len() < max {
        match rx.try_recv() {
            Ok(event) => pending.push(event),
            Err(_) => break,
        }
    }
}

async fn flush_with_retry(sink: &Arc<dyn TelemetrySink>, pending: &mut Vec<TelemetryEvent>, retry: &RetryPolicy) {
    let batch = std::mem::take(pending);
    let mut attempt = 1;
    let mut remaining = batch;
    loop {
        match sink.send_batch(&remaining).await {
            Ok(()) => return,
            Err(err) => {
                warn!(attempt, error = %err, "telemetry sink batch failed");
                if attempt >= retry.retry_count.max(1) {
                    *pending = remaining;
                    return;
                }
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}

fn load_buffer(path: &Path) -> Vec<TelemetryEvent> {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| plist::from_bytes(&bytes).ok())
        .unwrap_or_default()
}

fn persist_buffer(path: &Path, events: &[TelemetryEvent]) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut bytes = Vec::new();
    plist::to_writer_xml(&mut bytes, &events.to_vec())
        .map_err(|e| CoreError::CacheIoError(format!("telemetry buffer encode failed: {e}")))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        received: Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl TelemetrySink for RecordingSink {
        async fn send_batch(&self, events: &[TelemetryEvent]) -> Result<(), CoreError> {
            self.received.lock().unwrap().push(events.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn emitted_events_reach_the_sink() {
        let sink = Arc::new(RecordingSink {
            received: Mutex::new(Vec::new()),
        });
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(
            TelemetryConfig {
                batch_interval_secs: 0,
                buffer_dir: dir.path().to_path_buf(),
                ..TelemetryConfig::default()
            },
            sink.clone(),
            shutdown_rx,
        );

        handle.emit(TelemetryEvent::new(TelemetryEventType::DnsQuery, HashMap::new()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!sink.received.lock().unwrap().is_empty());
    }

    #[test]
    fn buffer_round_trips_through_plist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BUFFER_FILE);
        let events = vec![TelemetryEvent::new(TelemetryEventType::SecurityViolation, HashMap::new())];
        persist_buffer(&path, &events).unwrap();
        let loaded = load_buffer(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].event_type, TelemetryEventType::SecurityViolation);
    }
}
