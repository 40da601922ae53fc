//! Asynchronous access logging.
//!
//! # Responsibilities
//! - Accept log entries from request tasks without blocking them
//! - Write entries on a single background worker
//! - Recycle entries through a pool so steady-state logging does not allocate
//! - Fan entries out to live monitor subscribers
//!
//! # Data Flow
//! ```text
//! request task: acquire() → fill fields → submit()
//!     → try_send on bounded queue
//!         ok   → worker: SiteLogger::write → monitor broadcast → release()
//!         full → dropped counter → release()
//! ```
//!
//! # Design Decisions
//! - Drop-on-overflow: request latency never depends on log throughput
//! - Every acquired entry is released exactly once, on whichever path it takes
//! - Shutdown closes the queue, drains what is already queued, then stops

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::observability::metrics;

/// Default bounded capacity of the queue.
pub const DEFAULT_CAPACITY: usize = 10_000;

const MONITOR_CAPACITY: usize = 1024;

/// A structured field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{s}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v:.6}"),
        }
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

/// Log destination for one site or one shared port.
#[derive(Debug)]
pub struct SiteLogger {
    identifier: String,
}

impl SiteLogger {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Emit one access record.
    pub fn write(&self, entry: &LogEntry) {
        emit(&self.identifier, entry);
    }
}

/// One `access_log` event with every request field as its own typed field.
fn emit(identifier: &str, entry: &LogEntry) {
    tracing::info!(
        target: "access_log",
        site = %identifier,
        domain = entry.text("domain"),
        method = entry.text("method"),
        url = entry.text("url"),
        remote_addr = entry.text("remote_addr"),
        status_code = entry.int("status_code"),
        duration_sec = entry.float("duration_sec"),
        "{}",
        entry.message
    );
}

/// Per-generation map from log identifier to its logger.
#[derive(Debug, Default)]
pub struct LoggerRegistry {
    loggers: DashMap<String, Arc<SiteLogger>>,
}

impl LoggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, identifier: &str) -> Arc<SiteLogger> {
        self.loggers
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(SiteLogger::new(identifier)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

/// A pooled, reusable log record.
#[derive(Debug, Default)]
pub struct LogEntry {
    pub logger: Option<Arc<SiteLogger>>,
    pub fields: Vec<(&'static str, FieldValue)>,
    pub message: String,
    pub identifier: String,
}

impl LogEntry {
    /// Set a field, replacing an existing value with the same key.
    pub fn set(&mut self, key: &'static str, value: impl Into<FieldValue>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Clear every field so no data leaks into the next use.
    pub fn reset(&mut self) {
        self.logger = None;
        self.fields.clear();
        self.message.clear();
        self.identifier.clear();
    }

    fn text(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn float(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Str(_) => None,
        }
    }

    fn to_record(&self) -> LogRecord {
        LogRecord {
            timestamp: SystemTime::now(),
            identifier: self.identifier.clone(),
            message: self.message.clone(),
            fields: self
                .fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }
}

/// Owned snapshot of an entry delivered to live monitors.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub identifier: String,
    pub message: String,
    pub fields: Vec<(String, FieldValue)>,
}

#[derive(Debug)]
struct EntryPool {
    free: Mutex<Vec<Box<LogEntry>>>,
    max_idle: usize,
    outstanding: AtomicUsize,
}

impl EntryPool {
    fn acquire(&self) -> Box<LogEntry> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_default()
    }

    fn release(&self, mut entry: Box<LogEntry>) {
        entry.reset();
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_idle {
                free.push(entry);
            }
        }
    }
}

/// Bounded, non-blocking access-log queue with one background writer.
#[derive(Debug)]
pub struct AsyncLogger {
    tx: mpsc::Sender<Box<LogEntry>>,
    pool: Arc<EntryPool>,
    dropped: AtomicU64,
    monitor: broadcast::Sender<LogRecord>,
    close: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLogger {
    /// Create the queue and spawn its worker on the current runtime.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = oneshot::channel();
        let (monitor, _) = broadcast::channel(MONITOR_CAPACITY);
        let pool = Arc::new(EntryPool {
            free: Mutex::new(Vec::new()),
            max_idle: capacity,
            outstanding: AtomicUsize::new(0),
        });

        let worker = tokio::spawn(run_worker(rx, close_rx, pool.clone(), monitor.clone()));

        Arc::new(Self {
            tx,
            pool,
            dropped: AtomicU64::new(0),
            monitor,
            close: Mutex::new(Some(close_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Take a clean entry from the pool.
    pub fn acquire(&self) -> Box<LogEntry> {
        self.pool.acquire()
    }

    /// Enqueue an entry without blocking. Returns false if it was dropped.
    pub fn submit(&self, entry: Box<LogEntry>) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(err) => {
                let entry = match err {
                    mpsc::error::TrySendError::Full(e) | mpsc::error::TrySendError::Closed(e) => e,
                };
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_access_log_dropped();
                self.pool.release(entry);
                false
            }
        }
    }

    /// Entries lost because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Entries acquired and not yet returned to the pool.
    pub fn outstanding(&self) -> usize {
        self.pool.outstanding.load(Ordering::Relaxed)
    }

    /// Receive a copy of every entry written from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.monitor.subscribe()
    }

    /// Close the queue, drain pending entries and wait for the worker.
    pub async fn shutdown(&self) {
        let close = self.close.lock().ok().and_then(|mut c| c.take());
        if let Some(close) = close {
            let _ = close.send(());
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Access log worker failed");
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Box<LogEntry>>,
    mut close: oneshot::Receiver<()>,
    pool: Arc<EntryPool>,
    monitor: broadcast::Sender<LogRecord>,
) {
    loop {
        tokio::select! {
            _ = &mut close => {
                rx.close();
                while let Some(entry) = rx.recv().await {
                    write_entry(&entry, &monitor);
                    pool.release(entry);
                }
                break;
            }
            next = rx.recv() => match next {
                Some(entry) => {
                    write_entry(&entry, &monitor);
                    pool.release(entry);
                }
                None => break,
            },
        }
    }
    tracing::debug!("Access log worker stopped");
}

fn write_entry(entry: &LogEntry, monitor: &broadcast::Sender<LogRecord>) {
    match &entry.logger {
        Some(logger) => logger.write(entry),
        None => emit(&entry.identifier, entry),
    }
    if monitor.receiver_count() > 0 {
        let _ = monitor.send(entry.to_record());
    }
}
