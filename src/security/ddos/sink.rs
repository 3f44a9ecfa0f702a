//! Detection Record Sink
//!
//! Best-effort persistence of detection records. `record` never blocks the
//! request path: records are queued on a bounded channel and written by a
//! background task. A full queue or a failing store drops the record with a
//! warning.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::DetectionRecord;
use crate::config::{StorageKind, StorageSettings};
use crate::error::{Error, Result};

/// Append-only destination for detection records
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, record: &DetectionRecord) -> Result<()>;
}

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS detection_records (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    ip TEXT NOT NULL,
    features TEXT NOT NULL,
    prediction TEXT NOT NULL,
    is_ddos INTEGER NOT NULL,
    confidence REAL NOT NULL,
    risk_level TEXT,
    decision TEXT NOT NULL,
    path TEXT NOT NULL,
    reason TEXT
)
"#;

const INSERT_SQL: &str = r#"
INSERT INTO detection_records
    (id, timestamp, ip, features, prediction, is_ddos, confidence, risk_level, decision, path, reason)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Open (or create) the database file and ensure the table exists
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM detection_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, record: &DetectionRecord) -> Result<()> {
        let features = serde_json::to_string(&record.features)?;

        sqlx::query(INSERT_SQL)
            .bind(record.id.to_string())
            .bind(record.timestamp)
            .bind(record.ip.to_string())
            .bind(features)
            .bind(record.prediction())
            .bind(record.is_ddos())
            .bind(record.verdict.confidence)
            .bind(record.risk_level())
            .bind(record.decision.as_str())
            .bind(record.path.as_str())
            .bind(record.reason.map(|r| r.as_str()))
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// One JSON document per line
#[derive(Debug)]
pub struct JsonLinesRecordStore {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonLinesRecordStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Persistence(format!("open {}: {}", path.display(), e)))?;

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for JsonLinesRecordStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&self, record: &DetectionRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<DetectionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DetectionRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, record: &DetectionRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Build the configured store
pub async fn open_store(settings: &StorageSettings) -> Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match settings.kind {
        StorageKind::Sqlite => Arc::new(SqliteRecordStore::connect(&settings.path).await?),
        StorageKind::JsonLines => Arc::new(JsonLinesRecordStore::open(&settings.path).await?),
        StorageKind::Memory => Arc::new(MemoryRecordStore::new()),
    };
    info!(store = store.name(), path = %settings.path, "Detection record store ready");
    Ok(store)
}

#[derive(Debug, Default)]
struct SinkCounters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

/// Sink counters at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub submitted: u64,
    /// Rejected by a full or closed queue
    pub dropped: u64,
    pub persisted: u64,
    /// Store reported an error
    pub failed: u64,
}

/// Non-blocking front of the background writer
pub struct RecordSink {
    sender: RwLock<Option<mpsc::Sender<DetectionRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<SinkCounters>,
}

impl RecordSink {
    /// Start the writer task. Must be called within a tokio runtime.
    pub fn spawn(store: Arc<dyn RecordStore>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(SinkCounters::default());
        let writer = tokio::spawn(run_writer(store, receiver, counters.clone()));

        Self {
            sender: RwLock::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            counters,
        }
    }

    /// Queue a record without waiting
    pub fn record(&self, record: DetectionRecord) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(record_id = %record.id, "Detection record sink is shut down; record dropped");
            return;
        };

        match sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(record_id = %record.id, ip = %record.ip, "Detection record queue full; record dropped");
            }
            Err(TrySendError::Closed(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(record_id = %record.id, "Detection record writer stopped; record dropped");
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Close the queue and wait until every queued record has been handled
    pub async fn shutdown(&self) {
        drop(self.sender.write().take());

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "Detection record writer terminated abnormally");
            }
        }

        let stats = self.stats();
        info!(
            submitted = stats.submitted,
            persisted = stats.persisted,
            dropped = stats.dropped,
            failed = stats.failed,
            "Detection record sink stopped"
        );
    }
}

async fn run_writer(
    store: Arc<dyn RecordStore>,
    mut receiver: mpsc::Receiver<DetectionRecord>,
    counters: Arc<SinkCounters>,
) {
    while let Some(record) = receiver.recv().await {
        match store.append(&record).await {
            Ok(()) => {
                counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    store = store.name(),
                    record_id = %record.id,
                    error = %e,
                    "Persistence failure; detection record dropped"
                );
            }
        }
    }
    debug!(store = store.name(), "Detection record writer drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::security::ddos::decision::DecisionEngine;
    use crate::security::ddos::features::extract;
    use crate::security::ddos::tracker::WindowSnapshot;
    use crate::security::ddos::types::{
        ClassificationVerdict, RequestMeta, SourceKey, VerdictLabel,
    };
    use sqlx::Row;

    fn record(label: VerdictLabel, confidence: f64) -> DetectionRecord {
        let source = SourceKey::parse("10.1.2.3").unwrap();
        let meta = RequestMeta::new(source, "GET", "/");
        let features = extract(&meta, &WindowSnapshot::first(0));
        let decision = DecisionEngine::new(&PolicyConfig::default())
            .decide(Ok(ClassificationVerdict::new(label, confidence, None)));
        DetectionRecord::new(source, features, decision)
    }

    struct FailingStore;

    #[async_trait]
    impl RecordStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn append(&self, _record: &DetectionRecord) -> Result<()> {
            Err(Error::Persistence("disk full".to_string()))
        }
    }

    struct SlowStore;

    #[async_trait]
    impl RecordStore for SlowStore {
        fn name(&self) -> &str {
            "slow"
        }

        async fn append(&self, _record: &DetectionRecord) -> Result<()> {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_persists_to_memory() {
        let store = Arc::new(MemoryRecordStore::new());
        let sink = RecordSink::spawn(store.clone(), 16);

        sink.record(record(VerdictLabel::Benign, 0.1));
        sink.record(record(VerdictLabel::Ddos, 0.95));
        sink.shutdown().await;

        assert_eq!(store.len(), 2);
        let stats = sink.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.persisted, 2);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_counted_not_raised() {
        let sink = RecordSink::spawn(Arc::new(FailingStore), 4);
        sink.record(record(VerdictLabel::Benign, 0.1));
        sink.shutdown().await;

        let stats = sink.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.persisted, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let sink = RecordSink::spawn(Arc::new(SlowStore), 1);
        for _ in 0..10 {
            sink.record(record(VerdictLabel::Benign, 0.1));
        }

        let stats = sink.stats();
        assert_eq!(stats.submitted, 10);
        assert!(stats.dropped >= 8, "dropped {}", stats.dropped);
    }

    #[tokio::test]
    async fn test_record_after_shutdown_is_dropped() {
        let sink = RecordSink::spawn(Arc::new(MemoryRecordStore::new()), 4);
        sink.shutdown().await;
        sink.record(record(VerdictLabel::Benign, 0.1));
        assert_eq!(sink.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_sqlite_store_columns() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteRecordStore::from_pool(pool).await.unwrap();

        let blocked = record(VerdictLabel::Ddos, 0.95);
        store.append(&blocked).await.unwrap();
        store.append(&record(VerdictLabel::Benign, 0.2)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        let row = sqlx::query("SELECT * FROM detection_records WHERE id = ?")
            .bind(blocked.id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("ip"), "10.1.2.3");
        assert_eq!(row.get::<String, _>("prediction"), "ddos");
        assert!(row.get::<bool, _>("is_ddos"));
        assert_eq!(row.get::<f64, _>("confidence"), 0.95);
        assert_eq!(row.get::<String, _>("risk_level"), "critical");
        assert_eq!(row.get::<String, _>("decision"), "blocked");
        assert_eq!(row.get::<String, _>("path"), "scored");
        assert_eq!(row.get::<String, _>("reason"), "volume_attack");

        let features: serde_json::Value =
            serde_json::from_str(&row.get::<String, _>("features")).unwrap();
        assert_eq!(features["source_ip"], 0x0A010203u32);
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records").join("detections.jsonl");
        let store = JsonLinesRecordStore::open(&path).await.unwrap();

        store.append(&record(VerdictLabel::Benign, 0.1)).await.unwrap();
        store.append(&record(VerdictLabel::Malicious, 0.9)).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["verdict"]["label"], "malicious");
        assert_eq!(second["decision"], "blocked");
        assert_eq!(second["reason"], "classifier_flagged");
    }
}
