//! DDoS admission control
//!
//! Inline layer that scores every inbound request against an external
//! anomaly classifier and admits or rejects it.
//!
//! ## Components
//!
//! - **Traffic tracker**: per-source sliding windows in a sharded map
//! - **Feature extractor**: request + window snapshot to feature vector
//! - **Classifier client**: bounded single-attempt call to the scorer
//! - **Decision engine**: threshold and fail-mode policy
//! - **Record sink**: non-blocking persistence of every outcome
//!
//! ## Example
//!
//! ```rust,no_run
//! use ddos_guard::config::PolicyConfig;
//! use ddos_guard::security::ddos::{AdmissionGuard, MemoryRecordStore, RecordSink, RequestMeta, SourceKey};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = Arc::new(RecordSink::spawn(Arc::new(MemoryRecordStore::new()), 1024));
//! let guard = AdmissionGuard::with_http_classifier(PolicyConfig::default(), sink)?;
//!
//! let request = RequestMeta::new("192.168.1.1".parse::<SourceKey>()?, "GET", "/api/data");
//! let decision = guard.evaluate(&request).await;
//! if !decision.is_allowed() {
//!     println!("blocked with {:?}", decision.status_code());
//! }
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod decision;
pub mod features;
pub mod guard;
pub mod middleware;
pub mod sink;
pub mod tracker;
pub mod types;

pub use classifier::{parse_verdict, Classifier, HttpClassifier, StaticClassifier};
pub use decision::{BlockReason, Decision, DecisionEngine, DecisionPath, DecisionState, Outcome};
pub use features::{extract, extract_at, FeatureVector};
pub use guard::AdmissionGuard;
pub use middleware::{admission_middleware, request_meta, BlockResponse, VerdictExt};
pub use sink::{
    open_store, JsonLinesRecordStore, MemoryRecordStore, RecordSink, RecordStore, SinkStats,
    SqliteRecordStore,
};
pub use tracker::{TrafficTracker, WindowSnapshot};
pub use types::{
    clamp_confidence, ClassificationVerdict, DetectionRecord, RequestMeta, RiskLevel, SourceKey,
    VerdictLabel,
};
