//! Admission Guard
//!
//! Per-request pipeline: tracker update, optional rate ceiling, feature
//! extraction, classifier call, decision, detection record.

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classifier::{Classifier, HttpClassifier};
use super::decision::{Decision, DecisionEngine};
use super::features::{extract, FeatureVector};
use super::sink::RecordSink;
use super::tracker::TrafficTracker;
use super::types::{DetectionRecord, RequestMeta};
use crate::config::PolicyConfig;
use crate::error::{ClassifierError, Result};

/// Inline admission control shared by all request tasks
pub struct AdmissionGuard {
    policy: Arc<PolicyConfig>,
    tracker: Arc<TrafficTracker>,
    classifier: Arc<dyn Classifier>,
    engine: DecisionEngine,
    sink: Arc<RecordSink>,
}

impl AdmissionGuard {
    pub fn new(policy: PolicyConfig, classifier: Arc<dyn Classifier>, sink: Arc<RecordSink>) -> Self {
        let tracker = Arc::new(TrafficTracker::new(
            policy.window,
            policy.signature_history_cap,
        ));
        let engine = DecisionEngine::new(&policy);

        Self {
            policy: Arc::new(policy),
            tracker,
            classifier,
            engine,
            sink,
        }
    }

    /// Guard backed by the configured HTTP classifier
    pub fn with_http_classifier(policy: PolicyConfig, sink: Arc<RecordSink>) -> Result<Self> {
        let classifier = HttpClassifier::new(
            &policy.classifier_endpoint,
            policy.payload_schema,
            policy.classifier_timeout,
        )?;
        Ok(Self::new(policy, Arc::new(classifier), sink))
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn tracker(&self) -> &Arc<TrafficTracker> {
        &self.tracker
    }

    pub fn sink(&self) -> &Arc<RecordSink> {
        &self.sink
    }

    /// Whether the path bypasses admission control
    pub fn is_exempt(&self, path: &str) -> bool {
        self.policy.exempt_paths.iter().any(|p| p == path)
    }

    /// Run the periodic tracker sweep until `cancel` fires
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.tracker
            .spawn_sweeper(self.policy.sweep_interval, cancel)
    }

    /// Evaluate one request and emit its detection record
    pub async fn evaluate(&self, request: &RequestMeta) -> Decision {
        let started = Instant::now();
        let snapshot = self.tracker.observe(request.source, request);
        let features = extract(request, &snapshot);

        if let Some(decision) = self.engine.rate_ceiling(&snapshot) {
            warn!(
                request_id = %request.request_id,
                source = %request.source,
                in_window = snapshot.request_count,
                "Rate ceiling exceeded"
            );
            self.emit(request, features, &decision);
            return decision;
        }

        let timeout = self.policy.classifier_timeout;
        let result = match tokio::time::timeout(
            timeout,
            self.classifier.classify(&features, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(timeout)),
        };

        if let Err(e) = &result {
            warn!(
                request_id = %request.request_id,
                source = %request.source,
                classifier = self.classifier.name(),
                kind = e.kind(),
                error = %e,
                fail_mode = ?self.engine.fail_mode(),
                "Classifier unavailable"
            );
        }

        let decision = self.engine.decide(result);
        self.emit(request, features, &decision);

        if decision.is_monitored() {
            info!(
                request_id = %request.request_id,
                source = %request.source,
                label = %decision.verdict.label,
                confidence = decision.verdict.confidence,
                reason = ?decision.reason,
                "Detection recorded; blocking disabled"
            );
        } else if decision.is_allowed() {
            debug!(
                request_id = %request.request_id,
                source = %request.source,
                label = %decision.verdict.label,
                confidence = decision.verdict.confidence,
                path = decision.path.as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request admitted"
            );
        } else {
            info!(
                request_id = %request.request_id,
                source = %request.source,
                label = %decision.verdict.label,
                confidence = decision.verdict.confidence,
                reason = ?decision.reason,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request blocked"
            );
        }

        decision
    }

    fn emit(&self, request: &RequestMeta, features: FeatureVector, decision: &Decision) {
        self.sink
            .record(DetectionRecord::new(request.source, features, decision.clone()));
    }
}
