//! Classifier Client
//!
//! Sends feature vectors to the external scoring endpoint and normalizes the
//! reply into a [`ClassificationVerdict`]. Exactly one attempt is made per
//! request; every failure is reported as a [`ClassifierError`] so the fail
//! policy stays in the decision engine.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::features::FeatureVector;
use super::types::{ClassificationVerdict, RiskLevel, VerdictLabel};
use crate::config::PayloadSchema;
use crate::error::{ClassifierError, Error};

/// Anomaly scorer interface
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Scorer name for logs
    fn name(&self) -> &str;

    /// Score one vector within `timeout`
    async fn classify(
        &self,
        vector: &FeatureVector,
        timeout: Duration,
    ) -> Result<ClassificationVerdict, ClassifierError>;
}

/// Response shapes accepted from the scorer
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVerdict {
    /// `{ is_ddos, confidence, risk_level }`
    Flag {
        is_ddos: bool,
        confidence: f64,
        #[serde(default)]
        risk_level: Option<String>,
    },
    /// `{ prediction, confidence, raw_probabilities }`
    Labelled {
        prediction: String,
        confidence: f64,
        #[serde(default)]
        raw_probabilities: Vec<f64>,
    },
}

impl RawVerdict {
    fn normalize(self) -> ClassificationVerdict {
        match self {
            RawVerdict::Flag {
                is_ddos,
                confidence,
                risk_level,
            } => {
                let label = if is_ddos {
                    VerdictLabel::Ddos
                } else {
                    VerdictLabel::Benign
                };
                let risk = risk_level.as_deref().and_then(RiskLevel::parse);
                ClassificationVerdict::new(label, confidence, risk)
            }
            RawVerdict::Labelled {
                prediction,
                confidence,
                raw_probabilities,
            } => {
                let label = VerdictLabel::from_prediction(&prediction);
                ClassificationVerdict::new(label, confidence, None)
                    .with_probabilities(raw_probabilities)
            }
        }
    }
}

/// Decode and normalize a scorer response body
pub fn parse_verdict(body: &[u8]) -> Result<ClassificationVerdict, ClassifierError> {
    serde_json::from_slice::<RawVerdict>(body)
        .map(RawVerdict::normalize)
        .map_err(|e| ClassifierError::Malformed(e.to_string()))
}

/// Scorer reached over HTTP
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    schema: PayloadSchema,
}

impl HttpClassifier {
    pub fn new(endpoint: &str, schema: PayloadSchema, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("classifier client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            schema,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn exchange(
        &self,
        vector: &FeatureVector,
        timeout: Duration,
    ) -> Result<ClassificationVerdict, ClassifierError> {
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                ClassifierError::Timeout(timeout)
            } else {
                ClassifierError::from(e)
            }
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&vector.to_payload(self.schema))
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(map_err)?;
        parse_verdict(&body)
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &str {
        "http"
    }

    async fn classify(
        &self,
        vector: &FeatureVector,
        timeout: Duration,
    ) -> Result<ClassificationVerdict, ClassifierError> {
        let verdict = tokio::time::timeout(timeout, self.exchange(vector, timeout))
            .await
            .map_err(|_| ClassifierError::Timeout(timeout))??;

        debug!(
            endpoint = %self.endpoint,
            label = %verdict.label,
            confidence = verdict.confidence,
            "Classifier verdict received"
        );
        Ok(verdict)
    }
}

/// Scorer that always answers with the same verdict
#[derive(Debug, Clone)]
pub struct StaticClassifier {
    verdict: ClassificationVerdict,
}

impl StaticClassifier {
    pub fn new(verdict: ClassificationVerdict) -> Self {
        Self { verdict }
    }
}

#[async_trait]
impl Classifier for StaticClassifier {
    fn name(&self) -> &str {
        "static"
    }

    async fn classify(
        &self,
        _vector: &FeatureVector,
        _timeout: Duration,
    ) -> Result<ClassificationVerdict, ClassifierError> {
        Ok(self.verdict.clone())
    }
}
