//! Decision Engine
//!
//! Turns a classifier result into an admission decision.
//!
//! ```text
//! Pending --verdict--> Scored ----> Allowed | Blocked
//! Pending --error----> Degraded --> Allowed (fail-open) | Blocked (fail-closed)
//! Pending --ceiling--> Blocked
//! ```
//!
//! With blocking disabled every would-be block is admitted instead, keeping
//! its [`BlockReason`] so the detection record still shows what was flagged.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::tracker::WindowSnapshot;
use super::types::{ClassificationVerdict, VerdictLabel};
use crate::config::{FailMode, PolicyConfig};
use crate::error::ClassifierError;

/// Terminal admission outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Allowed,
    Blocked,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Blocked => "blocked",
        }
    }
}

/// How the decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPath {
    /// The classifier answered in time
    Scored,
    /// The classifier was unavailable and the fail mode applied
    Degraded,
    /// Hard per-window ceiling tripped before scoring
    RateCeiling,
}

impl DecisionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionPath::Scored => "scored",
            DecisionPath::Degraded => "degraded",
            DecisionPath::RateCeiling => "rate_ceiling",
        }
    }
}

/// Why a request was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Classifier labelled the source as a volumetric attack
    VolumeAttack,
    /// Classifier flagged the source with a non-volumetric attack label
    ClassifierFlagged,
    /// In-window request count exceeded the configured ceiling
    RateCeiling,
    /// Fail-closed while the classifier was unavailable
    ClassifierUnavailable,
}

impl BlockReason {
    pub fn status_code(&self) -> u16 {
        match self {
            BlockReason::VolumeAttack | BlockReason::RateCeiling => 429,
            BlockReason::ClassifierFlagged | BlockReason::ClassifierUnavailable => 403,
        }
    }

    /// Short error title for the block response
    pub fn error(&self) -> &'static str {
        match self.status_code() {
            429 => "Request blocked",
            _ => "Access denied",
        }
    }

    /// Human readable reason for the block response
    pub fn message(&self) -> &'static str {
        match self {
            BlockReason::VolumeAttack => "Potential DDoS activity detected",
            BlockReason::ClassifierFlagged => "Suspicious traffic pattern detected",
            BlockReason::RateCeiling => "Request rate limit exceeded",
            BlockReason::ClassifierUnavailable => "Traffic classifier unavailable",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::VolumeAttack => "volume_attack",
            BlockReason::ClassifierFlagged => "classifier_flagged",
            BlockReason::RateCeiling => "rate_ceiling",
            BlockReason::ClassifierUnavailable => "classifier_unavailable",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intermediate state after the classifier call returned or failed
#[derive(Debug, Clone)]
pub enum DecisionState {
    Scored(ClassificationVerdict),
    Degraded(ClassifierError),
}

/// Terminal decision for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub outcome: Outcome,
    pub path: DecisionPath,
    pub verdict: ClassificationVerdict,
    pub reason: Option<BlockReason>,
}

impl Decision {
    fn allowed(path: DecisionPath, verdict: ClassificationVerdict) -> Self {
        Self {
            outcome: Outcome::Allowed,
            path,
            verdict,
            reason: None,
        }
    }

    fn blocked(path: DecisionPath, verdict: ClassificationVerdict, reason: BlockReason) -> Self {
        Self {
            outcome: Outcome::Blocked,
            path,
            verdict,
            reason: Some(reason),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allowed
    }

    /// Flagged but admitted because blocking is disabled
    pub fn is_monitored(&self) -> bool {
        self.is_allowed() && self.reason.is_some()
    }

    /// HTTP status of the block response, `None` when allowed
    pub fn status_code(&self) -> Option<u16> {
        if self.is_allowed() {
            return None;
        }
        self.reason.map(|reason| reason.status_code())
    }
}

/// Stateless policy evaluator
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    confidence_threshold: f64,
    attack_labels: HashSet<VerdictLabel>,
    fail_mode: FailMode,
    max_requests_per_window: Option<u64>,
    block_on_detection: bool,
}

impl DecisionEngine {
    pub fn new(policy: &PolicyConfig) -> Self {
        Self {
            confidence_threshold: policy.confidence_threshold,
            attack_labels: policy.attack_labels.clone(),
            fail_mode: policy.fail_mode,
            max_requests_per_window: policy.max_requests_per_window,
            block_on_detection: policy.block_on_detection,
        }
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    /// Downgrade a block to a monitored admission when blocking is disabled
    fn enforce(&self, decision: Decision) -> Decision {
        if self.block_on_detection || decision.is_allowed() {
            return decision;
        }
        Decision {
            outcome: Outcome::Allowed,
            ..decision
        }
    }

    /// Block before scoring when the in-window count exceeds the ceiling
    pub fn rate_ceiling(&self, snapshot: &WindowSnapshot) -> Option<Decision> {
        let ceiling = self.max_requests_per_window?;
        (snapshot.request_count > ceiling).then(|| {
            self.enforce(Decision::blocked(
                DecisionPath::RateCeiling,
                ClassificationVerdict::unknown(),
                BlockReason::RateCeiling,
            ))
        })
    }

    /// Pending -> Scored | Degraded
    pub fn score(&self, result: Result<ClassificationVerdict, ClassifierError>) -> DecisionState {
        match result {
            Ok(verdict) => DecisionState::Scored(verdict),
            Err(err) => DecisionState::Degraded(err),
        }
    }

    /// Scored | Degraded -> Allowed | Blocked
    pub fn resolve(&self, state: DecisionState) -> Decision {
        let decision = match state {
            DecisionState::Scored(verdict) => {
                let flagged = self.attack_labels.contains(&verdict.label)
                    && verdict.confidence >= self.confidence_threshold;
                if !flagged {
                    Decision::allowed(DecisionPath::Scored, verdict)
                } else {
                    let reason = match verdict.label {
                        VerdictLabel::Ddos => BlockReason::VolumeAttack,
                        _ => BlockReason::ClassifierFlagged,
                    };
                    Decision::blocked(DecisionPath::Scored, verdict, reason)
                }
            }
            DecisionState::Degraded(_) => match self.fail_mode {
                FailMode::Open => {
                    Decision::allowed(DecisionPath::Degraded, ClassificationVerdict::unknown())
                }
                FailMode::Closed => Decision::blocked(
                    DecisionPath::Degraded,
                    ClassificationVerdict::unknown(),
                    BlockReason::ClassifierUnavailable,
                ),
            },
        };
        self.enforce(decision)
    }

    pub fn decide(&self, result: Result<ClassificationVerdict, ClassifierError>) -> Decision {
        self.resolve(self.score(result))
    }
}
