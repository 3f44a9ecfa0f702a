//! DDoS guard types
//!
//! Source identity, request metadata, classifier verdicts and the persisted
//! detection record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use uuid::Uuid;

use super::decision::{BlockReason, Decision, DecisionPath, Outcome};
use super::features::FeatureVector;

/// Canonical identity of a traffic source.
///
/// IPv6-mapped IPv4 addresses collapse to their IPv4 form so that
/// `::ffff:10.0.0.1` and `10.0.0.1` share one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey(IpAddr);

impl SourceKey {
    pub fn new(addr: IpAddr) -> Self {
        let addr = match addr {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        Self(addr)
    }

    /// Placeholder for requests whose peer address is not known
    pub fn unspecified() -> Self {
        Self(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Parse `1.2.3.4`, `::ffff:1.2.3.4`, `[::1]`, `1.2.3.4:8080` or `[::1]:8080`
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(addr) = raw.parse::<IpAddr>() {
            return Some(Self::new(addr));
        }
        if let Ok(sock) = raw.parse::<SocketAddr>() {
            return Some(Self::new(sock.ip()));
        }
        raw.strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .and_then(|s| s.parse::<IpAddr>().ok())
            .map(Self::new)
    }

    pub fn addr(&self) -> IpAddr {
        self.0
    }

    /// Address as an unsigned integer (32-bit range for IPv4)
    pub fn integer(&self) -> u128 {
        match self.0 {
            IpAddr::V4(v4) => u32::from(v4) as u128,
            IpAddr::V6(v6) => u128::from(v6),
        }
    }
}

impl From<IpAddr> for SourceKey {
    fn from(addr: IpAddr) -> Self {
        Self::new(addr)
    }
}

impl FromStr for SourceKey {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .ok_or_else(|| crate::error::Error::InvalidInput(format!("invalid source address: {}", s)))
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request metadata captured at the edge, before any downstream handling.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Request ID
    pub request_id: String,
    /// Normalized source
    pub source: SourceKey,
    /// Peer port
    pub source_port: Option<u16>,
    /// Local listening port
    pub local_port: Option<u16>,
    /// HTTP method
    pub method: String,
    /// Path
    pub path: String,
    /// HTTP version, e.g. `HTTP/1.1`
    pub http_version: String,
    /// Headers keyed by lowercase name; repeated headers are joined with ", "
    pub headers: BTreeMap<String, String>,
    /// Whether the request arrived over TLS
    pub secure: bool,
    /// Wall-clock arrival time
    pub received_at: DateTime<Utc>,
}

impl RequestMeta {
    pub fn new(source: SourceKey, method: &str, path: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            source,
            source_port: None,
            local_port: None,
            method: method.to_string(),
            path: path.to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: BTreeMap::new(),
            secure: false,
            received_at: Utc::now(),
        }
    }

    /// Add a header, merging repeated names
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.insert_header(name, value);
        self
    }

    pub fn insert_header(&mut self, name: &str, value: &str) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Declared client signature (User-Agent), empty when absent
    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }

    /// Declared body size; absent or unparsable values count as zero
    pub fn content_length(&self) -> u64 {
        self.header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Byte length of the headers serialized as a JSON object
    pub fn headers_length(&self) -> u64 {
        serde_json::to_vec(&self.headers)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }

    /// Approximate on-the-wire size used for volume tracking
    pub fn wire_size(&self) -> u64 {
        self.content_length().saturating_add(self.headers_length())
    }
}

/// Classifier label set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictLabel {
    Benign,
    Ddos,
    Malicious,
    Unknown,
}

impl VerdictLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictLabel::Benign => "benign",
            VerdictLabel::Ddos => "ddos",
            VerdictLabel::Malicious => "malicious",
            VerdictLabel::Unknown => "unknown",
        }
    }

    /// Strict parse of the names accepted in configuration
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "benign" => Some(VerdictLabel::Benign),
            "ddos" => Some(VerdictLabel::Ddos),
            "malicious" => Some(VerdictLabel::Malicious),
            "unknown" => Some(VerdictLabel::Unknown),
            _ => None,
        }
    }

    /// Lenient parse of a scorer's `prediction` string
    pub fn from_prediction(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "benign" | "normal" => VerdictLabel::Benign,
            "ddos" | "dos" => VerdictLabel::Ddos,
            "malicious" | "attack" | "suspicious" => VerdictLabel::Malicious,
            _ => VerdictLabel::Unknown,
        }
    }
}

impl fmt::Display for VerdictLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse risk tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    pub fn from_confidence(confidence: f64) -> Self {
        if confidence > 0.8 {
            RiskLevel::Critical
        } else if confidence > 0.6 {
            RiskLevel::High
        } else if confidence > 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Tier implied by a label and confidence when the scorer gave none
    pub fn derive(label: VerdictLabel, confidence: f64) -> Option<Self> {
        match label {
            VerdictLabel::Ddos | VerdictLabel::Malicious => Some(Self::from_confidence(confidence)),
            VerdictLabel::Benign => Some(RiskLevel::Low),
            VerdictLabel::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Clamp a raw confidence into [0, 1]; NaN becomes 0.
pub fn clamp_confidence(raw: f64) -> f64 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

/// Normalized classifier result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationVerdict {
    pub label: VerdictLabel,
    /// Always within [0, 1]
    pub confidence: f64,
    pub risk_level: Option<RiskLevel>,
    /// Per-class probabilities when the scorer returned them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_probabilities: Vec<f64>,
    /// Produced locally rather than by the scorer
    #[serde(default)]
    pub synthetic: bool,
}

impl ClassificationVerdict {
    /// A missing `risk_level` is derived from the label and clamped confidence.
    pub fn new(label: VerdictLabel, confidence: f64, risk_level: Option<RiskLevel>) -> Self {
        let confidence = match label {
            VerdictLabel::Unknown => 0.0,
            _ => clamp_confidence(confidence),
        };
        Self {
            label,
            confidence,
            risk_level: risk_level.or_else(|| RiskLevel::derive(label, confidence)),
            raw_probabilities: Vec::new(),
            synthetic: false,
        }
    }

    /// Zero-confidence `unknown` verdict used when no score is available
    pub fn unknown() -> Self {
        Self {
            label: VerdictLabel::Unknown,
            confidence: 0.0,
            risk_level: None,
            raw_probabilities: Vec::new(),
            synthetic: true,
        }
    }

    pub fn with_probabilities(mut self, probabilities: Vec<f64>) -> Self {
        self.raw_probabilities = probabilities
            .into_iter()
            .map(clamp_confidence)
            .collect();
        self
    }

    pub fn is_ddos(&self) -> bool {
        self.label == VerdictLabel::Ddos
    }
}

/// Persisted outcome of one evaluated request. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub ip: SourceKey,
    pub features: FeatureVector,
    pub verdict: ClassificationVerdict,
    pub decision: Outcome,
    pub path: DecisionPath,
    pub reason: Option<BlockReason>,
}

impl DetectionRecord {
    pub fn new(ip: SourceKey, features: FeatureVector, decision: Decision) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            ip,
            features,
            verdict: decision.verdict,
            decision: decision.outcome,
            path: decision.path,
            reason: decision.reason,
        }
    }

    /// `prediction` column value
    pub fn prediction(&self) -> &'static str {
        self.verdict.label.as_str()
    }

    pub fn is_ddos(&self) -> bool {
        self.verdict.is_ddos()
    }

    pub fn risk_level(&self) -> Option<&'static str> {
        self.verdict.risk_level.as_ref().map(RiskLevel::as_str)
    }
}
