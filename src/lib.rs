//! # ddos-guard
//!
//! Inline traffic-admission layer for axum services.
//!
//! Each inbound request updates a per-source sliding window, is turned into a
//! feature vector, scored by an external anomaly classifier and then admitted
//! or rejected. Every outcome is persisted best-effort as a detection record.

pub mod config;
pub mod error;
pub mod http_server;
pub mod logging;
pub mod security;

pub use config::{ConfigLoader, GuardConfig, PolicyConfig};
pub use error::{ClassifierError, Error, Result};
pub use security::ddos::AdmissionGuard;
