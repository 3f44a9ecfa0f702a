pub mod ddos;

pub use ddos::{AdmissionGuard, Decision, DetectionRecord, SourceKey};
