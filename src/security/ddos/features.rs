//! Feature Extractor
//!
//! Pure transform from request metadata plus a window snapshot into the
//! vector sent to the classifier. Never fails: absent inputs default to zero
//! or empty, and every float is finite.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;

use super::tracker::WindowSnapshot;
use super::types::RequestMeta;
use crate::config::PayloadSchema;

/// Headers whose presence marks a proxied request
const PROXY_HEADERS: &[&str] = &["x-forwarded-for", "x-real-ip", "forwarded", "via"];

/// IANA protocol number reported for HTTP traffic
const IP_PROTO_TCP: u8 = 6;

/// Reported when no processing time has elapsed yet
const DEFAULT_REQUEST_DURATION: f64 = 0.05;

/// No geolocation database is consulted
const UNKNOWN_GEO: &str = "Unknown";

/// Immutable per-request feature snapshot. Field names are the wire names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// IPv4 as its 32-bit value; IPv6 as its upper 64 bits (the /64 network)
    pub source_ip: u64,
    pub src_port: u16,
    pub dst_port: u16,
    pub day_of_week: u8,
    pub hour_of_day: u8,
    pub http_method: String,
    pub url_path: String,
    pub user_agent: String,
    pub content_length: u64,
    /// Seconds between arrival and extraction
    pub request_duration: f64,
    pub http_version: String,
    pub num_headers: u32,
    pub headers_length: u64,
    pub is_proxy: u8,
    pub cookie_present: u8,
    pub req_rate_1min: u64,
    pub req_per_second: f64,
    pub bytes_in_window: u64,
    pub request_interval: f64,
    pub ua_variance: f64,
    pub tls_version: String,
    pub protocol: String,
    pub geo_location: String,
    /// `mobile`, `tablet`, `smarttv`, `console`, `bot` or `desktop`
    pub device_type: String,
    /// Extraction time, RFC 3339 on the wire
    pub timestamp: DateTime<Utc>,
}

/// Zero for NaN and infinities
fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn source_integer(request: &RequestMeta) -> u64 {
    match request.source.addr() {
        IpAddr::V4(v4) => u64::from(u32::from(v4)),
        IpAddr::V6(v6) => (u128::from(v6) >> 64) as u64,
    }
}

/// Coarse device class from the user agent
fn device_type(user_agent: &str) -> &'static str {
    let ua = user_agent.to_ascii_lowercase();
    if ua.contains("bot") || ua.contains("spider") || ua.contains("crawl") {
        "bot"
    } else if ua.contains("ipad") || ua.contains("tablet") {
        "tablet"
    } else if ua.contains("mobi") || ua.contains("iphone") || ua.contains("android") {
        "mobile"
    } else if ua.contains("smart-tv") || ua.contains("smarttv") {
        "smarttv"
    } else if ua.contains("playstation") || ua.contains("xbox") || ua.contains("nintendo") {
        "console"
    } else {
        "desktop"
    }
}

fn request_duration(request: &RequestMeta, now: DateTime<Utc>) -> f64 {
    let elapsed = (now - request.received_at)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    if elapsed > 0.0 && elapsed.is_finite() {
        elapsed
    } else {
        DEFAULT_REQUEST_DURATION
    }
}

/// Build the feature vector using the request's arrival time
pub fn extract(request: &RequestMeta, snapshot: &WindowSnapshot) -> FeatureVector {
    extract_at(request, snapshot, request.received_at)
}

/// Build the feature vector with an explicit wall-clock time
pub fn extract_at(
    request: &RequestMeta,
    snapshot: &WindowSnapshot,
    now: DateTime<Utc>,
) -> FeatureVector {
    let span_secs = snapshot.window_span.as_secs_f64();
    let req_per_second = if span_secs > 0.0 {
        finite_or_zero(snapshot.request_count as f64 / span_secs)
    } else {
        0.0
    };

    let request_interval = snapshot
        .since_previous
        .map(|d| finite_or_zero(d.as_secs_f64()))
        .unwrap_or(0.0);

    let is_proxy = PROXY_HEADERS
        .iter()
        .any(|name| request.headers.contains_key(*name));

    FeatureVector {
        source_ip: source_integer(request),
        src_port: request.source_port.unwrap_or(0),
        dst_port: request.local_port.unwrap_or(0),
        day_of_week: now.weekday().num_days_from_sunday() as u8,
        hour_of_day: now.hour() as u8,
        http_method: request.method.clone(),
        url_path: request.path.clone(),
        user_agent: request.user_agent().to_string(),
        content_length: request.content_length(),
        request_duration: request_duration(request, now),
        http_version: request.http_version.clone(),
        num_headers: request.headers.len() as u32,
        headers_length: request.headers_length(),
        is_proxy: is_proxy as u8,
        cookie_present: request.headers.contains_key("cookie") as u8,
        req_rate_1min: snapshot.request_count,
        req_per_second,
        bytes_in_window: snapshot.bytes_in_window,
        request_interval,
        ua_variance: finite_or_zero(snapshot.signature_variance),
        tls_version: if request.secure { "TLS" } else { "None" }.to_string(),
        protocol: if request.secure { "https" } else { "http" }.to_string(),
        geo_location: UNKNOWN_GEO.to_string(),
        device_type: device_type(request.user_agent()).to_string(),
        timestamp: now,
    }
}

impl FeatureVector {
    /// JSON body for the scorer in the configured layout
    pub fn to_payload(&self, schema: PayloadSchema) -> Value {
        match schema {
            PayloadSchema::Http => serde_json::to_value(self).unwrap_or(Value::Null),
            PayloadSchema::Packet => json!({
                "Packets": self.req_rate_1min,
                "Bytes": self.bytes_in_window,
                "Tx Packets": self.req_rate_1min,
                "Tx Bytes": self.bytes_in_window,
                "Rx Packets": 0,
                "Rx Bytes": 0,
                "tcp.srcport": self.src_port,
                "tcp.dstport": self.dst_port,
                "ip.proto": IP_PROTO_TCP,
                "frame.len": self.content_length.saturating_add(self.headers_length),
            }),
        }
    }
}
