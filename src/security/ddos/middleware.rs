//! Axum admission middleware
//!
//! Allowed requests continue with the [`ClassificationVerdict`] stored in
//! their extensions. Blocked requests are answered directly with 429 or 403.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use super::decision::{BlockReason, Decision};
use super::guard::AdmissionGuard;
use super::types::{ClassificationVerdict, RequestMeta, SourceKey};

/// Body of a block response
#[derive(Debug, Clone, Serialize)]
pub struct BlockResponse {
    pub error: String,
    pub reason: String,
    pub confidence: f64,
    #[serde(skip)]
    status: StatusCode,
}

impl BlockResponse {
    pub fn new(reason: BlockReason, confidence: f64) -> Self {
        let status = match reason.status_code() {
            429 => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::FORBIDDEN,
        };
        Self {
            error: reason.error().to_string(),
            reason: reason.message().to_string(),
            confidence,
            status,
        }
    }

    /// `None` for admitted requests, including monitored ones
    pub fn from_decision(decision: &Decision) -> Option<Self> {
        if decision.is_allowed() {
            return None;
        }
        decision
            .reason
            .map(|reason| Self::new(reason, decision.verdict.confidence))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for BlockResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Middleware entry point, used with `axum::middleware::from_fn_with_state`
pub async fn admission_middleware(
    State(guard): State<Arc<AdmissionGuard>>,
    mut request: Request,
    next: Next,
) -> Response {
    if guard.is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let meta = request_meta(&request, guard.policy().trust_forwarded_for);
    let decision = guard.evaluate(&meta).await;

    match BlockResponse::from_decision(&decision) {
        Some(block) => block.into_response(),
        None => {
            request.extensions_mut().insert(decision.verdict);
            next.run(request).await
        }
    }
}

/// First parsable `X-Forwarded-For` entry
fn forwarded_source(headers: &HeaderMap) -> Option<SourceKey> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .and_then(SourceKey::parse)
}

/// Port from the `Host` header, or the scheme default
fn local_port(request: &Request, secure: bool) -> Option<u16> {
    let from_host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|host| host.rsplit_once(':'))
        .and_then(|(_, port)| port.parse::<u16>().ok());

    from_host
        .or_else(|| request.uri().port_u16())
        .or(Some(if secure { 443 } else { 80 }))
}

/// Capture request metadata before the body is touched
pub fn request_meta(request: &Request, trust_forwarded_for: bool) -> RequestMeta {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let source = trust_forwarded_for
        .then(|| forwarded_source(request.headers()))
        .flatten()
        .or_else(|| peer.map(|addr| SourceKey::new(addr.ip())))
        .unwrap_or_else(SourceKey::unspecified);

    let forwarded_https = trust_forwarded_for
        && request
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
    let secure = request.uri().scheme_str() == Some("https") || forwarded_https;

    let mut meta = RequestMeta::new(source, request.method().as_str(), request.uri().path());
    meta.source_port = peer.map(|addr| addr.port());
    meta.local_port = local_port(request, secure);
    meta.http_version = format!("{:?}", request.version());
    meta.secure = secure;
    for (name, value) in request.headers() {
        meta.insert_header(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
    }
    meta
}

/// Access to the verdict attached by the middleware
pub trait VerdictExt {
    fn verdict(&self) -> Option<&ClassificationVerdict>;
}

impl<B> VerdictExt for axum::http::Request<B> {
    fn verdict(&self) -> Option<&ClassificationVerdict> {
        self.extensions().get::<ClassificationVerdict>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::security::ddos::classifier::StaticClassifier;
    use crate::security::ddos::sink::{MemoryRecordStore, RecordSink};
    use crate::security::ddos::types::VerdictLabel;
    use axum::http::Request as HttpRequest;
    use axum::{body::Body, middleware, routing::get, Router};
    use tower::ServiceExt;

    async fn echo_label(request: Request) -> String {
        request
            .verdict()
            .map(|v| v.label.to_string())
            .unwrap_or_else(|| "none".to_string())
    }

    fn app(
        policy: PolicyConfig,
        verdict: ClassificationVerdict,
    ) -> (Router, Arc<AdmissionGuard>, Arc<MemoryRecordStore>) {
        let store = Arc::new(MemoryRecordStore::new());
        let sink = Arc::new(RecordSink::spawn(store.clone(), 64));
        let guard = Arc::new(AdmissionGuard::new(
            policy,
            Arc::new(StaticClassifier::new(verdict)),
            sink,
        ));
        let router = Router::new()
            .route("/", get(echo_label))
            .route("/health", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                guard.clone(),
                admission_middleware,
            ));
        (router, guard, store)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_request_carries_verdict() {
        let (app, guard, store) = app(
            PolicyConfig::default(),
            ClassificationVerdict::new(VerdictLabel::Benign, 0.1, None),
        );

        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"benign");

        guard.sink().shutdown().await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_ddos_verdict_blocked_with_429() {
        let (app, _, _) = app(
            PolicyConfig::default(),
            ClassificationVerdict::new(VerdictLabel::Ddos, 0.95, None),
        );

        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = body_json(response).await;
        assert_eq!(body["confidence"], 0.95);
        assert_eq!(body["error"], "Request blocked");
        assert!(body["reason"].is_string());
    }

    #[tokio::test]
    async fn test_malicious_verdict_blocked_with_403() {
        let (app, _, _) = app(
            PolicyConfig::default(),
            ClassificationVerdict::new(VerdictLabel::Malicious, 0.9, None),
        );

        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"], "Access denied");
    }

    #[tokio::test]
    async fn test_monitor_mode_passes_flagged_request() {
        let mut policy = PolicyConfig::default();
        policy.block_on_detection = false;
        let (app, guard, store) = app(
            policy,
            ClassificationVerdict::new(VerdictLabel::Ddos, 0.95, None),
        );

        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"ddos");

        guard.sink().shutdown().await;
        assert!(store.records()[0].reason.is_some());
    }

    #[tokio::test]
    async fn test_exempt_path_bypasses_guard() {
        let (app, guard, store) = app(
            PolicyConfig::default(),
            ClassificationVerdict::new(VerdictLabel::Ddos, 1.0, None),
        );

        let response = app
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        guard.sink().shutdown().await;
        assert!(store.is_empty());
        assert_eq!(guard.tracker().tracked_sources(), 0);
    }

    #[tokio::test]
    async fn test_forwarded_for_only_when_trusted() {
        let mut policy = PolicyConfig::default();
        policy.trust_forwarded_for = true;
        let (app, guard, store) = app(
            policy,
            ClassificationVerdict::new(VerdictLabel::Benign, 0.1, None),
        );

        let request = HttpRequest::builder()
            .uri("/")
            .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap();

        guard.sink().shutdown().await;
        assert_eq!(store.records()[0].ip.to_string(), "203.0.113.7");
        assert_eq!(store.records()[0].features.is_proxy, 1);
    }

    #[test]
    fn test_request_meta_from_connect_info() {
        let mut request = HttpRequest::builder()
            .method("POST")
            .uri("/login")
            .header("Host", "example.com:8443")
            .header("User-Agent", "curl/8.0")
            .header("X-Forwarded-For", "198.51.100.1")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo("192.0.2.10:51000".parse::<SocketAddr>().unwrap()));

        let meta = request_meta(&request, false);
        assert_eq!(meta.source.to_string(), "192.0.2.10");
        assert_eq!(meta.source_port, Some(51000));
        assert_eq!(meta.local_port, Some(8443));
        assert_eq!(meta.method, "POST");
        assert_eq!(meta.path, "/login");
        assert_eq!(meta.http_version, "HTTP/1.1");
        assert_eq!(meta.user_agent(), "curl/8.0");
        assert!(!meta.secure);
    }
}
