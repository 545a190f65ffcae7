//! Health and readiness probes.
//!
//! Serves the kubelet probe endpoints:
//! - `GET /healthz` and `GET /readyz` run every registered check in order
//! - `GET /healthz/{name}` and `GET /readyz/{name}` run a single check
//!
//! A passing probe answers `200 ok`. A failing probe answers `500` with one
//! `[+]name ok` / `[-]name failed: reason` line per check.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{BootstrapError, ManagerError, ProbeError};

/// A single named health or readiness check.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self) -> Result<(), ProbeError>;
}

/// Always passes. Used for `readyz`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

#[async_trait]
impl Checker for Ping {
    async fn check(&self) -> Result<(), ProbeError> {
        Ok(())
    }
}

struct Checks {
    kind: &'static str,
    entries: Vec<(String, Arc<dyn Checker>)>,
}

impl Checks {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    fn add(&mut self, name: &str, checker: Arc<dyn Checker>) -> Result<(), BootstrapError> {
        if self.get(name).is_some() {
            return Err(BootstrapError::DuplicateCheck {
                kind: self.kind,
                name: name.to_string(),
            });
        }
        self.entries.push((name.to_string(), checker));
        Ok(())
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn Checker>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    async fn report(&self) -> Response {
        let mut report = String::new();
        let mut healthy = true;

        for (name, checker) in &self.entries {
            match checker.check().await {
                Ok(()) => {
                    let _ = writeln!(report, "[+]{} ok", name);
                }
                Err(e) => {
                    healthy = false;
                    warn!("{} check {} failed: {}", self.kind, name, e);
                    let _ = writeln!(report, "[-]{} failed: {}", name, e);
                }
            }
        }

        if healthy {
            (StatusCode::OK, "ok").into_response()
        } else {
            let _ = write!(report, "{} check failed", self.kind);
            (StatusCode::INTERNAL_SERVER_ERROR, report).into_response()
        }
    }

    async fn report_one(&self, name: &str) -> Response {
        let Some(checker) = self.get(name) else {
            return (StatusCode::NOT_FOUND, format!("no {} check named {}", self.kind, name)).into_response();
        };
        match checker.check().await {
            Ok(()) => (StatusCode::OK, "ok").into_response(),
            Err(e) => {
                warn!("{} check {} failed: {}", self.kind, name, e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("[-]{} failed: {}", name, e)).into_response()
            }
        }
    }
}

/// Registered `healthz` and `readyz` checks.
pub struct HealthProbes {
    healthz: Checks,
    readyz: Checks,
}

impl Default for HealthProbes {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HealthProbes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProbes")
            .field("healthz", &self.healthz.names())
            .field("readyz", &self.readyz.names())
            .finish()
    }
}

impl HealthProbes {
    pub fn new() -> Self {
        Self {
            healthz: Checks::new("healthz"),
            readyz: Checks::new("readyz"),
        }
    }

    /// Registers a liveness check. Names must be unique.
    pub fn add_healthz(&mut self, name: &str, checker: impl Checker + 'static) -> Result<(), BootstrapError> {
        self.healthz.add(name, Arc::new(checker))
    }

    /// Registers a readiness check. Names must be unique.
    pub fn add_readyz(&mut self, name: &str, checker: impl Checker + 'static) -> Result<(), BootstrapError> {
        self.readyz.add(name, Arc::new(checker))
    }

    pub fn healthz_names(&self) -> Vec<&str> {
        self.healthz.names()
    }

    pub fn readyz_names(&self) -> Vec<&str> {
        self.readyz.names()
    }

    /// Probe routes backed by these checks.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/healthz/{name}", get(healthz_one))
            .route("/readyz", get(readyz))
            .route("/readyz/{name}", get(readyz_one))
            .with_state(self)
    }
}

async fn healthz(State(probes): State<Arc<HealthProbes>>) -> Response {
    probes.healthz.report().await
}

async fn healthz_one(State(probes): State<Arc<HealthProbes>>, Path(name): Path<String>) -> Response {
    probes.healthz.report_one(&name).await
}

async fn readyz(State(probes): State<Arc<HealthProbes>>) -> Response {
    probes.readyz.report().await
}

async fn readyz_one(State(probes): State<Arc<HealthProbes>>, Path(name): Path<String>) -> Response {
    probes.readyz.report_one(&name).await
}

/// Parses a probe bind address.
///
/// `"0"` and `""` disable the endpoint. A bare `":port"` becomes `[::]:port`,
/// which accepts IPv4 and IPv6 on a dual-stack host; see [`bind`].
pub fn parse_bind_address(raw: &str) -> Result<Option<SocketAddr>, BootstrapError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0" {
        return Ok(None);
    }

    let candidate = if raw.starts_with(':') {
        format!("[::]{}", raw)
    } else {
        raw.to_string()
    };

    candidate
        .parse()
        .map(Some)
        .map_err(|_| BootstrapError::ProbeAddress(raw.to_string()))
}

/// Binds the probe listener.
///
/// The IPv6 wildcard falls back to `0.0.0.0` on hosts without IPv6.
pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Err(e) if addr.ip() == IpAddr::V6(Ipv6Addr::UNSPECIFIED) => {
            warn!("Cannot bind {} ({}), falling back to IPv4", addr, e);
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, addr.port())).await
        }
        result => result,
    }
}

/// Serves the probe routes on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, probes: Arc<HealthProbes>, shutdown: CancellationToken) -> Result<(), ManagerError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Starting health probe server on {}", addr);
    }

    let app = probes.router().layer(TraceLayer::new_for_http());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ManagerError::ProbeServer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Failing(&'static str);

    #[async_trait]
    impl Checker for Failing {
        async fn check(&self) -> Result<(), ProbeError> {
            Err(ProbeError::new(self.0))
        }
    }

    async fn get_path(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn probes() -> Arc<HealthProbes> {
        let mut probes = HealthProbes::new();
        probes.add_healthz("config", Failing("kubeconfig changed")).unwrap();
        probes.add_healthz("ping", Ping).unwrap();
        probes.add_readyz("ping", Ping).unwrap();
        Arc::new(probes)
    }

    #[tokio::test]
    async fn test_readyz_passes() {
        let (status, body) = get_path(probes().router(), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_healthz_reports_each_check() {
        let (status, body) = get_path(probes().router(), "/healthz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("[-]config failed: kubeconfig changed"), "body was {body}");
        assert!(body.contains("[+]ping ok"), "body was {body}");
        assert!(body.ends_with("healthz check failed"));
    }

    #[tokio::test]
    async fn test_single_check_routes() {
        let (status, _) = get_path(probes().router(), "/healthz/ping").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get_path(probes().router(), "/healthz/config").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _) = get_path(probes().router(), "/readyz/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_no_checks_is_healthy() {
        let (status, _) = get_path(Arc::new(HealthProbes::new()).router(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_duplicate_check_rejected() {
        let mut probes = HealthProbes::new();
        probes.add_readyz("ping", Ping).unwrap();
        let err = probes.add_readyz("ping", Ping).unwrap_err();
        assert!(matches!(err, BootstrapError::DuplicateCheck { kind: "readyz", .. }));

        // Same name in the other probe is fine.
        probes.add_healthz("ping", Ping).unwrap();
        assert_eq!(probes.healthz_names(), vec!["ping"]);
    }

    #[test]
    fn test_parse_bind_address() {
        assert_eq!(parse_bind_address("0").unwrap(), None);
        assert_eq!(parse_bind_address("").unwrap(), None);
        assert_eq!(
            parse_bind_address(":8081").unwrap(),
            Some("[::]:8081".parse().unwrap())
        );
        assert_eq!(
            parse_bind_address("127.0.0.1:9440").unwrap(),
            Some("127.0.0.1:9440".parse().unwrap())
        );
        assert!(matches!(
            parse_bind_address("localhost"),
            Err(BootstrapError::ProbeAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_wildcard_bind_accepts_loopback() {
        let addr = parse_bind_address(":0").unwrap().unwrap();
        let listener = bind(addr).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Dual-stack or the IPv4 fallback; either way IPv4 loopback connects.
        tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();
        let server = tokio::spawn(serve(listener, probes(), token.clone()));

        token.cancel();
        server.await.unwrap().unwrap();
    }
}
