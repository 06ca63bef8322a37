//! Health probe logic.
//!
//! One probe combines three checks: is the service process active, does
//! the health endpoint answer 2xx within the timeout, and is the host under
//! resource pressure. Only the first two decide the verdict.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use reforge_core::config::HealthConfig;
use reforge_core::{
    BoxFuture, DeploymentState, HealthEndpoint, HealthVerdict, ProbeFailureKind, Prober,
    ServiceControl,
};

use crate::resources::{ResourceSampler, ResourceThresholds, ResourceUsage, SystemSampler};

/// Result of the HTTP part of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HttpOutcome {
    /// The health endpoint returned 2xx.
    Ok { status: u16 },
    /// A response arrived but it was not 2xx.
    BadStatus { status: u16 },
    /// No response: connection error, handshake error, or timeout.
    Unreachable,
}

/// Everything one probe observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub process_active: bool,
    pub http: HttpOutcome,
    pub resources: Option<ResourceUsage>,
    /// Critical and advisory failures alike.
    pub failures: BTreeSet<ProbeFailureKind>,
}

impl ProbeReport {
    /// Assemble a report; failures are derived from the observations.
    pub fn new(
        process_active: bool,
        http: HttpOutcome,
        resources: Option<ResourceUsage>,
        thresholds: &ResourceThresholds,
    ) -> Self {
        let mut failures = BTreeSet::new();
        if !process_active {
            failures.insert(ProbeFailureKind::ProcessNotRunning);
        }
        match http {
            HttpOutcome::Ok { .. } => {}
            HttpOutcome::BadStatus { .. } => {
                failures.insert(ProbeFailureKind::HttpBadStatus);
            }
            HttpOutcome::Unreachable => {
                failures.insert(ProbeFailureKind::HttpUnreachable);
            }
        }
        if let Some(usage) = &resources {
            failures.extend(thresholds.breaches(usage));
        }
        Self {
            process_active,
            http,
            resources,
            failures,
        }
    }

    pub fn verdict(&self) -> HealthVerdict {
        HealthVerdict::from_failures(&self.failures)
    }

    /// Failures that were reported but do not affect the verdict.
    pub fn advisories(&self) -> impl Iterator<Item = ProbeFailureKind> + '_ {
        self.failures.iter().copied().filter(|f| f.is_advisory())
    }
}

/// Point-in-time health judgment for the supervised deployment.
pub struct HealthProbe {
    service: Arc<dyn ServiceControl>,
    endpoint: HealthEndpoint,
    timeout: Duration,
    thresholds: ResourceThresholds,
    sampler: Arc<dyn ResourceSampler>,
    volume: PathBuf,
}

impl HealthProbe {
    /// Create a probe for `state` using the host resource sampler.
    pub fn new(service: Arc<dyn ServiceControl>, state: &DeploymentState, config: &HealthConfig) -> Self {
        Self {
            service,
            endpoint: state.health_endpoint.clone(),
            timeout: config.timeout,
            thresholds: ResourceThresholds::from(config),
            sampler: Arc::new(SystemSampler),
            volume: state.root.clone(),
        }
    }

    /// Replace the resource sampler.
    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Run all checks and return the full report.
    pub async fn inspect(&self) -> ProbeReport {
        let process_active = match self.service.is_active().await {
            Ok(active) => active,
            Err(e) => {
                warn!(service = self.service.name(), error = %e, "process check failed");
                false
            }
        };

        let http = http_probe(self.endpoint.url(), self.timeout).await;

        let resources = match self.sampler.sample(&self.volume) {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!(volume = ?self.volume, error = %e, "resource sampling failed");
                None
            }
        };

        let report = ProbeReport::new(process_active, http, resources, &self.thresholds);

        for advisory in report.advisories() {
            warn!(service = self.service.name(), %advisory, resources = ?report.resources, "resource advisory");
        }
        match report.verdict() {
            HealthVerdict::Healthy => {
                debug!(service = self.service.name(), endpoint = %self.endpoint, "probe healthy");
            }
            verdict => {
                info!(service = self.service.name(), endpoint = %self.endpoint, %verdict, "probe unhealthy");
            }
        }
        report
    }
}

impl Prober for HealthProbe {
    fn probe(&self) -> BoxFuture<'_, HealthVerdict> {
        Box::pin(async move { self.inspect().await.verdict() })
    }
}

/// Perform an HTTP GET against a plain `http://` URL.
///
/// Returns `Ok` for 2xx, `BadStatus` for any other response, and
/// `Unreachable` if no response arrives within `timeout`.
pub async fn http_probe(url: &str, timeout: Duration) -> HttpOutcome {
    let uri: http::Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            debug!(error = %e, %url, "health probe url invalid");
            return HttpOutcome::Unreachable;
        }
    };
    let Some(authority) = uri.authority().cloned() else {
        debug!(%url, "health probe url has no host");
        return HttpOutcome::Unreachable;
    };
    let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %url, "health probe connection failed");
                return HttpOutcome::Unreachable;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %url, "health probe handshake failed");
                return HttpOutcome::Unreachable;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&path)
            .header("host", authority.as_str())
            .header("user-agent", concat!("reforge-health/", env!("CARGO_PKG_VERSION")))
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %url, "health probe request invalid");
                return HttpOutcome::Unreachable;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if resp.status().is_success() {
                    HttpOutcome::Ok { status }
                } else {
                    debug!(status, %url, "health probe non-2xx");
                    HttpOutcome::BadStatus { status }
                }
            }
            Err(e) => {
                debug!(error = %e, %url, "health probe request failed");
                HttpOutcome::Unreachable
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%url, ?timeout, "health probe timed out");
            HttpOutcome::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use reforge_core::testing::ScriptedService;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FixedSampler(ResourceUsage);

    impl ResourceSampler for FixedSampler {
        fn sample(&self, _volume: &Path) -> std::io::Result<ResourceUsage> {
            Ok(self.0)
        }
    }

    struct BrokenSampler;

    impl ResourceSampler for BrokenSampler {
        fn sample(&self, _volume: &Path) -> std::io::Result<ResourceUsage> {
            Err(std::io::Error::other("no /proc"))
        }
    }

    /// Serve `status` to every connection; returns the base URL.
    async fn responder(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let resp = format!(
                        "HTTP/1.1 {status}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/health")
    }

    /// Accepts connections but never answers.
    async fn black_hole() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}/health")
    }

    fn calm() -> ResourceUsage {
        ResourceUsage {
            load_avg_5m: 0.5,
            memory_percent: 30.0,
            disk_percent: 20.0,
        }
    }

    fn stressed() -> ResourceUsage {
        ResourceUsage {
            load_avg_5m: 40.0,
            memory_percent: 99.0,
            disk_percent: 97.0,
        }
    }

    fn probe_for(url: &str, service: ScriptedService, usage: ResourceUsage) -> HealthProbe {
        let state = DeploymentState::new(
            Path::new("/tmp"),
            Path::new("VERSION"),
            HealthEndpoint::new(url),
        );
        let config = HealthConfig {
            timeout: Duration::from_millis(300),
            ..HealthConfig::default()
        };
        HealthProbe::new(Arc::new(service), &state, &config)
            .with_sampler(Arc::new(FixedSampler(usage)))
    }

    #[tokio::test]
    async fn http_probe_ok_on_2xx() {
        let url = responder("200 OK").await;
        assert_eq!(
            http_probe(&url, Duration::from_secs(2)).await,
            HttpOutcome::Ok { status: 200 }
        );
    }

    #[tokio::test]
    async fn http_probe_bad_status_on_5xx() {
        let url = responder("503 Service Unavailable").await;
        assert_eq!(
            http_probe(&url, Duration::from_secs(2)).await,
            HttpOutcome::BadStatus { status: 503 }
        );
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_is_unreachable() {
        let result = http_probe("http://127.0.0.1:1/health", Duration::from_millis(200)).await;
        assert_eq!(result, HttpOutcome::Unreachable);
    }

    #[tokio::test]
    async fn http_probe_timeout_is_unreachable() {
        let url = black_hole().await;
        let result = http_probe(&url, Duration::from_millis(100)).await;
        assert_eq!(result, HttpOutcome::Unreachable);
    }

    #[tokio::test]
    async fn http_probe_rejects_garbage_url() {
        assert_eq!(
            http_probe("not a url", Duration::from_millis(100)).await,
            HttpOutcome::Unreachable
        );
    }

    #[tokio::test]
    async fn healthy_service_under_pressure_stays_healthy() {
        let url = responder("200 OK").await;
        let probe = probe_for(&url, ScriptedService::new(), stressed());

        let report = probe.inspect().await;
        assert_eq!(report.verdict(), HealthVerdict::Healthy);
        assert_eq!(report.advisories().count(), 3);
    }

    #[tokio::test]
    async fn inactive_process_is_unhealthy() {
        let url = responder("200 OK").await;
        let probe = probe_for(&url, ScriptedService::new().inactive(), calm());

        match probe.probe().await {
            HealthVerdict::Unhealthy { reasons } => {
                assert!(reasons.contains(&ProbeFailureKind::ProcessNotRunning));
            }
            other => panic!("expected unhealthy, got {other}"),
        }
    }

    #[tokio::test]
    async fn sampling_failure_adds_no_advisory() {
        let url = responder("200 OK").await;
        let probe = probe_for(&url, ScriptedService::new(), calm())
            .with_sampler(Arc::new(BrokenSampler));

        let report = probe.inspect().await;
        assert!(report.resources.is_none());
        assert!(report.failures.is_empty());
        assert!(report.verdict().is_healthy());
    }
}
