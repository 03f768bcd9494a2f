use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, Uri};
use http_body_util::Full;
use log::debug;
use serde::Serialize;

use crate::http_client::HttpsClient;

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide counters backing `/api/stats`. All atomic; no locking on
/// the per-tunnel paths.
#[derive(Debug, Default)]
pub struct ServerStats {
    active_tunnels: AtomicU64,
    total_tunnels: AtomicU64,
    uplink_bytes: AtomicU64,
    downlink_bytes: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tunnel_opened(&self) {
        self.active_tunnels.fetch_add(1, Ordering::Relaxed);
        self.total_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self, uplink: u64, downlink: u64) {
        self.active_tunnels.fetch_sub(1, Ordering::Relaxed);
        self.uplink_bytes.fetch_add(uplink, Ordering::Relaxed);
        self.downlink_bytes.fetch_add(downlink, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "activeTunnels": self.active_tunnels.load(Ordering::Relaxed),
            "totalTunnels": self.total_tunnels.load(Ordering::Relaxed),
            "uplinkBytes": self.uplink_bytes.load(Ordering::Relaxed),
            "downlinkBytes": self.downlink_bytes.load(Ordering::Relaxed),
        })
    }
}

/// One tunnel's traffic totals, as reported to the node collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficReport {
    pub uuid: String,
    pub uplink: u64,
    pub downlink: u64,
}

/// POSTs `{uuid, uplink, downlink}` to the configured endpoint with an
/// optional bearer token. Failures never propagate past a debug log.
pub struct StatsReporter {
    client: HttpsClient,
    endpoint: Uri,
    token: Option<String>,
}

impl StatsReporter {
    pub fn new(
        client: HttpsClient,
        endpoint: &str,
        token: Option<String>,
    ) -> std::io::Result<Self> {
        let endpoint: Uri = endpoint.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid stats endpoint: {}", e),
            )
        })?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    pub async fn report(&self, report: &TrafficReport) {
        let body = match serde_json::to_vec(report) {
            Ok(body) => body,
            Err(e) => {
                debug!("stats report serialization failed: {}", e);
                return;
            }
        };

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len());
        if let Some(ref token) = self.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match builder.body(Full::new(Bytes::from(body))) {
            Ok(request) => request,
            Err(e) => {
                debug!("stats report build failed: {}", e);
                return;
            }
        };

        match tokio::time::timeout(REPORT_TIMEOUT, self.client.request(request)).await {
            Ok(Ok(response)) if response.status().is_success() => {}
            Ok(Ok(response)) => {
                debug!("stats endpoint returned {}", response.status());
            }
            Ok(Err(e)) => {
                debug!("stats report failed: {}", e);
            }
            Err(_) => {
                debug!("stats report timed out");
            }
        }
    }
}

/// Fire-and-forget: hand the report to a background task and move on.
pub fn spawn_report(reporter: Option<Arc<StatsReporter>>, report: TrafficReport) {
    let Some(reporter) = reporter else {
        return;
    };
    if report.uplink == 0 && report.downlink == 0 {
        return;
    }
    tokio::spawn(async move {
        reporter.report(&report).await;
    });
}
