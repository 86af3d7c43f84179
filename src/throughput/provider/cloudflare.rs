use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::Mutex;

use super::{
    mbps, ProviderKind, ProviderMeta, ServerInfo, SpeedTestProvider, SpeedTestRequest,
    SpeedTestResult, CLOUDFLARE,
};
use crate::config::CloudflareConfig;

/// Bandwidth test against the Cloudflare speed edge (`/__down`, `/__up`).
///
/// The HTTP engine is created on first use. If creating it fails (edge
/// unreachable, TLS error) the run fails and the next run tries again; a
/// working engine is reused for the life of the process.
pub struct CloudflareProvider {
    config: CloudflareConfig,
    engine: Mutex<Option<Arc<Engine>>>,
}

struct Engine {
    client: reqwest::Client,
    /// Edge location reported during warm-up, e.g. `AMS`.
    colo: Option<String>,
}

impl Engine {
    async fn init(config: &CloudflareConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bandwatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        let resp = client
            .get(down_url(&config.base_url, 0))
            .send()
            .await
            .context("cloudflare speed edge unreachable")?
            .error_for_status()
            .context("cloudflare speed edge rejected warm-up")?;

        let colo = resp
            .headers()
            .get("cf-ray")
            .and_then(|v| v.to_str().ok())
            .and_then(colo_from_ray);

        tracing::info!(colo = ?colo, "cloudflare engine ready");
        Ok(Self { client, colo })
    }
}

impl CloudflareProvider {
    pub fn new(config: CloudflareConfig) -> Self {
        Self {
            config,
            engine: Mutex::new(None),
        }
    }

    async fn engine(&self) -> Result<Arc<Engine>> {
        let mut slot = self.engine.lock().await;
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        let engine = Arc::new(Engine::init(&self.config).await?);
        *slot = Some(engine.clone());
        Ok(engine)
    }
}

fn down_url(base: &str, bytes: u64) -> String {
    format!("{}/__down?bytes={}", base.trim_end_matches('/'), bytes)
}

fn up_url(base: &str) -> String {
    format!("{}/__up", base.trim_end_matches('/'))
}

/// `cf-ray` values look like `8c1d2e3f4a5b6c7d-AMS`.
fn colo_from_ray(ray: &str) -> Option<String> {
    let (_, colo) = ray.rsplit_once('-')?;
    if colo.is_empty() {
        return None;
    }
    Some(colo.to_string())
}

/// Median latency and mean absolute difference between consecutive samples.
fn latency_stats(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    let jitter = if samples.len() < 2 {
        0.0
    } else {
        let total: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        total / (samples.len() - 1) as f64
    };
    (median, jitter)
}

fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    mbps(bytes as f64 * 8.0 / secs)
}

#[async_trait::async_trait]
impl SpeedTestProvider for CloudflareProvider {
    fn meta(&self) -> ProviderMeta {
        ProviderMeta {
            name: CLOUDFLARE,
            display_name: "Cloudflare",
            kind: ProviderKind::PublicWAN,
            requires_host: false,
            description: "Download and upload against the nearest Cloudflare edge.",
            install_hint: "No installation needed; requires outbound HTTPS.",
        }
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn run(&self, req: &SpeedTestRequest) -> Result<SpeedTestResult> {
        let engine = self.engine().await?;
        let client = &engine.client;
        let base = &self.config.base_url;

        let mut samples = Vec::with_capacity(self.config.latency_samples as usize);
        for _ in 0..self.config.latency_samples {
            let start = Instant::now();
            client
                .get(down_url(base, 0))
                .timeout(req.timeout)
                .send()
                .await
                .context("latency check failed")?
                .error_for_status()?
                .bytes()
                .await?;
            samples.push(start.elapsed().as_secs_f64() * 1000.0);
        }
        let (ping, jitter) = latency_stats(&samples);

        let start = Instant::now();
        let body = client
            .get(down_url(base, self.config.download_bytes))
            .timeout(req.timeout)
            .send()
            .await
            .context("download request failed")?
            .error_for_status()?
            .bytes()
            .await
            .context("download interrupted")?;
        let received = body.len() as u64;
        let download = throughput_mbps(received, start.elapsed());

        let payload = vec![0u8; self.config.upload_bytes as usize];
        let start = Instant::now();
        client
            .post(up_url(base))
            .timeout(req.timeout)
            .body(payload)
            .send()
            .await
            .context("upload request failed")?
            .error_for_status()?;
        let upload = throughput_mbps(self.config.upload_bytes, start.elapsed());

        tracing::debug!(download, upload, ping, "cloudflare test finished");

        Ok(SpeedTestResult {
            server: ServerInfo {
                name: "Cloudflare".to_string(),
                url: base.clone(),
            },
            bytes_sent: self.config.upload_bytes as i64,
            bytes_received: received as i64,
            ping,
            jitter,
            upload,
            download,
            raw: Some(json!({
                "colo": engine.colo,
                "latency_ms": samples,
                "download_bytes": received,
                "upload_bytes": self.config.upload_bytes,
            })),
            ..SpeedTestResult::now()
        })
    }
}
