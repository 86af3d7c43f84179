//! Speed test providers and the registry the dispatcher looks them up in.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ProvidersConfig;
use crate::error::CoreError;

pub mod cloudflare;
pub mod iperf3;
pub mod librespeed;

pub const LIBRESPEED: &str = "librespeed";
pub const CLOUDFLARE: &str = "cloudflare";
pub const IPERF3: &str = "iperf3";

/// Metadata describing a speed test provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderMeta {
    pub name: &'static str,
    pub display_name: &'static str,
    pub kind: ProviderKind,
    /// Whether a run needs `host_endpoint` and `host_port`.
    pub requires_host: bool,
    pub description: &'static str,
    pub install_hint: &'static str,
}

/// What the provider measures against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    PublicWAN,
    SelfHostedLAN,
}

/// Parameters for one run.
#[derive(Debug, Clone)]
pub struct SpeedTestRequest {
    pub host_endpoint: Option<String>,
    pub host_port: Option<String>,
    pub timeout: Duration,
}

impl SpeedTestRequest {
    /// Endpoint and parsed port, for providers that need a target.
    pub fn target(&self) -> Result<(&str, u16)> {
        let host = self
            .host_endpoint
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow::anyhow!("host_endpoint is required"))?;
        let port = self
            .host_port
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("host_port is required"))?
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("invalid host_port: {e}"))?;
        Ok((host, port))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfo {
    pub ip: String,
    pub hostname: String,
    pub city: String,
    pub region: String,
    pub country: String,
    pub loc: String,
    pub org: String,
    pub postal: String,
    pub timezone: String,
}

/// Canonical result every provider returns. Speeds are in Mbps, latency
/// and jitter in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestResult {
    pub timestamp: DateTime<Utc>,
    pub server: ServerInfo,
    pub client: ClientInfo,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub ping: f64,
    pub jitter: f64,
    pub upload: f64,
    pub download: f64,
    #[serde(default)]
    pub share: String,
    /// Provider-native payload, kept for debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl SpeedTestResult {
    /// An empty result stamped with the current time.
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            server: ServerInfo::default(),
            client: ClientInfo::default(),
            bytes_sent: 0,
            bytes_received: 0,
            ping: 0.0,
            jitter: 0.0,
            upload: 0.0,
            download: 0.0,
            share: String::new(),
            raw: None,
        }
    }

    /// Round metrics to two decimals and clamp negative or non-finite
    /// values to zero.
    pub fn normalized(mut self) -> Self {
        self.ping = round2(self.ping);
        self.jitter = round2(self.jitter);
        self.upload = round2(self.upload);
        self.download = round2(self.download);
        self.bytes_sent = self.bytes_sent.max(0);
        self.bytes_received = self.bytes_received.max(0);
        self
    }
}

pub fn round2(v: f64) -> f64 {
    if !v.is_finite() || v < 0.0 {
        return 0.0;
    }
    (v * 100.0).round() / 100.0
}

pub fn mbps(bits_per_second: f64) -> f64 {
    bits_per_second / 1_000_000.0
}

/// Trait for all speed test providers.
#[async_trait]
pub trait SpeedTestProvider: Send + Sync {
    /// Static metadata about the provider.
    fn meta(&self) -> ProviderMeta;

    /// Check if the provider's CLI/dependency is available.
    fn is_available(&self) -> bool;

    /// Run the speed test.
    async fn run(&self, req: &SpeedTestRequest) -> Result<SpeedTestResult>;
}

/// Providers by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn SpeedTestProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the `[providers]` config section. Unknown
    /// names are skipped with a warning.
    pub fn from_config(cfg: &ProvidersConfig) -> Self {
        let mut registry = Self::new();
        for name in &cfg.enabled {
            let provider: Arc<dyn SpeedTestProvider> = match name.as_str() {
                LIBRESPEED => Arc::new(librespeed::LibrespeedProvider::new(cfg.librespeed.clone())),
                CLOUDFLARE => Arc::new(cloudflare::CloudflareProvider::new(cfg.cloudflare.clone())),
                IPERF3 => Arc::new(iperf3::Iperf3Provider::new(cfg.iperf3.clone())),
                other => {
                    tracing::warn!(provider = %other, "unknown provider in config, skipping");
                    continue;
                }
            };
            registry = registry.with(provider);
        }
        registry
    }

    /// Register a provider under its meta name, replacing any previous one.
    pub fn with(mut self, provider: Arc<dyn SpeedTestProvider>) -> Self {
        self.providers.insert(provider.meta().name.to_string(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn SpeedTestProvider>, CoreError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::ProviderNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
