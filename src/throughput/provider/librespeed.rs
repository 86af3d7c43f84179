use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{
    ClientInfo, ProviderKind, ProviderMeta, ServerInfo, SpeedTestProvider, SpeedTestRequest,
    SpeedTestResult, LIBRESPEED,
};
use crate::config::LibrespeedConfig;
use crate::throughput::ThroughputError;

/// Public-internet test through `librespeed-cli --json`.
pub struct LibrespeedProvider {
    config: LibrespeedConfig,
}

impl LibrespeedProvider {
    pub fn new(config: LibrespeedConfig) -> Self {
        Self { config }
    }
}

/// One element of the array librespeed-cli prints with `--json`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Report {
    timestamp: String,
    server: ServerInfo,
    client: ClientInfo,
    bytes_sent: i64,
    bytes_received: i64,
    ping: f64,
    jitter: f64,
    upload: f64,
    download: f64,
    share: String,
}

/// Parse librespeed-cli JSON output. Only the first report is used; the CLI
/// emits one per server tested and bandwatch tests one server per run.
pub fn parse_output(stdout: &[u8]) -> Result<SpeedTestResult> {
    let raw: serde_json::Value =
        serde_json::from_slice(stdout).context("librespeed-cli output is not valid JSON")?;
    let mut reports: Vec<Report> =
        serde_json::from_value(raw.clone()).context("unexpected librespeed-cli JSON layout")?;
    if reports.is_empty() {
        anyhow::bail!("librespeed-cli returned no results");
    }
    let report = reports.swap_remove(0);

    let timestamp = DateTime::parse_from_rfc3339(&report.timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(SpeedTestResult {
        timestamp,
        server: report.server,
        client: report.client,
        bytes_sent: report.bytes_sent,
        bytes_received: report.bytes_received,
        ping: report.ping,
        jitter: report.jitter,
        upload: report.upload,
        download: report.download,
        share: report.share,
        raw: Some(raw),
    })
}

#[async_trait::async_trait]
impl SpeedTestProvider for LibrespeedProvider {
    fn meta(&self) -> ProviderMeta {
        ProviderMeta {
            name: LIBRESPEED,
            display_name: "LibreSpeed",
            kind: ProviderKind::PublicWAN,
            requires_host: false,
            description: "Open-source speed test against the nearest public LibreSpeed server.",
            install_hint: "Install librespeed-cli: https://github.com/librespeed/speedtest-cli",
        }
    }

    fn is_available(&self) -> bool {
        std::process::Command::new(&self.config.path)
            .arg("--version")
            .output()
            .is_ok()
    }

    async fn run(&self, _req: &SpeedTestRequest) -> Result<SpeedTestResult> {
        let mut cmd = tokio::process::Command::new(&self.config.path);
        cmd.arg("--json").kill_on_drop(true);
        if let Some(id) = self.config.server_id {
            cmd.arg("--server").arg(id.to_string());
        }

        tracing::debug!(path = %self.config.path, "running librespeed-cli");
        let output = cmd
            .output()
            .await
            .map_err(|e| ThroughputError::spawn("librespeed-cli", &self.config.path, e))?;
        ThroughputError::check_status("librespeed-cli", &output)?;

        parse_output(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[{
        "timestamp": "2026-01-19T09:00:03.512345678Z",
        "server": {"name": "Amsterdam, Netherlands (Clouvider)", "url": "http://ams.speedtest.clouvider.net/backend"},
        "client": {"ip": "203.0.113.7", "hostname": "host-7.example.net", "city": "Utrecht",
                   "region": "Utrecht", "country": "NL", "loc": "52.09,5.12", "org": "AS64500 Example",
                   "postal": "3511", "timezone": "Europe/Amsterdam"},
        "bytes_sent": 15728640,
        "bytes_received": 120586240,
        "ping": 9.5,
        "jitter": 1.25,
        "upload": 11.197,
        "download": 93.452,
        "share": ""
    }]"#;

    #[test]
    fn test_parse_sample() {
        let r = parse_output(SAMPLE.as_bytes()).unwrap();
        assert_eq!(r.server.name, "Amsterdam, Netherlands (Clouvider)");
        assert_eq!(r.client.country, "NL");
        assert_eq!(r.bytes_received, 120586240);
        assert_eq!(r.download, 93.452);
        assert_eq!(r.timestamp.to_rfc3339(), "2026-01-19T09:00:03.512345678+00:00");
        assert!(r.raw.is_some());
    }

    #[test]
    fn test_parse_tolerates_missing_fields() {
        let r = parse_output(br#"[{"download": 50.0, "upload": 5.0}]"#).unwrap();
        assert_eq!(r.download, 50.0);
        assert_eq!(r.server.name, "");
        assert_eq!(r.bytes_sent, 0);
    }

    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!(parse_output(b"[]").is_err());
        assert!(parse_output(b"Retrieving server list").is_err());
        assert!(parse_output(br#"{"download": 1}"#).is_err());
    }
}
