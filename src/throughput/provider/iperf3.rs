use anyhow::{Context, Result};
use serde_json::json;

use super::{
    mbps, ClientInfo, ProviderKind, ProviderMeta, ServerInfo, SpeedTestProvider,
    SpeedTestRequest, SpeedTestResult, IPERF3,
};
use crate::config::Iperf3Config;
use crate::throughput::iperf::{self, Iperf3Result};
use crate::throughput::ping::{self, PingSummary};
use crate::throughput::{validate_target, ThroughputError};

/// Self-hosted test against an iperf3 server named by the schedule.
pub struct Iperf3Provider {
    config: Iperf3Config,
}

impl Iperf3Provider {
    pub fn new(config: Iperf3Config) -> Self {
        Self { config }
    }

    fn iperf_args(&self, host: &str, port: u16, reverse: bool) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            host.to_string(),
            "-p".to_string(),
            port.to_string(),
            "-t".to_string(),
            self.config.duration_secs.max(1).to_string(),
            "-P".to_string(),
            self.config.streams.max(1).to_string(),
            "--json".to_string(),
        ];
        if reverse {
            args.push("-R".to_string());
        }
        args
    }

    async fn run_direction(&self, host: &str, port: u16, reverse: bool) -> Result<(Iperf3Result, serde_json::Value)> {
        let args = self.iperf_args(host, port, reverse);
        tracing::debug!(?args, "executing iperf3");

        let output = tokio::process::Command::new(&self.config.path)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ThroughputError::spawn("iperf3", &self.config.path, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            // iperf3 puts its error message in the JSON body.
            if let Err(e) = iperf::parse_output(&stdout) {
                return Err(e.context("iperf3 failed"));
            }
            ThroughputError::check_status("iperf3", &output)?;
        }

        let parsed = iperf::parse_output(&stdout)?;
        let raw = serde_json::from_str(&stdout).context("iperf3 output is not valid JSON")?;
        Ok((parsed, raw))
    }

    async fn run_ping(&self, host: &str) -> Option<(PingSummary, String)> {
        if self.config.ping_count == 0 {
            return None;
        }
        let output = tokio::process::Command::new(&self.config.ping_path)
            .arg("-c")
            .arg(self.config.ping_count.to_string())
            .arg(host)
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) => {
                let text = String::from_utf8_lossy(&out.stdout).to_string();
                match ping::parse_summary(&text) {
                    Some(summary) => Some((summary, text)),
                    None => {
                        tracing::warn!(%host, "ping produced no round-trip summary");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%host, error = %e, "ping could not be run");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl SpeedTestProvider for Iperf3Provider {
    fn meta(&self) -> ProviderMeta {
        ProviderMeta {
            name: IPERF3,
            display_name: "iperf3",
            kind: ProviderKind::SelfHostedLAN,
            requires_host: true,
            description: "Upload and download against an iperf3 server you run.",
            install_hint: "Install iperf3 (apt install iperf3 / brew install iperf3) and run `iperf3 -s` on the target.",
        }
    }

    fn is_available(&self) -> bool {
        std::process::Command::new(&self.config.path)
            .arg("-v")
            .output()
            .is_ok()
    }

    async fn run(&self, req: &SpeedTestRequest) -> Result<SpeedTestResult> {
        let (host, port) = req.target()?;
        validate_target(host)?;

        // Upload (client -> server), then download (server -> client, -R).
        let (up, up_raw) = self.run_direction(host, port, false).await?;
        let (down, down_raw) = self.run_direction(host, port, true).await?;

        let upload = up.bits_per_second().map(mbps).unwrap_or(0.0);
        let download = down.bits_per_second().map(mbps).unwrap_or(0.0);

        // Latency is best effort; a blocked ICMP path should not discard the
        // throughput numbers.
        let ping = self.run_ping(host).await;
        let (latency, jitter, ping_text) = match &ping {
            Some((s, text)) => (s.avg, s.mdev, Some(text.clone())),
            None => (0.0, 0.0, None),
        };

        Ok(SpeedTestResult {
            server: ServerInfo {
                name: host.to_string(),
                url: format!("iperf3://{host}:{port}"),
            },
            client: ClientInfo {
                ip: up.local_host().unwrap_or_default().to_string(),
                ..ClientInfo::default()
            },
            bytes_sent: up.bytes_sent() as i64,
            bytes_received: down.bytes_received() as i64,
            ping: latency,
            jitter,
            upload,
            download,
            raw: Some(json!({
                "upload": up_raw,
                "download": down_raw,
                "ping": ping_text,
            })),
            ..SpeedTestResult::now()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn provider() -> Iperf3Provider {
        Iperf3Provider::new(Iperf3Config::default())
    }

    #[test]
    fn test_args_upload_and_download() {
        let p = provider();
        let up = p.iperf_args("10.0.0.5", 5201, false);
        assert_eq!(
            up,
            ["-c", "10.0.0.5", "-p", "5201", "-t", "10", "-P", "1", "--json"]
        );
        let down = p.iperf_args("10.0.0.5", 5201, true);
        assert_eq!(down.last().map(String::as_str), Some("-R"));
    }

    #[tokio::test]
    async fn test_run_requires_target() {
        let req = SpeedTestRequest {
            host_endpoint: None,
            host_port: Some("5201".into()),
            timeout: Duration::from_secs(1),
        };
        let err = provider().run(&req).await.unwrap_err();
        assert!(err.to_string().contains("host_endpoint"));
    }

    #[tokio::test]
    async fn test_run_rejects_flag_like_host() {
        let req = SpeedTestRequest {
            host_endpoint: Some("--server".into()),
            host_port: Some("5201".into()),
            timeout: Duration::from_secs(1),
        };
        assert!(provider().run(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let p = Iperf3Provider::new(Iperf3Config {
            path: "/nonexistent/iperf3".into(),
            ..Iperf3Config::default()
        });
        let req = SpeedTestRequest {
            host_endpoint: Some("127.0.0.1".into()),
            host_port: Some("5201".into()),
            timeout: Duration::from_secs(1),
        };
        let err = p.run(&req).await.unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }
}
