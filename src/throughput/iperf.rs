//! iperf3 JSON output parsing.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Parsed iperf3 JSON result (subset of fields we care about).
#[derive(Debug, Deserialize)]
pub struct Iperf3Result {
    #[serde(default)]
    pub start: Option<Iperf3Start>,
    pub end: Iperf3End,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Start {
    #[serde(default)]
    pub connected: Vec<Iperf3Connection>,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Connection {
    pub local_host: String,
    pub remote_host: String,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3End {
    #[serde(default)]
    pub sum_sent: Option<Iperf3Sum>,
    #[serde(default)]
    pub sum_received: Option<Iperf3Sum>,
    /// UDP runs report a single `sum`.
    #[serde(default)]
    pub sum: Option<Iperf3Sum>,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Sum {
    pub bits_per_second: f64,
    pub bytes: u64,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub lost_percent: Option<f64>,
}

impl Iperf3Result {
    /// Goodput in bits per second. The receiver's view is preferred; the
    /// sender's is the fallback.
    pub fn bits_per_second(&self) -> Option<f64> {
        self.end
            .sum_received
            .as_ref()
            .or(self.end.sum_sent.as_ref())
            .or(self.end.sum.as_ref())
            .map(|s| s.bits_per_second)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.end
            .sum_sent
            .as_ref()
            .or(self.end.sum.as_ref())
            .map(|s| s.bytes)
            .unwrap_or(0)
    }

    pub fn bytes_received(&self) -> u64 {
        self.end
            .sum_received
            .as_ref()
            .or(self.end.sum.as_ref())
            .map(|s| s.bytes)
            .unwrap_or(0)
    }

    pub fn local_host(&self) -> Option<&str> {
        self.start
            .as_ref()
            .and_then(|s| s.connected.first())
            .map(|c| c.local_host.as_str())
    }
}

/// Parse an iperf3 JSON output string into a structured result.
///
/// iperf3 reports failures inside the JSON body (`"error": "..."`) and may
/// still exit non-zero, so that field is checked first.
pub fn parse_output(json_str: &str) -> Result<Iperf3Result> {
    let value: serde_json::Value =
        serde_json::from_str(json_str).context("iperf3 output is not valid JSON")?;
    if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
        anyhow::bail!("iperf3 reported: {err}");
    }
    let result: Iperf3Result =
        serde_json::from_value(value).context("unexpected iperf3 JSON layout")?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP_SAMPLE: &str = r#"{
        "start": {
            "connected": [{"socket": 5, "local_host": "192.168.1.20", "local_port": 50412,
                           "remote_host": "192.168.1.10", "remote_port": 5201}],
            "test_start": {"protocol": "TCP", "num_streams": 1, "duration": 10}
        },
        "intervals": [],
        "end": {
            "sum_sent": {"start": 0, "end": 10.0, "seconds": 10.0, "bytes": 1176502272,
                         "bits_per_second": 941201817.6, "retransmits": 12},
            "sum_received": {"start": 0, "end": 10.0, "seconds": 10.0, "bytes": 1174405120,
                             "bits_per_second": 939524096.0}
        }
    }"#;

    #[test]
    fn test_parse_tcp_sample() {
        let result = parse_output(TCP_SAMPLE).unwrap();
        assert_eq!(result.bits_per_second(), Some(939524096.0));
        assert_eq!(result.bytes_sent(), 1176502272);
        assert_eq!(result.bytes_received(), 1174405120);
        assert_eq!(result.local_host(), Some("192.168.1.20"));
    }

    #[test]
    fn test_falls_back_to_sender() {
        let json = r#"{"end": {"sum_sent": {"bits_per_second": 5000000.0, "bytes": 100}}}"#;
        let result = parse_output(json).unwrap();
        assert_eq!(result.bits_per_second(), Some(5_000_000.0));
        assert_eq!(result.bytes_received(), 0);
        assert!(result.local_host().is_none());
    }

    #[test]
    fn test_embedded_error_is_surfaced() {
        let json = r#"{"start": {}, "intervals": [], "end": {},
                       "error": "unable to connect to server: Connection refused"}"#;
        let err = parse_output(json).unwrap_err();
        assert!(err.to_string().contains("Connection refused"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_output("iperf3: error").is_err());
    }
}
