//! Human-readable result formatting for the CLI.

use super::provider::SpeedTestResult;

fn speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// Format a speed test result as a one-line summary.
pub fn format_summary(provider: &str, result: &SpeedTestResult) -> String {
    let server = if result.server.name.is_empty() {
        "unknown server"
    } else {
        result.server.name.as_str()
    };

    format!(
        "{} via {}: down {}, up {}, ping {:.2}ms, jitter {:.2}ms",
        provider,
        server,
        speed(result.download),
        speed(result.upload),
        result.ping,
        result.jitter,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_summary_gbps() {
        let mut result = SpeedTestResult::now();
        result.server.name = "10.0.0.5".into();
        result.download = 9412.0;
        result.upload = 9380.5;
        result.ping = 0.41;
        let summary = format_summary("iperf3", &result);
        assert!(summary.contains("down 9.41 Gbps"));
        assert!(summary.contains("up 9.38 Gbps"));
        assert!(summary.contains("iperf3 via 10.0.0.5"));
    }

    #[test]
    fn test_format_summary_mbps() {
        let mut result = SpeedTestResult::now();
        result.download = 245.3;
        result.upload = 20.0;
        let summary = format_summary("librespeed", &result);
        assert!(summary.contains("down 245.3 Mbps"));
        assert!(summary.contains("unknown server"));
    }
}
