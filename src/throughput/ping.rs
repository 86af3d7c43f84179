//! Parsing of the `ping` summary line.

/// Round-trip statistics in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub mdev: f64,
}

/// Extract round-trip statistics from `ping` output.
///
/// Handles both the iputils form
/// (`rtt min/avg/max/mdev = 0.321/0.412/0.503/0.061 ms`) and the BSD/macOS
/// form (`round-trip min/avg/max/stddev = ...`). Returns `None` when no
/// summary line is present, e.g. when every packet was lost.
pub fn parse_summary(output: &str) -> Option<PingSummary> {
    let line = output
        .lines()
        .find(|l| l.starts_with("rtt ") || l.starts_with("round-trip "))?;
    let (_, values) = line.split_once('=')?;
    let mut parts = values
        .trim()
        .trim_end_matches("ms")
        .trim()
        .split('/')
        .map(|v| v.trim().parse::<f64>());

    let min = parts.next()?.ok()?;
    let avg = parts.next()?.ok()?;
    let max = parts.next()?.ok()?;
    let mdev = parts.next().and_then(|v| v.ok()).unwrap_or(0.0);

    Some(PingSummary {
        min,
        avg,
        max,
        mdev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iputils() {
        let out = "PING 10.0.0.5 (10.0.0.5) 56(84) bytes of data.\n\
                   64 bytes from 10.0.0.5: icmp_seq=1 ttl=64 time=0.412 ms\n\
                   \n\
                   --- 10.0.0.5 ping statistics ---\n\
                   10 packets transmitted, 10 received, 0% packet loss, time 9012ms\n\
                   rtt min/avg/max/mdev = 0.321/0.412/0.503/0.061 ms\n";
        let s = parse_summary(out).unwrap();
        assert_eq!(s.avg, 0.412);
        assert_eq!(s.mdev, 0.061);
    }

    #[test]
    fn test_parse_bsd() {
        let out = "--- 1.1.1.1 ping statistics ---\n\
                   10 packets transmitted, 10 packets received, 0.0% packet loss\n\
                   round-trip min/avg/max/stddev = 9.812/11.204/14.330/1.305 ms\n";
        let s = parse_summary(out).unwrap();
        assert_eq!(s.min, 9.812);
        assert_eq!(s.avg, 11.204);
        assert_eq!(s.max, 14.330);
    }

    #[test]
    fn test_total_loss_has_no_summary() {
        let out = "--- 10.0.0.9 ping statistics ---\n\
                   10 packets transmitted, 0 received, 100% packet loss, time 9200ms\n";
        assert!(parse_summary(out).is_none());
    }
}
