//! Throughput measurement: provider adapters plus the parsers and formatting
//! they share.

pub mod iperf;
pub mod ping;
pub mod provider;
pub mod report;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThroughputError {
    #[error("{tool} not found at {path}")]
    ToolNotFound { tool: &'static str, path: String },

    #[error("{tool} exited with code {code}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: &'static str },
}

impl ThroughputError {
    /// Map a finished subprocess into an error when it exited non-zero.
    pub fn check_status(tool: &'static str, output: &std::process::Output) -> Result<(), Self> {
        if output.status.success() {
            return Ok(());
        }
        Err(Self::ToolFailed {
            tool,
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Map a spawn failure, calling out a missing binary.
    pub fn spawn(tool: &'static str, path: &str, err: std::io::Error) -> anyhow::Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::ToolNotFound {
                tool,
                path: path.to_string(),
            }
            .into()
        } else {
            anyhow::Error::new(err).context(format!("failed to spawn {tool}"))
        }
    }
}

/// Reject targets that could be read as command-line flags or carry shell
/// metacharacters before they reach a subprocess.
pub fn validate_target(target: &str) -> Result<(), ThroughputError> {
    let invalid = |reason| ThroughputError::InvalidTarget {
        target: target.to_string(),
        reason,
    };
    if target.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if target.starts_with('-') {
        return Err(invalid("must not start with '-'"));
    }
    // Hostnames, IPv4 and IPv6 literals.
    if target
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != ':')
    {
        return Err(invalid("contains invalid characters"));
    }
    Ok(())
}
