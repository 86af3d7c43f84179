//! Single-flight dispatcher shared by the tick loop and manual runs.
//!
//! A run holds a lease on its [`ProviderKey`] from dispatch until its
//! result is recorded. A second dispatch for the same key while the lease is
//! held fails fast with [`CoreError::ProviderBusy`].

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::history::{HistoryEntry, RunHistory, RunStatus};
use super::Schedule;
use crate::error::{CoreError, Result};
use crate::results::{Recorded, ResultRecorder, ResultSource};
use crate::storage::{providers, Pool};
use crate::throughput::validate_target;
use crate::throughput::provider::{
    ProviderRegistry, SpeedTestProvider, SpeedTestRequest, SpeedTestResult,
};

// ---------------------------------------------------------------------------
// Provider keys and leases
// ---------------------------------------------------------------------------

/// The unit of mutual exclusion: one in-flight run per provider and target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub provider: String,
    pub host: Option<String>,
    pub port: Option<String>,
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, &self.port) {
            (None, None) => write!(f, "{}", self.provider),
            (host, port) => write!(
                f,
                "{}@{}:{}",
                self.provider,
                host.as_deref().unwrap_or(""),
                port.as_deref().unwrap_or("")
            ),
        }
    }
}

/// Set of keys with a run in flight.
#[derive(Clone, Default)]
pub struct ProviderLocks {
    held: Arc<Mutex<HashSet<ProviderKey>>>,
}

impl ProviderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if another run holds it.
    pub fn try_acquire(&self, key: ProviderKey) -> Option<ProviderLease> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return None;
        }
        Some(ProviderLease {
            key,
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, key: &ProviderKey) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

/// Held for the lifetime of a run. Dropping it (on completion, timeout or
/// panic) frees the key.
pub struct ProviderLease {
    key: ProviderKey,
    held: Arc<Mutex<HashSet<ProviderKey>>>,
}

impl ProviderLease {
    pub fn key(&self) -> &ProviderKey {
        &self.key
    }
}

impl Drop for ProviderLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

// ---------------------------------------------------------------------------
// Requests and handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "scheduled" => Self::Scheduled,
            _ => Self::Manual,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub provider_name: String,
    pub host_endpoint: Option<String>,
    pub host_port: Option<String>,
    /// Results are tagged with this schedule and count toward its retention.
    pub schedule_id: Option<String>,
    pub trigger: Trigger,
}

impl DispatchRequest {
    pub fn for_schedule(schedule: &Schedule) -> Self {
        Self {
            provider_name: schedule.provider_name.clone(),
            host_endpoint: schedule.host_endpoint.clone(),
            host_port: schedule.host_port.clone(),
            schedule_id: Some(schedule.id.clone()),
            trigger: Trigger::Scheduled,
        }
    }

    pub fn manual(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            host_endpoint: None,
            host_port: None,
            schedule_id: None,
            trigger: Trigger::Manual,
        }
    }

    pub fn key(&self) -> ProviderKey {
        ProviderKey {
            provider: self.provider_name.clone(),
            host: self.host_endpoint.clone(),
            port: self.host_port.clone(),
        }
    }
}

/// An accepted run. The task keeps going if the handle is dropped.
pub struct RunHandle {
    pub run_id: String,
    pub key: ProviderKey,
    join: JoinHandle<HistoryEntry>,
}

impl RunHandle {
    /// Wait for the run to finish and return its history entry.
    pub async fn wait(self) -> Result<HistoryEntry> {
        self.join.await.map_err(|e| CoreError::ProviderFailure {
            key: self.key.to_string(),
            reason: format!("run task aborted: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    providers: Arc<ProviderRegistry>,
    recorder: ResultRecorder,
    history: RunHistory,
    locks: ProviderLocks,
    run_timeout: Duration,
}

impl Dispatcher {
    pub fn new(pool: Pool, providers: Arc<ProviderRegistry>, run_timeout: Duration) -> Self {
        Self {
            recorder: ResultRecorder::new(pool.clone()),
            history: RunHistory::new(pool.clone()),
            pool,
            providers,
            locks: ProviderLocks::new(),
            run_timeout,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn locks(&self) -> &ProviderLocks {
        &self.locks
    }

    /// Start a run in the background.
    ///
    /// Fails without side effects when the provider is unknown, a required
    /// target is missing, or the provider key is busy.
    pub fn try_dispatch(&self, mut req: DispatchRequest) -> Result<RunHandle> {
        let provider = self.providers.get(&req.provider_name)?;

        if provider.meta().requires_host {
            let (host, port) = canonical_target(&req)?;
            req.host_endpoint = Some(host);
            req.host_port = Some(port.to_string());
        } else {
            // Host fields mean nothing to these providers and must not split
            // the key.
            req.host_endpoint = None;
            req.host_port = None;
        }

        let key = req.key();
        let lease = self
            .locks
            .try_acquire(key.clone())
            .ok_or_else(|| CoreError::ProviderBusy {
                key: key.to_string(),
            })?;

        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            run = %run_id,
            provider = %key,
            schedule = ?req.schedule_id,
            trigger = req.trigger.as_str(),
            "run dispatched"
        );

        let this = self.clone();
        let id = run_id.clone();
        let join = tokio::spawn(async move { this.execute(id, req, provider, lease).await });

        Ok(RunHandle { run_id, key, join })
    }

    async fn execute(
        self,
        run_id: String,
        req: DispatchRequest,
        provider: Arc<dyn SpeedTestProvider>,
        lease: ProviderLease,
    ) -> HistoryEntry {
        let started_at = Utc::now();
        let key = lease.key().to_string();
        let params = SpeedTestRequest {
            host_endpoint: req.host_endpoint.clone(),
            host_port: req.host_port.clone(),
            timeout: self.run_timeout,
        };

        let (status, result_id, err) =
            match tokio::time::timeout(self.run_timeout, provider.run(&params)).await {
                Ok(Ok(result)) => match self.record(result.normalized(), &req).await {
                    Ok(rec) => {
                        info!(run = %run_id, provider = %key, result = rec.id, "run succeeded");
                        (RunStatus::Success, Some(rec.id), None)
                    }
                    Err(e) => {
                        error!(run = %run_id, provider = %key, error = %e, "failed to record result");
                        (RunStatus::Failed, None, Some(e.to_string()))
                    }
                },
                Ok(Err(e)) => {
                    let e = CoreError::ProviderFailure {
                        key: key.clone(),
                        reason: format!("{e:#}"),
                    };
                    warn!(run = %run_id, provider = %key, error = %e, "run failed");
                    (RunStatus::Failed, None, Some(e.to_string()))
                }
                Err(_) => {
                    let e = CoreError::ProviderTimeout {
                        key: key.clone(),
                        secs: self.run_timeout.as_secs(),
                    };
                    warn!(run = %run_id, provider = %key, "run timed out");
                    (RunStatus::TimedOut, None, Some(e.to_string()))
                }
            };
        drop(lease);

        let entry = HistoryEntry {
            run_id,
            schedule_id: req.schedule_id,
            provider_name: req.provider_name,
            provider_key: key,
            trigger: req.trigger,
            status,
            error: err,
            result_id,
            started_at,
            finished_at: Utc::now(),
        };

        let history = self.history.clone();
        let row = entry.clone();
        match tokio::task::spawn_blocking(move || history.append(&row)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(run = %entry.run_id, error = %e, "failed to append run history"),
            Err(e) => error!(run = %entry.run_id, error = %e, "run history task aborted"),
        }
        entry
    }

    async fn record(&self, result: SpeedTestResult, req: &DispatchRequest) -> Result<Recorded> {
        let pool = self.pool.clone();
        let recorder = self.recorder.clone();
        let provider_name = req.provider_name.clone();
        let schedule_id = req.schedule_id.clone();

        tokio::task::spawn_blocking(move || {
            let provider_id = providers::find_by_name(&pool, &provider_name)?.map(|p| p.id);
            recorder.record(
                &result,
                &ResultSource {
                    provider_id,
                    provider_name,
                    schedule_id,
                },
            )
        })
        .await?
    }
}

/// Lowercased, validated host and parsed port for host-addressed providers.
fn canonical_target(req: &DispatchRequest) -> Result<(String, u16)> {
    let host = req
        .host_endpoint
        .as_deref()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| {
            CoreError::validation(
                "host_endpoint",
                format!("required for the {} provider", req.provider_name),
            )
        })?;
    validate_target(&host).map_err(|e| CoreError::validation("host_endpoint", e.to_string()))?;

    match req.host_port.as_deref().map(|p| p.trim().parse::<u16>()) {
        Some(Ok(port)) if port > 0 => Ok((host, port)),
        _ => Err(CoreError::validation(
            "host_port",
            format!("required for the {} provider", req.provider_name),
        )),
    }
}
