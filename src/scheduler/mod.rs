//! Schedule orchestration: cron evaluation, the schedule registry, the
//! single-flight dispatcher and the periodic engine that drives it.

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod history;
pub mod profiles;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::dispatch::{DispatchRequest, Dispatcher, RunHandle, Trigger};
pub use self::engine::{run_scheduler_loop, SchedulerEngine};
pub use self::registry::ScheduleRegistry;

/// A persisted rule pairing a cron expression with a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub provider_id: String,
    pub provider_name: String,
    pub host_endpoint: Option<String>,
    pub host_port: Option<String>,
    pub is_active: bool,
    /// Results kept for this schedule; `0` keeps everything.
    pub result_limit: i64,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating a schedule.
///
/// Either `provider_id` or `provider_name` identifies the provider. When both
/// are given they must agree.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub cron_expression: String,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub host_endpoint: Option<String>,
    #[serde(default)]
    pub host_port: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub result_limit: i64,
}

fn default_active() -> bool {
    true
}

/// Partial update. Absent fields are left unchanged. An empty
/// `host_endpoint` or `host_port` clears the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulePatch {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub provider_id: Option<String>,
    pub provider_name: Option<String>,
    pub host_endpoint: Option<String>,
    pub host_port: Option<String>,
    pub is_active: Option<bool>,
    pub result_limit: Option<i64>,
}

/// One entry of a dry-run preview.
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingRun {
    pub at: DateTime<Utc>,
    pub schedule_id: String,
    pub schedule_name: String,
    pub provider_name: String,
}
