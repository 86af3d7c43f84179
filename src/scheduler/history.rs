//! Execution history for dispatched runs, successful or not.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use super::dispatch::Trigger;
use crate::error::Result;
use crate::storage::{decode_ts, encode_ts, Pool};

/// A record of one dispatched run.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub schedule_id: Option<String>,
    pub provider_name: String,
    pub provider_key: String,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub error: Option<String>,
    pub result_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "timed_out" => Self::TimedOut,
            _ => Self::Failed,
        }
    }
}

/// Append-only run log.
#[derive(Clone)]
pub struct RunHistory {
    pool: Pool,
}

impl RunHistory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO run_history (run_id, schedule_id, provider_name, provider_key, trigger,
                 status, error, result_id, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.run_id,
                entry.schedule_id,
                entry.provider_name,
                entry.provider_key,
                entry.trigger.as_str(),
                entry.status.as_str(),
                entry.error,
                entry.result_id,
                encode_ts(&entry.started_at),
                encode_ts(&entry.finished_at),
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn recent(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, schedule_id, provider_name, provider_key, trigger, status, error,
                    result_id, started_at, finished_at
             FROM run_history ORDER BY started_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit.max(1)], map_row)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let trigger: String = row.get(4)?;
    let status: String = row.get(5)?;
    let started: String = row.get(8)?;
    let finished: String = row.get(9)?;
    Ok(HistoryEntry {
        run_id: row.get(0)?,
        schedule_id: row.get(1)?,
        provider_name: row.get(2)?,
        provider_key: row.get(3)?,
        trigger: Trigger::parse(&trigger),
        status: RunStatus::parse(&status),
        error: row.get(6)?,
        result_id: row.get(7)?,
        started_at: decode_ts(8, &started)?,
        finished_at: decode_ts(9, &finished)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_pool;
    use chrono::Duration;

    fn entry(run_id: &str, status: RunStatus, offset_secs: i64) -> HistoryEntry {
        let started = Utc::now() + Duration::seconds(offset_secs);
        HistoryEntry {
            run_id: run_id.into(),
            schedule_id: None,
            provider_name: "iperf3".into(),
            provider_key: "iperf3@10.0.0.5:5201".into(),
            trigger: Trigger::Manual,
            status,
            error: (status != RunStatus::Success).then(|| "connection refused".to_string()),
            result_id: (status == RunStatus::Success).then_some(7),
            started_at: started,
            finished_at: started + Duration::seconds(12),
        }
    }

    #[test]
    fn test_append_and_recent() {
        let (_dir, pool) = temp_pool();
        let history = RunHistory::new(pool);
        history.append(&entry("a", RunStatus::Success, 0)).unwrap();
        history.append(&entry("b", RunStatus::TimedOut, 10)).unwrap();
        history.append(&entry("c", RunStatus::Failed, 20)).unwrap();

        let recent = history.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "c");
        assert_eq!(recent[0].status, RunStatus::Failed);
        assert_eq!(recent[1].status, RunStatus::TimedOut);
        assert_eq!(recent[1].trigger, Trigger::Manual);

        let all = history.recent(10).unwrap();
        assert_eq!(all[2].result_id, Some(7));
        assert!(all[2].error.is_none());
    }

    #[test]
    fn test_duplicate_run_id_is_rejected() {
        let (_dir, pool) = temp_pool();
        let history = RunHistory::new(pool);
        history.append(&entry("a", RunStatus::Success, 0)).unwrap();
        assert!(history.append(&entry("a", RunStatus::Failed, 1)).is_err());
    }
}
