//! Result recorder: persists completed runs and enforces per-schedule
//! retention.

pub mod filter;

use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

pub use self::filter::ResultFilter;
use crate::error::{CoreError, Result};
use crate::storage::{decode_ts, encode_ts, Pool};
use crate::throughput::provider::{ClientInfo, ServerInfo, SpeedTestResult};

const COLUMNS: &str = "id, timestamp, server_name, server_url, client_ip, client_hostname, \
     client_city, client_region, client_country, client_loc, client_org, client_postal, \
     client_timezone, bytes_sent, bytes_received, ping, jitter, upload, download, share, \
     provider_id, provider_name, schedule_id";

/// Who produced a result.
#[derive(Debug, Clone)]
pub struct ResultSource {
    pub provider_id: Option<String>,
    pub provider_name: String,
    pub schedule_id: Option<String>,
}

/// A persisted result as returned by queries.
#[derive(Debug, Clone, Serialize)]
pub struct StoredResult {
    pub id: i64,
    #[serde(flatten)]
    pub result: SpeedTestResult,
    pub provider_id: Option<String>,
    pub provider_name: String,
    pub schedule_id: Option<String>,
}

/// Outcome of [`ResultRecorder::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    pub id: i64,
    /// Rows removed by retention.
    pub trimmed: usize,
    /// The schedule disappeared before the result arrived.
    pub orphaned: bool,
}

/// Sole writer of results.
#[derive(Clone)]
pub struct ResultRecorder {
    pool: Pool,
}

impl ResultRecorder {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert a result and trim its schedule down to `result_limit`.
    ///
    /// Both happen in one `BEGIN IMMEDIATE` transaction, so concurrent
    /// records serialize on the database write lock and each trim counts
    /// rows that include every earlier insert.
    pub fn record(&self, result: &SpeedTestResult, source: &ResultSource) -> Result<Recorded> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // The schedule may have been deleted while the run was in flight.
        let limit: Option<i64> = match &source.schedule_id {
            Some(sid) => tx
                .query_row(
                    "SELECT result_limit FROM schedules WHERE id = ?1",
                    [sid],
                    |r| r.get(0),
                )
                .optional()?,
            None => None,
        };
        let orphaned = source.schedule_id.is_some() && limit.is_none();
        let schedule_id = if orphaned {
            None
        } else {
            source.schedule_id.as_deref()
        };

        let raw = result.raw.as_ref().map(|v| v.to_string());

        tx.execute(
            "INSERT INTO speedtest_results (
                 timestamp, server_name, server_url,
                 client_ip, client_hostname, client_city, client_region, client_country,
                 client_loc, client_org, client_postal, client_timezone,
                 bytes_sent, bytes_received, ping, jitter, upload, download, share,
                 provider_id, provider_name, schedule_id, raw_result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                encode_ts(&result.timestamp),
                result.server.name,
                result.server.url,
                result.client.ip,
                result.client.hostname,
                result.client.city,
                result.client.region,
                result.client.country,
                result.client.loc,
                result.client.org,
                result.client.postal,
                result.client.timezone,
                result.bytes_sent,
                result.bytes_received,
                result.ping,
                result.jitter,
                result.upload,
                result.download,
                result.share,
                source.provider_id,
                source.provider_name,
                schedule_id,
                raw
            ],
        )?;
        let id = tx.last_insert_rowid();

        let trimmed = match (schedule_id, limit) {
            (Some(sid), Some(limit)) if limit > 0 => tx.execute(
                "DELETE FROM speedtest_results
                 WHERE schedule_id = ?1
                   AND id NOT IN (
                       SELECT id FROM speedtest_results
                       WHERE schedule_id = ?1
                       ORDER BY timestamp DESC, id DESC
                       LIMIT ?2)",
                params![sid, limit],
            )?,
            _ => 0,
        };
        tx.commit()?;

        if orphaned {
            info!(result = id, provider = %source.provider_name, "schedule deleted mid-run, result stored without schedule");
        }
        if trimmed > 0 {
            debug!(schedule = ?schedule_id, trimmed, "retention trimmed old results");
        }
        Ok(Recorded {
            id,
            trimmed,
            orphaned,
        })
    }

    /// Matching results, newest first.
    pub fn query(&self, filter: &ResultFilter) -> Result<Vec<StoredResult>> {
        let (clause, mut args) = filter.where_clause();
        args.push(rusqlite::types::Value::Integer(filter.effective_limit() as i64));
        args.push(rusqlite::types::Value::Integer(filter.offset as i64));

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM speedtest_results{clause}
             ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), map_row)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    pub fn get(&self, id: i64) -> Result<StoredResult> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM speedtest_results WHERE id = ?1"),
            [id],
            map_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::not_found("result", id.to_string()))
    }

    /// Number of results matching `filter`, ignoring limit and offset.
    pub fn count(&self, filter: &ResultFilter) -> Result<i64> {
        let (clause, args) = filter.where_clause();
        let conn = self.pool.get()?;
        let n = conn.query_row(
            &format!("SELECT COUNT(*) FROM speedtest_results{clause}"),
            params_from_iter(args),
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Distinct non-empty server names, alphabetically.
    pub fn server_names(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT server_name FROM speedtest_results
             WHERE server_name <> '' ORDER BY server_name",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;

        let mut names = Vec::new();
        for r in rows {
            names.push(r?);
        }
        Ok(names)
    }

    /// The provider-native payload stored with a result.
    pub fn raw_result(&self, id: i64) -> Result<Option<serde_json::Value>> {
        let conn = self.pool.get()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT raw_result FROM speedtest_results WHERE id = ?1",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(text) => Ok(serde_json::from_str(&text).ok()),
            None => Ok(None),
        }
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<StoredResult> {
    let ts: String = row.get(1)?;
    Ok(StoredResult {
        id: row.get(0)?,
        result: SpeedTestResult {
            timestamp: decode_ts(1, &ts)?,
            server: ServerInfo {
                name: row.get(2)?,
                url: row.get(3)?,
            },
            client: ClientInfo {
                ip: row.get(4)?,
                hostname: row.get(5)?,
                city: row.get(6)?,
                region: row.get(7)?,
                country: row.get(8)?,
                loc: row.get(9)?,
                org: row.get(10)?,
                postal: row.get(11)?,
                timezone: row.get(12)?,
            },
            bytes_sent: row.get(13)?,
            bytes_received: row.get(14)?,
            ping: row.get(15)?,
            jitter: row.get(16)?,
            upload: row.get(17)?,
            download: row.get(18)?,
            share: row.get(19)?,
            raw: None,
        },
        provider_id: row.get(20)?,
        provider_name: row.get(21)?,
        schedule_id: row.get(22)?,
    })
}
