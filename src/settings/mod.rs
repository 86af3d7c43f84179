//! Singleton application settings row.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::storage::{decode_ts, encode_ts, Pool};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// Minutes between runs suggested to the presentation layer.
    pub speedtest_frequency: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub speedtest_frequency: Option<i64>,
}

pub fn get(pool: &Pool) -> Result<Settings> {
    let conn = pool.get()?;
    let settings = conn.query_row(
        "SELECT speedtest_frequency, created_at, updated_at FROM settings WHERE id = 1",
        [],
        |row| {
            let created: String = row.get(1)?;
            let updated: String = row.get(2)?;
            Ok(Settings {
                speedtest_frequency: row.get(0)?,
                created_at: decode_ts(1, &created)?,
                updated_at: decode_ts(2, &updated)?,
            })
        },
    )?;
    Ok(settings)
}

pub fn update(pool: &Pool, patch: SettingsPatch) -> Result<Settings> {
    if let Some(freq) = patch.speedtest_frequency {
        if freq <= 0 {
            return Err(CoreError::validation(
                "speedtest_frequency",
                format!("must be a positive number of minutes, got {freq}"),
            ));
        }
        let conn = pool.get()?;
        conn.execute(
            "UPDATE settings SET speedtest_frequency = ?1, updated_at = ?2 WHERE id = 1",
            params![freq, encode_ts(&Utc::now())],
        )?;
        tracing::info!(speedtest_frequency = freq, "settings updated");
    }
    get(pool)
}
