//! Provider reference table.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Pool;
use crate::error::Result;

/// A provider row as stored and exposed over the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
}

/// Insert any registered provider names that are not yet in the table.
///
/// Existing rows keep their ids so schedules referencing them stay valid.
pub fn sync_providers<'a>(pool: &Pool, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let conn = pool.get()?;
    for name in names {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO providers (id, name) VALUES (?1, ?2)",
            params![uuid::Uuid::new_v4().to_string(), name],
        )?;
        if inserted > 0 {
            tracing::info!(provider = %name, "registered provider");
        }
    }
    Ok(())
}

pub fn list_providers(pool: &Pool) -> Result<Vec<Provider>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT id, name FROM providers ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(Provider {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;

    let mut list = Vec::new();
    for r in rows {
        list.push(r?);
    }
    Ok(list)
}

pub fn find_by_id(pool: &Pool, id: &str) -> Result<Option<Provider>> {
    let conn = pool.get()?;
    let provider = conn
        .query_row(
            "SELECT id, name FROM providers WHERE id = ?1",
            [id],
            |row| {
                Ok(Provider {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(provider)
}

pub fn find_by_name(pool: &Pool, name: &str) -> Result<Option<Provider>> {
    let conn = pool.get()?;
    let provider = conn
        .query_row(
            "SELECT id, name FROM providers WHERE name = ?1",
            [name],
            |row| {
                Ok(Provider {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(provider)
}
