//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS providers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            cron_expression TEXT NOT NULL,
            provider_id TEXT NOT NULL REFERENCES providers(id),
            provider_name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS speedtest_results (
            id INTEGER PRIMARY KEY,
            timestamp TEXT NOT NULL,
            server_name TEXT NOT NULL DEFAULT '',
            server_url TEXT NOT NULL DEFAULT '',
            client_ip TEXT NOT NULL DEFAULT '',
            client_hostname TEXT NOT NULL DEFAULT '',
            client_city TEXT NOT NULL DEFAULT '',
            client_region TEXT NOT NULL DEFAULT '',
            client_country TEXT NOT NULL DEFAULT '',
            client_loc TEXT NOT NULL DEFAULT '',
            client_org TEXT NOT NULL DEFAULT '',
            client_postal TEXT NOT NULL DEFAULT '',
            client_timezone TEXT NOT NULL DEFAULT '',
            bytes_sent INTEGER NOT NULL DEFAULT 0,
            bytes_received INTEGER NOT NULL DEFAULT 0,
            ping REAL NOT NULL DEFAULT 0,
            jitter REAL NOT NULL DEFAULT 0,
            upload REAL NOT NULL DEFAULT 0,
            download REAL NOT NULL DEFAULT 0,
            share TEXT NOT NULL DEFAULT '',
            provider_id TEXT,
            provider_name TEXT NOT NULL,
            schedule_id TEXT REFERENCES schedules(id) ON DELETE SET NULL,
            raw_result TEXT
        );

        CREATE TABLE IF NOT EXISTS run_history (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL UNIQUE,
            schedule_id TEXT,
            provider_name TEXT NOT NULL,
            provider_key TEXT NOT NULL,
            trigger TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            result_id INTEGER,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            speedtest_frequency INTEGER NOT NULL DEFAULT 60,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        INSERT OR IGNORE INTO settings (id) VALUES (1);

        CREATE INDEX IF NOT EXISTS idx_results_timestamp ON speedtest_results(timestamp);
        CREATE INDEX IF NOT EXISTS idx_results_schedule ON speedtest_results(schedule_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_run_history_started ON run_history(started_at);",
    )?;

    // Older databases predate iperf3 targets, retention and the evaluation
    // watermark.
    add_column_if_missing(conn, "schedules", "host_endpoint", "TEXT")?;
    add_column_if_missing(conn, "schedules", "host_port", "TEXT")?;
    add_column_if_missing(
        conn,
        "schedules",
        "result_limit",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    add_column_if_missing(conn, "schedules", "last_evaluated_at", "TEXT")?;

    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let present: i64 = conn.query_row(
        &format!("SELECT count(*) FROM pragma_table_info('{table}') WHERE name = ?1"),
        [column],
        |row| row.get(0),
    )?;

    if present == 0 {
        tracing::info!(%table, %column, "adding missing column");
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])?;
    }
    Ok(())
}
