//! Schedule registry: validated CRUD over the `schedules` table.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use super::cron::CronExpr;
use super::{NewSchedule, Schedule, SchedulePatch, UpcomingRun};
use crate::error::{CoreError, Result};
use crate::storage::providers::{self, Provider};
use crate::storage::{decode_ts, encode_ts, Pool};
use crate::throughput::provider::IPERF3;
use crate::throughput::validate_target;

const COLUMNS: &str = "id, name, cron_expression, provider_id, provider_name, host_endpoint, \
     host_port, is_active, result_limit, last_evaluated_at, created_at, updated_at";

/// Sole writer of schedule records.
#[derive(Clone)]
pub struct ScheduleRegistry {
    pool: Pool,
}

/// A schedule's writable fields after merging input and resolving the provider.
struct Draft {
    name: String,
    cron_expression: String,
    provider: Provider,
    host_endpoint: Option<String>,
    host_port: Option<String>,
    is_active: bool,
    result_limit: i64,
}

impl ScheduleRegistry {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn create(&self, new: NewSchedule) -> Result<Schedule> {
        let provider = self.resolve_provider(new.provider_id.as_deref(), new.provider_name.as_deref())?;
        let draft = Draft {
            name: new.name,
            cron_expression: new.cron_expression,
            provider,
            host_endpoint: non_empty(new.host_endpoint),
            host_port: non_empty(new.host_port),
            is_active: new.is_active,
            result_limit: new.result_limit,
        };
        let draft = validate(draft)?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = encode_ts(&Utc::now());
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO schedules (id, name, cron_expression, provider_id, provider_name,
                 host_endpoint, host_port, is_active, result_limit, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                draft.name,
                draft.cron_expression,
                draft.provider.id,
                draft.provider.name,
                draft.host_endpoint,
                draft.host_port,
                draft.is_active,
                draft.result_limit,
                now
            ],
        )?;
        drop(conn);

        info!(schedule = %id, name = %draft.name, provider = %draft.provider.name, "schedule created");
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Result<Schedule> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM schedules WHERE id = ?1"),
            [id],
            map_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::not_found("schedule", id))
    }

    /// All schedules, newest first.
    pub fn list(&self) -> Result<Vec<Schedule>> {
        self.select(&format!(
            "SELECT {COLUMNS} FROM schedules ORDER BY created_at DESC, id"
        ))
    }

    pub fn list_active(&self) -> Result<Vec<Schedule>> {
        self.select(&format!(
            "SELECT {COLUMNS} FROM schedules WHERE is_active = 1 ORDER BY created_at, id"
        ))
    }

    pub fn update(&self, id: &str, patch: SchedulePatch) -> Result<Schedule> {
        let current = self.get(id)?;
        let previous_cron = current.cron_expression.clone();
        let was_active = current.is_active;

        let provider = if patch.provider_id.is_some() || patch.provider_name.is_some() {
            self.resolve_provider(patch.provider_id.as_deref(), patch.provider_name.as_deref())?
        } else {
            Provider {
                id: current.provider_id.clone(),
                name: current.provider_name.clone(),
            }
        };

        let draft = Draft {
            name: patch.name.unwrap_or(current.name),
            cron_expression: patch.cron_expression.unwrap_or(current.cron_expression),
            provider,
            host_endpoint: match patch.host_endpoint {
                Some(v) => non_empty(Some(v)),
                None => current.host_endpoint,
            },
            host_port: match patch.host_port {
                Some(v) => non_empty(Some(v)),
                None => current.host_port,
            },
            is_active: patch.is_active.unwrap_or(current.is_active),
            result_limit: patch.result_limit.unwrap_or(current.result_limit),
        };
        let draft = validate(draft)?;
        // A new expression or a resumed schedule must not fire for times it
        // was not evaluated against.
        let rearm = draft.cron_expression != previous_cron || (draft.is_active && !was_active);

        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules
             SET name = ?1, cron_expression = ?2, provider_id = ?3, provider_name = ?4,
                 host_endpoint = ?5, host_port = ?6, is_active = ?7, result_limit = ?8,
                 updated_at = ?9,
                 last_evaluated_at = CASE WHEN ?11 THEN ?9 ELSE last_evaluated_at END
             WHERE id = ?10",
            params![
                draft.name,
                draft.cron_expression,
                draft.provider.id,
                draft.provider.name,
                draft.host_endpoint,
                draft.host_port,
                draft.is_active,
                draft.result_limit,
                encode_ts(&Utc::now()),
                id,
                rearm
            ],
        )?;
        drop(conn);

        if changed == 0 {
            return Err(CoreError::not_found("schedule", id));
        }
        info!(schedule = %id, rearm, "schedule updated");
        self.get(id)
    }

    /// Delete a schedule. Its results are kept with the schedule reference
    /// cleared.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE speedtest_results SET schedule_id = NULL WHERE schedule_id = ?1",
            [id],
        )?;
        let changed = tx.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(CoreError::not_found("schedule", id));
        }
        tx.commit()?;

        info!(schedule = %id, "schedule deleted");
        Ok(())
    }

    /// Pause or resume a schedule. Resuming moves the watermark to now, so
    /// fire times that passed while paused are skipped.
    pub fn set_active(&self, id: &str, active: bool) -> Result<Schedule> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules
             SET last_evaluated_at = CASE WHEN ?1 AND NOT is_active THEN ?2 ELSE last_evaluated_at END,
                 is_active = ?1, updated_at = ?2
             WHERE id = ?3",
            params![active, encode_ts(&Utc::now()), id],
        )?;
        drop(conn);

        if changed == 0 {
            return Err(CoreError::not_found("schedule", id));
        }
        info!(schedule = %id, active, "schedule activation changed");
        self.get(id)
    }

    /// Advance the evaluation watermark for the given schedules.
    ///
    /// This is bookkeeping for the engine and leaves `updated_at` alone.
    pub fn mark_evaluated(&self, ids: &[String], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE schedules SET last_evaluated_at = ?1 WHERE id = ?2")?;
            let at = encode_ts(&at);
            for id in ids {
                stmt.execute(params![at, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Fire times of all active schedules within the next `hours`.
    /// This is strictly a dry-run preview, not the execution loop.
    pub fn preview_next_runs(&self, hours: u64, now: DateTime<Utc>) -> Result<Vec<UpcomingRun>> {
        let end = now + Duration::hours(hours as i64);
        let mut preview = Vec::new();

        for schedule in self.list_active()? {
            let cron = match CronExpr::parse(&schedule.cron_expression) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(schedule = %schedule.id, error = %e, "skipping unparsable schedule");
                    continue;
                }
            };
            for at in cron.upcoming(now, end) {
                preview.push(UpcomingRun {
                    at,
                    schedule_id: schedule.id.clone(),
                    schedule_name: schedule.name.clone(),
                    provider_name: schedule.provider_name.clone(),
                });
            }
        }

        preview.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.schedule_name.cmp(&b.schedule_name)));
        Ok(preview)
    }

    fn select(&self, sql: &str) -> Result<Vec<Schedule>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], map_row)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    fn resolve_provider(&self, id: Option<&str>, name: Option<&str>) -> Result<Provider> {
        let id = id.filter(|s| !s.trim().is_empty());
        let name = name.filter(|s| !s.trim().is_empty());

        match (id, name) {
            (Some(id), name) => {
                let provider = providers::find_by_id(&self.pool, id)?.ok_or_else(|| {
                    CoreError::validation("provider_id", format!("unknown provider '{id}'"))
                })?;
                if let Some(name) = name {
                    if name != provider.name {
                        return Err(CoreError::validation(
                            "provider_name",
                            format!("'{name}' does not match provider id '{id}'"),
                        ));
                    }
                }
                Ok(provider)
            }
            (None, Some(name)) => providers::find_by_name(&self.pool, name)?.ok_or_else(|| {
                CoreError::validation("provider_name", format!("unknown provider '{name}'"))
            }),
            (None, None) => Err(CoreError::validation("provider_id", "a provider is required")),
        }
    }
}

fn validate(draft: Draft) -> Result<Draft> {
    if draft.name.trim().is_empty() {
        return Err(CoreError::validation("name", "must not be empty"));
    }

    let cron = CronExpr::parse(&draft.cron_expression)?;

    if draft.result_limit < 0 {
        return Err(CoreError::validation(
            "result_limit",
            format!("must be >= 0, got {}", draft.result_limit),
        ));
    }

    if draft.provider.name == IPERF3 {
        if draft.host_endpoint.is_none() {
            return Err(CoreError::validation(
                "host_endpoint",
                "required for the iperf3 provider",
            ));
        }
        if draft.host_port.is_none() {
            return Err(CoreError::validation("host_port", "required for the iperf3 provider"));
        }
    }

    if let Some(host) = &draft.host_endpoint {
        validate_target(host).map_err(|e| CoreError::validation("host_endpoint", e.to_string()))?;
    }

    if let Some(port) = &draft.host_port {
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {}
            _ => {
                return Err(CoreError::validation(
                    "host_port",
                    format!("'{port}' is not a port number"),
                ))
            }
        }
    }

    Ok(Draft {
        name: draft.name.trim().to_string(),
        cron_expression: cron.as_str().to_string(),
        ..draft
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let last: Option<String> = row.get(9)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        cron_expression: row.get(2)?,
        provider_id: row.get(3)?,
        provider_name: row.get(4)?,
        host_endpoint: row.get(5)?,
        host_port: row.get(6)?,
        is_active: row.get(7)?,
        result_limit: row.get(8)?,
        last_evaluated_at: last.as_deref().map(|s| decode_ts(9, s)).transpose()?,
        created_at: decode_ts(10, &created)?,
        updated_at: decode_ts(11, &updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_pool;

    fn registry() -> (tempfile::TempDir, ScheduleRegistry) {
        let (dir, pool) = temp_pool();
        providers::sync_providers(&pool, ["librespeed", "cloudflare", "iperf3"]).unwrap();
        (dir, ScheduleRegistry::new(pool))
    }

    fn hourly(provider: &str) -> NewSchedule {
        NewSchedule {
            name: "hourly".into(),
            cron_expression: "0 * * * *".into(),
            provider_name: Some(provider.into()),
            is_active: true,
            ..Default::default()
        }
    }

    fn field_of(err: CoreError) -> &'static str {
        assert!(err.is_validation(), "expected validation error, got {err:?}");
        err.field().unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, reg) = registry();
        let created = reg.create(hourly("librespeed")).unwrap();
        assert_eq!(created.provider_name, "librespeed");
        assert!(created.is_active);
        assert!(created.last_evaluated_at.is_none());
        assert_eq!(reg.get(&created.id).unwrap(), created);
    }

    #[test]
    fn test_create_by_provider_id() {
        let (_dir, reg) = registry();
        let p = providers::find_by_name(reg.pool(), "cloudflare").unwrap().unwrap();
        let created = reg
            .create(NewSchedule {
                provider_name: None,
                provider_id: Some(p.id.clone()),
                ..hourly("")
            })
            .unwrap();
        assert_eq!(created.provider_name, "cloudflare");
        assert_eq!(created.provider_id, p.id);
    }

    #[test]
    fn test_iperf3_requires_host_and_port() {
        let (_dir, reg) = registry();
        let err = reg.create(hourly("iperf3")).unwrap_err();
        assert_eq!(field_of(err), "host_endpoint");

        let err = reg
            .create(NewSchedule {
                host_endpoint: Some("10.0.0.5".into()),
                ..hourly("iperf3")
            })
            .unwrap_err();
        assert_eq!(field_of(err), "host_port");

        let err = reg
            .create(NewSchedule {
                host_endpoint: Some("   ".into()),
                host_port: Some("5201".into()),
                ..hourly("iperf3")
            })
            .unwrap_err();
        assert_eq!(field_of(err), "host_endpoint");

        let ok = reg
            .create(NewSchedule {
                host_endpoint: Some("10.0.0.5".into()),
                host_port: Some("5201".into()),
                ..hourly("iperf3")
            })
            .unwrap();
        assert_eq!(ok.host_port.as_deref(), Some("5201"));
        assert!(reg.list().unwrap().len() == 1);
    }

    #[test]
    fn test_rejects_bad_port_cron_limit_and_provider() {
        let (_dir, reg) = registry();

        let err = reg
            .create(NewSchedule {
                host_endpoint: Some("h".into()),
                host_port: Some("99999".into()),
                ..hourly("iperf3")
            })
            .unwrap_err();
        assert_eq!(field_of(err), "host_port");

        let err = reg
            .create(NewSchedule {
                cron_expression: "every hour".into(),
                ..hourly("librespeed")
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidCronExpression { .. }));

        let err = reg
            .create(NewSchedule {
                result_limit: -1,
                ..hourly("librespeed")
            })
            .unwrap_err();
        assert_eq!(field_of(err), "result_limit");

        let err = reg.create(hourly("speedof.me")).unwrap_err();
        assert_eq!(field_of(err), "provider_name");

        let err = reg
            .create(NewSchedule {
                provider_id: Some("missing".into()),
                ..hourly("librespeed")
            })
            .unwrap_err();
        assert_eq!(field_of(err), "provider_id");

        assert!(reg.list().unwrap().is_empty(), "no partial writes");
    }

    #[test]
    fn test_update_validates_merged_record() {
        let (_dir, reg) = registry();
        let s = reg.create(hourly("librespeed")).unwrap();

        // Switching to iperf3 without a target must fail and leave the row intact.
        let err = reg
            .update(
                &s.id,
                SchedulePatch {
                    provider_name: Some("iperf3".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(field_of(err), "host_endpoint");
        assert_eq!(reg.get(&s.id).unwrap(), s);

        let updated = reg
            .update(
                &s.id,
                SchedulePatch {
                    provider_name: Some("iperf3".into()),
                    host_endpoint: Some("10.0.0.5".into()),
                    host_port: Some("5201".into()),
                    result_limit: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.provider_name, "iperf3");
        assert_eq!(updated.result_limit, 5);
        assert_eq!(updated.name, "hourly");
        assert_eq!(updated.created_at, s.created_at);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let (_dir, reg) = registry();
        let err = reg.update("nope", SchedulePatch::default()).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let (_dir, reg) = registry();
        let s = reg.create(hourly("librespeed")).unwrap();
        let err = reg.delete("does-not-exist").unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
        assert!(reg.get(&s.id).is_ok());

        reg.delete(&s.id).unwrap();
        assert!(matches!(reg.get(&s.id), Err(CoreError::NotFound { .. })));
        assert!(matches!(reg.delete(&s.id), Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn test_set_active_bumps_updated_at() {
        let (_dir, reg) = registry();
        let s = reg.create(hourly("librespeed")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let off = reg.set_active(&s.id, false).unwrap();
        assert!(!off.is_active);
        assert!(off.updated_at > s.updated_at);
        assert!(reg.list_active().unwrap().is_empty());
        assert!(matches!(
            reg.set_active("nope", true),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rejects_option_like_host() {
        let (_dir, reg) = registry();
        for host in ["-R", "a b", "host;reboot"] {
            let err = reg
                .create(NewSchedule {
                    host_endpoint: Some(host.into()),
                    host_port: Some("5201".into()),
                    ..hourly("iperf3")
                })
                .unwrap_err();
            assert_eq!(field_of(err), "host_endpoint", "host {host:?}");
        }

        let s = reg
            .create(NewSchedule {
                host_endpoint: Some("10.0.0.5".into()),
                host_port: Some("5201".into()),
                ..hourly("iperf3")
            })
            .unwrap();
        let err = reg
            .update(
                &s.id,
                SchedulePatch {
                    host_endpoint: Some("--server".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(field_of(err), "host_endpoint");
    }

    #[test]
    fn test_resume_moves_watermark_to_now() {
        let (_dir, reg) = registry();
        let s = reg.create(hourly("librespeed")).unwrap();
        let stale = Utc::now() - Duration::days(2);
        reg.mark_evaluated(&[s.id.clone()], stale).unwrap();

        let paused = reg.set_active(&s.id, false).unwrap();
        assert_eq!(
            encode_ts(&paused.last_evaluated_at.unwrap()),
            encode_ts(&stale),
            "pausing keeps the watermark"
        );

        let before = Utc::now() - Duration::seconds(1);
        let resumed = reg.set_active(&s.id, true).unwrap();
        assert!(resumed.last_evaluated_at.unwrap() >= before);

        // Enabling an already active schedule leaves it alone.
        reg.mark_evaluated(&[s.id.clone()], stale).unwrap();
        let again = reg.set_active(&s.id, true).unwrap();
        assert_eq!(encode_ts(&again.last_evaluated_at.unwrap()), encode_ts(&stale));
    }

    #[test]
    fn test_update_rearms_on_new_cron_or_resume() {
        let (_dir, reg) = registry();
        let s = reg.create(hourly("librespeed")).unwrap();
        let stale = Utc::now() - Duration::days(2);
        let before = Utc::now() - Duration::seconds(1);

        reg.mark_evaluated(&[s.id.clone()], stale).unwrap();
        let renamed = reg
            .update(
                &s.id,
                SchedulePatch {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(encode_ts(&renamed.last_evaluated_at.unwrap()), encode_ts(&stale));

        let recron = reg
            .update(
                &s.id,
                SchedulePatch {
                    cron_expression: Some("*/10 * * * *".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(recron.last_evaluated_at.unwrap() >= before);

        reg.set_active(&s.id, false).unwrap();
        reg.mark_evaluated(&[s.id.clone()], stale).unwrap();
        let resumed = reg
            .update(
                &s.id,
                SchedulePatch {
                    is_active: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(resumed.last_evaluated_at.unwrap() >= before);
    }

    #[test]
    fn test_mark_evaluated_persists_watermark() {
        let (_dir, reg) = registry();
        let s = reg.create(hourly("librespeed")).unwrap();
        let at = Utc::now() + Duration::minutes(3);
        reg.mark_evaluated(&[s.id.clone()], at).unwrap();

        let again = reg.get(&s.id).unwrap();
        assert_eq!(encode_ts(&again.last_evaluated_at.unwrap()), encode_ts(&at));
        assert_eq!(again.updated_at, s.updated_at);
    }

    #[test]
    fn test_preview_next_runs() {
        let (_dir, reg) = registry();
        reg.create(NewSchedule {
            cron_expression: "0 */6 * * *".into(),
            ..hourly("librespeed")
        })
        .unwrap();
        reg.create(NewSchedule {
            name: "paused".into(),
            is_active: false,
            ..hourly("cloudflare")
        })
        .unwrap();

        let now = Utc::now();
        let preview = reg.preview_next_runs(24, now).unwrap();
        assert_eq!(preview.len(), 4);
        assert!(preview.windows(2).all(|w| w[0].at <= w[1].at));
        assert!(preview.iter().all(|p| p.provider_name == "librespeed"));
    }
}
