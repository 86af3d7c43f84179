//! API route definitions.

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::response::{blocking, ok, with_meta, with_status, ApiError, ApiResult, ErrorBody};
use super::state::AppState;
use crate::error::CoreError;
use crate::results::filter::{ResultFilter, DEFAULT_LIMIT};
use crate::scheduler::{cron, profiles, DispatchRequest, NewSchedule, SchedulePatch, Trigger};
use crate::settings::{self, SettingsPatch};
use crate::storage::providers;
use crate::throughput::provider::{ProviderMeta, LIBRESPEED};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route(
            "/schedules",
            get(list_schedules)
                .post(create_schedule)
                .patch(update_schedule_by_query)
                .delete(delete_schedule_by_query),
        )
        .route("/schedules/presets", get(schedule_presets))
        .route("/schedules/dry-run", get(schedule_dry_run))
        .route("/schedules/describe", get(describe_cron))
        .route(
            "/schedules/{id}",
            get(get_schedule)
                .patch(update_schedule)
                .delete(delete_schedule),
        )
        .route("/schedules/{id}/active", patch(set_schedule_active))
        .route("/speedtest", get(list_results).post(start_speedtest))
        .route("/speedtest/{id}", get(get_result))
        .route("/runs", get(recent_runs))
        .route("/providers", get(list_providers))
        .route("/server-names", get(server_names))
        .route("/settings", get(get_settings).patch(update_settings))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "error": null,
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
        }
    }))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: Option<String>,
}

fn required_id(q: Result<Query<IdQuery>, QueryRejection>) -> Result<String, ApiError> {
    let Query(q) = q?;
    q.id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CoreError::validation("id", "query parameter is required").into())
}

async fn list_schedules(
    State(state): State<AppState>,
    q: Result<Query<IdQuery>, QueryRejection>,
) -> ApiResult {
    let Query(q) = q?;
    let registry = state.registry.clone();
    match q.id.filter(|id| !id.is_empty()) {
        Some(id) => Ok(ok(blocking(move || registry.get(&id)).await?)),
        None => {
            let list = blocking(move || registry.list()).await?;
            let total = list.len();
            Ok(with_meta(list, json!({ "total": total })))
        }
    }
}

async fn get_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let registry = state.registry.clone();
    Ok(ok(blocking(move || registry.get(&id)).await?))
}

async fn create_schedule(
    State(state): State<AppState>,
    body: Result<Json<NewSchedule>, JsonRejection>,
) -> ApiResult {
    let Json(new) = body?;
    let registry = state.registry.clone();
    let schedule = blocking(move || registry.create(new)).await?;
    Ok(with_status(StatusCode::CREATED, schedule))
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<SchedulePatch>, JsonRejection>,
) -> ApiResult {
    let Json(patch) = body?;
    let registry = state.registry.clone();
    Ok(ok(blocking(move || registry.update(&id, patch)).await?))
}

async fn update_schedule_by_query(
    state: State<AppState>,
    q: Result<Query<IdQuery>, QueryRejection>,
    body: Result<Json<SchedulePatch>, JsonRejection>,
) -> ApiResult {
    let id = required_id(q)?;
    update_schedule(state, Path(id), body).await
}

async fn delete_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let registry = state.registry.clone();
    let deleted = id.clone();
    blocking(move || registry.delete(&id)).await?;
    Ok(ok(json!({ "id": deleted, "deleted": true })))
}

async fn delete_schedule_by_query(
    state: State<AppState>,
    q: Result<Query<IdQuery>, QueryRejection>,
) -> ApiResult {
    let id = required_id(q)?;
    delete_schedule(state, Path(id)).await
}

#[derive(Debug, Deserialize)]
struct ActiveBody {
    is_active: bool,
}

async fn set_schedule_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ActiveBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let registry = state.registry.clone();
    Ok(ok(blocking(move || registry.set_active(&id, body.is_active)).await?))
}

async fn schedule_presets() -> ApiResult {
    Ok(ok(profiles::presets()))
}

#[derive(Debug, Deserialize)]
struct DryRunQuery {
    hours: Option<u64>,
}

async fn schedule_dry_run(
    State(state): State<AppState>,
    q: Result<Query<DryRunQuery>, QueryRejection>,
) -> ApiResult {
    let Query(q) = q?;
    let hours = q.hours.unwrap_or(24).clamp(1, 24 * 31);
    let registry = state.registry.clone();
    let upcoming = blocking(move || registry.preview_next_runs(hours, Utc::now())).await?;
    Ok(with_meta(upcoming, json!({ "hours": hours })))
}

#[derive(Debug, Deserialize)]
struct DescribeQuery {
    expression: Option<String>,
}

async fn describe_cron(q: Result<Query<DescribeQuery>, QueryRejection>) -> ApiResult {
    let Query(q) = q?;
    let expression = q
        .expression
        .ok_or_else(|| CoreError::validation("expression", "query parameter is required"))?;
    let description = cron::describe(&expression)?;
    Ok(ok(json!({ "expression": expression, "description": description })))
}

// ---------------------------------------------------------------------------
// Speed tests
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeedTestBody {
    #[serde(default)]
    providers: Option<Vec<String>>,
    #[serde(default)]
    host_endpoint: Option<String>,
    /// Accepts `5201` or `"5201"`.
    #[serde(default)]
    host_port: Option<Value>,
    #[serde(default, rename = "scheduleID")]
    schedule_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct AcceptedRun {
    provider: String,
    run_id: String,
    key: String,
}

fn port_string(v: Option<Value>) -> Result<Option<String>, CoreError> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(CoreError::validation(
            "hostPort",
            format!("expected a number or string, got {other}"),
        )),
    }
}

/// Dispatch one run per requested provider.
///
/// Accepted runs are listed under `data.runs`; the first rejection, if any,
/// is reported in `error`. When nothing was accepted the first rejection
/// decides the status code.
async fn start_speedtest(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let body: SpeedTestBody = if body.iter().all(u8::is_ascii_whitespace) {
        SpeedTestBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| CoreError::validation("body", e.to_string()))?
    };

    let schedule = match body.schedule_id.clone() {
        Some(id) => {
            let registry = state.registry.clone();
            Some(blocking(move || registry.get(&id)).await?)
        }
        None => None,
    };

    let mut host_endpoint = body.host_endpoint.filter(|h| !h.is_empty());
    let mut host_port = port_string(body.host_port)?;
    if let Some(s) = &schedule {
        if host_endpoint.is_none() && host_port.is_none() {
            host_endpoint = s.host_endpoint.clone();
            host_port = s.host_port.clone();
        }
    }

    let names = match body.providers.filter(|p| !p.is_empty()) {
        Some(list) => list,
        None => vec![schedule
            .as_ref()
            .map(|s| s.provider_name.clone())
            .unwrap_or_else(|| LIBRESPEED.to_string())],
    };

    let mut runs = Vec::new();
    let mut errors = Vec::new();
    for name in names {
        let req = DispatchRequest {
            provider_name: name.clone(),
            host_endpoint: host_endpoint.clone(),
            host_port: host_port.clone(),
            schedule_id: schedule.as_ref().map(|s| s.id.clone()),
            trigger: Trigger::Manual,
        };
        match state.dispatcher.try_dispatch(req) {
            Ok(handle) => runs.push(AcceptedRun {
                provider: name,
                run_id: handle.run_id.clone(),
                key: handle.key.to_string(),
            }),
            Err(e) => {
                tracing::info!(provider = %name, error = %e, "manual run rejected");
                errors.push(e);
            }
        }
    }

    if runs.is_empty() {
        let first = errors
            .into_iter()
            .next()
            .unwrap_or_else(|| CoreError::validation("providers", "no provider requested"));
        return Err(first.into());
    }

    let error = errors.first().map(ErrorBody::from);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "runs": runs }, "error": error })),
    )
        .into_response())
}

fn parse_date(field: &'static str, raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, CoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        CoreError::validation(field, format!("expected RFC 3339 or YYYY-MM-DD, got '{raw}'"))
    })?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| CoreError::validation(field, format!("invalid date '{raw}'")))
}

/// Build a filter from repeated query keys such as `servers[]=a&servers[]=b`.
fn result_filter(pairs: Vec<(String, String)>) -> Result<ResultFilter, CoreError> {
    let mut filter = ResultFilter::default();
    for (key, value) in pairs {
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "startDate" => filter.start = Some(parse_date("startDate", &value, false)?),
            "endDate" => filter.end = Some(parse_date("endDate", &value, true)?),
            "servers" | "servers[]" | "server" => filter.servers.push(value),
            "providers" | "providers[]" | "provider" => filter.providers.push(value),
            "scheduleIds" | "scheduleIds[]" | "scheduleID" => filter.schedule_ids.push(value),
            "limit" => filter.limit = value.parse().unwrap_or(DEFAULT_LIMIT),
            "offset" => filter.offset = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    Ok(filter)
}

async fn list_results(
    State(state): State<AppState>,
    q: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> ApiResult {
    let Query(pairs) = q?;
    let filter = result_filter(pairs)?;
    let recorder = state.recorder.clone();
    let (results, total, limit, offset) = blocking(move || {
        let results = recorder.query(&filter)?;
        let total = recorder.count(&filter)?;
        Ok((results, total, filter.effective_limit(), filter.offset))
    })
    .await?;
    Ok(with_meta(
        results,
        json!({ "total": total, "limit": limit, "offset": offset }),
    ))
}

/// One stored result including its provider-native payload.
async fn get_result(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id: i64 = id
        .parse()
        .map_err(|_| CoreError::validation("id", format!("'{id}' is not a result id")))?;
    let recorder = state.recorder.clone();
    let stored = blocking(move || {
        let mut stored = recorder.get(id)?;
        stored.result.raw = recorder.raw_result(id)?;
        Ok(stored)
    })
    .await?;
    Ok(ok(stored))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

async fn recent_runs(
    State(state): State<AppState>,
    q: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let Query(q) = q?;
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 500);
    let history = state.history.clone();
    Ok(ok(blocking(move || history.recent(limit)).await?))
}

// ---------------------------------------------------------------------------
// Providers, servers, settings
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ProviderView {
    id: String,
    #[serde(flatten)]
    meta: ProviderMeta,
    available: bool,
}

async fn list_providers(State(state): State<AppState>) -> ApiResult {
    let pool = state.pool.clone();
    let registry = state.dispatcher.providers();
    let known: Vec<_> = registry
        .names()
        .iter()
        .filter_map(|name| registry.get(name).ok())
        .collect();

    // Availability checks spawn the provider tools.
    let views = blocking(move || {
        let rows = providers::list_providers(&pool)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let provider = known.iter().find(|p| p.meta().name == row.name)?;
                Some(ProviderView {
                    id: row.id,
                    meta: provider.meta(),
                    available: provider.is_available(),
                })
            })
            .collect::<Vec<_>>())
    })
    .await?;
    Ok(ok(views))
}

async fn server_names(State(state): State<AppState>) -> ApiResult {
    let recorder = state.recorder.clone();
    Ok(ok(blocking(move || recorder.server_names()).await?))
}

async fn get_settings(State(state): State<AppState>) -> ApiResult {
    let pool = state.pool.clone();
    Ok(ok(blocking(move || settings::get(&pool)).await?))
}

async fn update_settings(
    State(state): State<AppState>,
    body: Result<Json<SettingsPatch>, JsonRejection>,
) -> ApiResult {
    let Json(patch) = body?;
    let pool = state.pool.clone();
    Ok(ok(blocking(move || settings::update(&pool, patch)).await?))
}
