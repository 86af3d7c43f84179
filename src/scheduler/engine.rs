//! Periodic tick loop that turns due schedules into dispatched runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cron;
use super::dispatch::{DispatchRequest, Dispatcher, RunHandle};
use super::registry::ScheduleRegistry;
use crate::error::{CoreError, Result};

#[derive(Clone)]
pub struct SchedulerEngine {
    registry: ScheduleRegistry,
    dispatcher: Dispatcher,
}

impl SchedulerEngine {
    pub fn new(registry: ScheduleRegistry, dispatcher: Dispatcher) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Evaluate every active schedule against `now` and dispatch the due ones.
    ///
    /// A schedule is due when a fire time lies in `(last_evaluated_at, now]`,
    /// with `created_at` standing in for a missing watermark. Several missed
    /// fire times collapse into one run. The watermark advances to `now` for
    /// every evaluated schedule except those whose provider key was busy,
    /// which are picked up again on the next tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<RunHandle>> {
        let registry = self.registry.clone();
        let schedules = tokio::task::spawn_blocking(move || registry.list_active()).await??;

        let mut handles = Vec::new();
        let mut evaluated = Vec::with_capacity(schedules.len());

        for schedule in schedules {
            let last = schedule.last_evaluated_at.unwrap_or(schedule.created_at);
            let due = match cron::is_due(&schedule.cron_expression, last, now) {
                Ok(due) => due,
                Err(e) => {
                    warn!(schedule = %schedule.id, error = %e, "skipping schedule with invalid cron expression");
                    evaluated.push(schedule.id);
                    continue;
                }
            };
            if !due {
                evaluated.push(schedule.id);
                continue;
            }

            info!(schedule = %schedule.id, name = %schedule.name, "schedule due");
            match self.dispatcher.try_dispatch(DispatchRequest::for_schedule(&schedule)) {
                Ok(handle) => {
                    handles.push(handle);
                    evaluated.push(schedule.id);
                }
                Err(CoreError::ProviderBusy { key }) => {
                    info!(schedule = %schedule.id, provider = %key, "provider busy, retrying next tick");
                }
                Err(e) => {
                    error!(schedule = %schedule.id, error = %e, "dispatch failed");
                    evaluated.push(schedule.id);
                }
            }
        }

        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || registry.mark_evaluated(&evaluated, now)).await??;

        Ok(handles)
    }
}

/// Main scheduler execution loop. Runs until `shutdown` is cancelled.
///
/// Errors from a tick are logged and the loop carries on.
pub async fn run_scheduler_loop(
    engine: SchedulerEngine,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "scheduler engine started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match engine.tick(Utc::now()).await {
                    Ok(handles) if !handles.is_empty() => {
                        debug!(dispatched = handles.len(), "tick dispatched runs");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "scheduler tick failed"),
                }
            }
        }
    }

    info!("scheduler engine stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::history::RunStatus;
    use crate::scheduler::NewSchedule;
    use crate::storage::{providers, temp_pool};
    use crate::throughput::provider::{
        ProviderKind, ProviderMeta, ProviderRegistry, SpeedTestProvider, SpeedTestRequest,
        SpeedTestResult,
    };
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use tokio::sync::Notify;

    struct StubProvider {
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl SpeedTestProvider for StubProvider {
        fn meta(&self) -> ProviderMeta {
            ProviderMeta {
                name: "librespeed",
                display_name: "stub",
                kind: ProviderKind::PublicWAN,
                requires_host: false,
                description: "",
                install_hint: "",
            }
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn run(&self, _req: &SpeedTestRequest) -> anyhow::Result<SpeedTestResult> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(SpeedTestResult::now())
        }
    }

    fn engine(gate: Option<Arc<Notify>>) -> (tempfile::TempDir, SchedulerEngine) {
        let (dir, pool) = temp_pool();
        providers::sync_providers(&pool, ["librespeed"]).unwrap();
        let registry = ProviderRegistry::new().with(Arc::new(StubProvider { gate }));
        let dispatcher = Dispatcher::new(pool.clone(), Arc::new(registry), Duration::from_secs(5));
        (dir, SchedulerEngine::new(ScheduleRegistry::new(pool), dispatcher))
    }

    /// A future instant at :30 with whole milliseconds, so it survives the
    /// storage encoding unchanged and sits between minute fire times.
    fn future(minutes: i64) -> DateTime<Utc> {
        use chrono::Timelike;
        (Utc::now() + ChronoDuration::minutes(minutes))
            .with_second(30)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap()
    }

    fn every_minute(e: &SchedulerEngine, name: &str) -> String {
        e.registry
            .create(NewSchedule {
                name: name.into(),
                cron_expression: "* * * * *".into(),
                provider_name: Some("librespeed".into()),
                is_active: true,
                ..Default::default()
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_not_due_before_first_fire() {
        let (_dir, e) = engine(None);
        let id = every_minute(&e, "a");
        let created = e.registry.get(&id).unwrap().created_at;

        // Same instant as creation: no fire time in (created, created].
        assert!(e.tick(created).await.unwrap().is_empty());
        assert_eq!(e.registry.get(&id).unwrap().last_evaluated_at, Some(created));
    }

    #[tokio::test]
    async fn test_due_schedule_dispatches_once() {
        let (_dir, e) = engine(None);
        let id = every_minute(&e, "a");
        let now = future(5);

        let handles = e.tick(now).await.unwrap();
        assert_eq!(handles.len(), 1, "missed fires collapse into one run");
        let entry = handles.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(entry.status, RunStatus::Success);
        assert_eq!(entry.schedule_id.as_deref(), Some(id.as_str()));

        // Watermark moved to `now`; the same instant is not due again.
        assert!(e.tick(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_schedule_is_skipped() {
        let (_dir, e) = engine(None);
        let id = every_minute(&e, "a");
        e.registry.set_active(&id, false).unwrap();
        let now = future(5);
        assert!(e.tick(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resumed_schedule_skips_fires_missed_while_paused() {
        let (_dir, e) = engine(None);
        let id = e
            .registry
            .create(NewSchedule {
                name: "new year".into(),
                cron_expression: "0 0 1 1 *".into(),
                provider_name: Some("librespeed".into()),
                is_active: true,
                ..Default::default()
            })
            .unwrap()
            .id;

        // Last evaluated more than a year ago, so a fire time has passed since.
        let stale = Utc::now() - ChronoDuration::days(400);
        e.registry.mark_evaluated(&[id.clone()], stale).unwrap();
        e.registry.set_active(&id, false).unwrap();
        e.registry.set_active(&id, true).unwrap();

        assert!(e.tick(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_busy_provider_keeps_watermark() {
        let gate = Arc::new(Notify::new());
        let (_dir, e) = engine(Some(gate.clone()));
        let a = every_minute(&e, "a");
        std::thread::sleep(Duration::from_millis(5));
        let b = every_minute(&e, "b");
        let now = future(2);

        // Both share the librespeed key, so only the first one runs.
        let handles = e.tick(now).await.unwrap();
        assert_eq!(handles.len(), 1);

        let wm_a = e.registry.get(&a).unwrap().last_evaluated_at;
        let wm_b = e.registry.get(&b).unwrap().last_evaluated_at;
        assert_eq!(wm_a, Some(now));
        assert_eq!(wm_b, None, "busy schedule retries next tick");

        gate.notify_one();
        for h in handles {
            h.wait().await.unwrap();
        }

        let later = now + ChronoDuration::seconds(1);
        let handles = e.tick(later).await.unwrap();
        assert_eq!(handles.len(), 1, "the skipped schedule runs now");
        gate.notify_one();
        let entry = handles.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(entry.schedule_id.as_deref(), Some(b.as_str()));
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let (_dir, e) = engine(None);
        let token = CancellationToken::new();
        let task = tokio::spawn(run_scheduler_loop(e, Duration::from_millis(10), token.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
