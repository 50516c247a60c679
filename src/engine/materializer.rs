use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::model::*;

use super::{Engine, EngineError};

/// Bays computed concurrently by one materialization run.
const MATERIALIZE_CONCURRENCY: usize = 8;

#[derive(Debug)]
pub struct MaterializationReport {
    pub date: NaiveDate,
    pub succeeded: Vec<BayId>,
    /// Each entry is a `MaterializationFailure`.
    pub failed: Vec<(BayId, EngineError)>,
}

impl MaterializationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Engine {
    /// Recompute one (bay, date) from the schedule and booking store, bypassing
    /// whatever is cached, and store the fresh result.
    pub async fn regenerate(&self, bay_id: BayId, date: NaiveDate) -> Result<Arc<AvailabilityResult>, EngineError> {
        self.check_query_horizon(date)?;
        let key = SlotKey::new(bay_id, date);
        self.invalidate_key(key, "regenerate");
        let epoch = self.cache.epoch(&key);
        let result = Arc::new(self.compute_result(bay_id, date).await?);
        self.cache.store_if_current(key, epoch, result.clone());
        Ok(result)
    }

    /// Regenerate `date` for every active bay. One bay failing never stops the others.
    pub async fn materialize_day(&self, date: NaiveDate) -> MaterializationReport {
        let bays = self.resolver.store().active_bays();
        let outcomes: Vec<(BayId, Result<Arc<AvailabilityResult>, EngineError>)> = futures::stream::iter(bays)
            .map(move |bay_id| async move { (bay_id, self.regenerate(bay_id, date).await) })
            .buffer_unordered(MATERIALIZE_CONCURRENCY)
            .collect()
            .await;

        let mut report = MaterializationReport {
            date,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for (bay_id, outcome) in outcomes {
            match outcome {
                Ok(_) => {
                    metrics::counter!(crate::observability::MATERIALIZATIONS_TOTAL, "status" => "ok").increment(1);
                    report.succeeded.push(bay_id);
                }
                Err(e) => {
                    warn!("materialization of bay {bay_id} for {date} failed: {e}");
                    metrics::counter!(crate::observability::MATERIALIZATIONS_TOTAL, "status" => "failed").increment(1);
                    report.failed.push((
                        bay_id,
                        EngineError::MaterializationFailure {
                            bay_id,
                            reason: e.to_string(),
                        },
                    ));
                }
            }
        }
        report.succeeded.sort();
        report.failed.sort_by_key(|(bay_id, _)| *bay_id);
        report
    }

    /// Materialize the day after today (branch-local).
    pub async fn materialize_next_day(&self) -> Result<MaterializationReport, EngineError> {
        let tomorrow = self
            .today()?
            .succ_opt()
            .ok_or_else(|| EngineError::InvalidRange("calendar overflow".into()))?;
        Ok(self.materialize_day(tomorrow).await)
    }
}

/// Time from `now_ms` until the next `at` wall-clock time in `tz`.
/// A target inside a DST gap or fold moves one minute later and takes the
/// latest matching instant.
pub fn duration_until(at: NaiveTime, tz: Tz, now_ms: Ms) -> Duration {
    let fallback = Duration::from_secs(60);
    let Some(now) = tz.timestamp_millis_opt(now_ms).single() else {
        return fallback;
    };
    let today = now.date_naive();
    let target_date = if now.time() >= at {
        match today.succ_opt() {
            Some(d) => d,
            None => return fallback,
        }
    } else {
        today
    };

    let target = target_date
        .and_time(at)
        .and_local_timezone(tz)
        .single()
        .or_else(|| {
            (target_date.and_time(at) + chrono::Duration::minutes(1))
                .and_local_timezone(tz)
                .latest()
        });
    let Some(target) = target else {
        error!("cannot resolve {target_date} {at} in {tz}, retrying in an hour");
        return Duration::from_secs(3_600);
    };

    let until = target.signed_duration_since(now);
    if until.num_milliseconds() <= 0 {
        fallback
    } else {
        until.to_std().unwrap_or(fallback)
    }
}

/// Daily job: materialize tomorrow at `materialize_at` branch-local time.
/// If the service starts after today's fire time, it catches up immediately.
pub async fn run_materializer(engine: Arc<Engine>, shutdown: CancellationToken) {
    let at = engine.config().materialize_at;
    let tz = engine.calendar().timezone();
    info!("materializer started (daily at {} {tz})", at.format("%H:%M"));

    if let Ok(today) = engine.today()
        && let Ok(fire_at) = engine.calendar().local_instant(today, at)
        && engine.now() >= fire_at
    {
        fire(&engine).await;
    }

    loop {
        let sleep = duration_until(at, tz, engine.now());
        info!("next materialization in {} minutes", sleep.as_secs() / 60);
        tokio::select! {
            _ = tokio::time::sleep(sleep) => fire(&engine).await,
            _ = shutdown.cancelled() => {
                info!("materializer received shutdown signal");
                return;
            }
        }
    }
}

async fn fire(engine: &Engine) {
    match engine.materialize_next_day().await {
        Ok(report) => info!(
            "materialized {}: {} bays ok, {} failed",
            report.date,
            report.succeeded.len(),
            report.failed.len()
        ),
        Err(e) => error!("materialization run failed: {e}"),
    }
    if let Ok(today) = engine.today() {
        let pruned = engine.cache.prune_before(today);
        if pruned > 0 {
            info!("pruned {pruned} cached days before {today}");
        }
    }
}
