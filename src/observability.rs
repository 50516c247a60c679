use std::net::SocketAddr;

use crate::engine::EngineError;

// ── Request-driven metrics ──────────────────────────────────────

/// Counter: reservation decisions. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "bayslot_reservations_total";

/// Histogram: time spent inside the per-(bay, date) critical section, seconds.
pub const RESERVE_CRITICAL_SECTION_SECONDS: &str = "bayslot_reserve_critical_section_seconds";

/// Counter: availability reads. Labels: cache (hit, miss).
pub const AVAILABILITY_QUERIES_TOTAL: &str = "bayslot_availability_queries_total";

/// Counter: booking-store queries that hit the deadline.
pub const STORE_TIMEOUTS_TOTAL: &str = "bayslot_store_timeouts_total";

// ── Background work ─────────────────────────────────────────────

/// Gauge: outstanding reservation tokens.
pub const HOLDS_ACTIVE: &str = "bayslot_holds_active";

/// Counter: expired tokens swept by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "bayslot_holds_reaped_total";

/// Counter: cache keys dropped. Labels: cause.
pub const CACHE_INVALIDATIONS_TOTAL: &str = "bayslot_cache_invalidations_total";

/// Counter: per-bay materialization attempts. Labels: status.
pub const MATERIALIZATIONS_TOTAL: &str = "bayslot_materializations_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bayslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bayslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a reservation rejection to a short label for metrics.
pub fn rejection_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::InvalidRange(_) => "invalid_range",
        EngineError::OutsideWorkingHours { .. } => "outside_working_hours",
        EngineError::SlotConflict { .. } => "slot_conflict",
        EngineError::UpstreamTimeout => "upstream_timeout",
        EngineError::MaterializationFailure { .. } => "materialization_failure",
        EngineError::NotFound(_) => "not_found",
        EngineError::AlreadyExists(_) => "already_exists",
        EngineError::TokenExpired(_) => "token_expired",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::Store(_) => "store_error",
        EngineError::WalError(_) => "wal_error",
    }
}
