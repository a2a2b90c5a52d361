use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry,
};

/// Collectors for the whole agent, registered once on the default
/// registry. Exposition is out of scope; these are recorded so a scrape
/// endpoint can be bolted on without touching the core.
pub struct Metrics {
    pub drift_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub orphaned_deleted_total: IntCounter,
    pub pool_queue_depth: IntGaugeVec,
    pub pool_active_workers: IntGaugeVec,
    pub pool_retries_total: IntCounterVec,
    pub pool_panics_total: IntCounterVec,
    pub pool_task_duration_seconds: HistogramVec,
    pub routing_lock_wait_seconds: Histogram,
    pub routing_operation_seconds: Histogram,
    pub routing_operation_failures_total: IntCounter,
}

impl Metrics {
    fn new(registry: &Registry) -> Self {
        let drift_total = IntCounterVec::new(
            Opts::new("multinic_drift_total", "Configuration drift detections by kind"),
            &["kind"],
        )
        .expect("failed to create multinic_drift_total");
        registry
            .register(Box::new(drift_total.clone()))
            .expect("failed to register multinic_drift_total");

        let errors_total = IntCounterVec::new(
            Opts::new("multinic_errors_total", "Interface processing errors by kind"),
            &["kind"],
        )
        .expect("failed to create multinic_errors_total");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("failed to register multinic_errors_total");

        let orphaned_deleted_total = IntCounter::new(
            "multinic_orphaned_interfaces_deleted_total",
            "Orphaned persistence files removed",
        )
        .expect("failed to create multinic_orphaned_interfaces_deleted_total");
        registry
            .register(Box::new(orphaned_deleted_total.clone()))
            .expect("failed to register multinic_orphaned_interfaces_deleted_total");

        let pool_queue_depth = IntGaugeVec::new(
            Opts::new("multinic_pool_queue_depth", "Jobs waiting in the pool queue"),
            &["pool"],
        )
        .expect("failed to create multinic_pool_queue_depth");
        registry
            .register(Box::new(pool_queue_depth.clone()))
            .expect("failed to register multinic_pool_queue_depth");

        let pool_active_workers = IntGaugeVec::new(
            Opts::new("multinic_pool_active_workers", "Workers currently running a job"),
            &["pool"],
        )
        .expect("failed to create multinic_pool_active_workers");
        registry
            .register(Box::new(pool_active_workers.clone()))
            .expect("failed to register multinic_pool_active_workers");

        let pool_retries_total = IntCounterVec::new(
            Opts::new("multinic_pool_retries_total", "Job retries by pool"),
            &["pool"],
        )
        .expect("failed to create multinic_pool_retries_total");
        registry
            .register(Box::new(pool_retries_total.clone()))
            .expect("failed to register multinic_pool_retries_total");

        let pool_panics_total = IntCounterVec::new(
            Opts::new("multinic_pool_panics_total", "Job panics by pool"),
            &["pool"],
        )
        .expect("failed to create multinic_pool_panics_total");
        registry
            .register(Box::new(pool_panics_total.clone()))
            .expect("failed to register multinic_pool_panics_total");

        let pool_task_duration_seconds = HistogramVec::new(
            HistogramOpts::new("multinic_pool_task_duration_seconds", "Job duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["pool", "status"],
        )
        .expect("failed to create multinic_pool_task_duration_seconds");
        registry
            .register(Box::new(pool_task_duration_seconds.clone()))
            .expect("failed to register multinic_pool_task_duration_seconds");

        let routing_lock_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "multinic_routing_lock_wait_seconds",
                "Time spent waiting for the global routing lock",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("failed to create multinic_routing_lock_wait_seconds");
        registry
            .register(Box::new(routing_lock_wait_seconds.clone()))
            .expect("failed to register multinic_routing_lock_wait_seconds");

        let routing_operation_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "multinic_routing_operation_seconds",
                "Duration of routing operations under the lock",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )
        .expect("failed to create multinic_routing_operation_seconds");
        registry
            .register(Box::new(routing_operation_seconds.clone()))
            .expect("failed to register multinic_routing_operation_seconds");

        let routing_operation_failures_total = IntCounter::new(
            "multinic_routing_operation_failures_total",
            "Failed routing operations",
        )
        .expect("failed to create multinic_routing_operation_failures_total");
        registry
            .register(Box::new(routing_operation_failures_total.clone()))
            .expect("failed to register multinic_routing_operation_failures_total");

        Self {
            drift_total,
            errors_total,
            orphaned_deleted_total,
            pool_queue_depth,
            pool_active_workers,
            pool_retries_total,
            pool_panics_total,
            pool_task_duration_seconds,
            routing_lock_wait_seconds,
            routing_operation_seconds,
            routing_operation_failures_total,
        }
    }
}

static METRICS: Lazy<Metrics> = Lazy::new(|| Metrics::new(prometheus::default_registry()));

pub fn metrics() -> &'static Metrics {
    &METRICS
}

pub fn record_drift(kind: &str) {
    metrics().drift_total.with_label_values(&[kind]).inc();
}

pub fn record_error(kind: &str) {
    metrics().errors_total.with_label_values(&[kind]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = metrics().drift_total.with_label_values(&["mtu"]).get();
        record_drift("mtu");
        let after = metrics().drift_total.with_label_values(&["mtu"]).get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_pool_gauges_are_labelled() {
        let gauge = metrics().pool_queue_depth.with_label_values(&["test-pool"]);
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
    }
}
