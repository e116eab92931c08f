use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref EVALS_ENQUEUED: IntCounter = IntCounter::with_opts(Opts::new(
        "caravel_broker_evals_enqueued_total",
        "Evaluations offered to the broker",
    ))
    .unwrap();
    pub static ref EVALS_BLOCKED: IntGauge = IntGauge::with_opts(Opts::new(
        "caravel_blocked_evals",
        "Evaluations currently blocked on capacity",
    ))
    .unwrap();
    pub static ref PLANS_COMMITTED: IntCounter = IntCounter::with_opts(Opts::new(
        "caravel_plan_commits_total",
        "Plans committed by the plan-apply pipeline",
    ))
    .unwrap();
    pub static ref PLAN_NODE_REJECTIONS: IntCounter = IntCounter::with_opts(Opts::new(
        "caravel_plan_node_rejections_total",
        "Per-node feasibility rejections during plan-apply",
    ))
    .unwrap();
    pub static ref PLAN_APPLY_SECONDS: Histogram = Histogram::with_opts(HistogramOpts::new(
        "caravel_plan_apply_seconds",
        "Wall time of one plan application",
    ))
    .unwrap();
    pub static ref HEARTBEATS_EXPIRED: IntCounter = IntCounter::with_opts(Opts::new(
        "caravel_heartbeats_expired_total",
        "Node heartbeats that expired and triggered invalidation",
    ))
    .unwrap();
    pub static ref PERIODIC_LAUNCHES: IntCounter = IntCounter::with_opts(Opts::new(
        "caravel_periodic_launches_total",
        "Periodic job instances dispatched",
    ))
    .unwrap();
    pub static ref PERIODIC_SKIPPED_OVERLAP: IntCounter = IntCounter::with_opts(Opts::new(
        "caravel_periodic_skipped_overlap_total",
        "Periodic launches skipped due to a still-running child",
    ))
    .unwrap();
}

/// Registers every server metric into a fresh registry, returned for the
/// metrics endpoint of the deployment layer.
pub fn register_all() -> Registry {
    let registry = Registry::new();
    registry.register(Box::new(EVALS_ENQUEUED.clone())).unwrap();
    registry.register(Box::new(EVALS_BLOCKED.clone())).unwrap();
    registry.register(Box::new(PLANS_COMMITTED.clone())).unwrap();
    registry
        .register(Box::new(PLAN_NODE_REJECTIONS.clone()))
        .unwrap();
    registry
        .register(Box::new(PLAN_APPLY_SECONDS.clone()))
        .unwrap();
    registry
        .register(Box::new(HEARTBEATS_EXPIRED.clone()))
        .unwrap();
    registry
        .register(Box::new(PERIODIC_LAUNCHES.clone()))
        .unwrap();
    registry
        .register(Box::new(PERIODIC_SKIPPED_OVERLAP.clone()))
        .unwrap();
    registry
}
