use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "backend_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "backend_invalid_messages_total",
        "Total inbound messages dropped as malformed or unroutable"
    ))
    .unwrap();
    pub static ref BASELINE_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "backend_baseline_updates_total",
        "Total hourly samples folded into a baseline"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "backend_db_failures_total",
        "Total failed database operations, including retried ones"
    ))
    .unwrap();
    pub static ref REGISTRATIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "backend_registrations_total",
        "Total devices parked on first sight"
    ))
    .unwrap();
    pub static ref CLAIMS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "backend_claims_total",
        "Total parked devices associated with a user"
    ))
    .unwrap();
    pub static ref SWEEP_REPUBLISHES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "backend_sweep_republishes_total",
        "Total baselines republished by the periodic sweep"
    ))
    .unwrap();
    pub static ref PENDING_SAMPLES: Gauge = Gauge::with_opts(Opts::new(
        "backend_pending_samples",
        "Hourly samples waiting to be persisted after a failed write"
    ))
    .unwrap();
    pub static ref BASELINE_UPDATE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "backend_baseline_update_latency_seconds",
            "Time taken to persist a baseline update"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BASELINE_UPDATES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REGISTRATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CLAIMS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SWEEP_REPUBLISHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PENDING_SAMPLES.clone()))?;
    REGISTRY.register(Box::new(BASELINE_UPDATE_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
