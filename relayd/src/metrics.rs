use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_messages_total",
        "Total telemetry messages received from MQTT"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_invalid_messages_total",
        "Total telemetry messages rejected"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_channel_full_total",
        "Times the telemetry queue was full and the MQTT loop had to wait"
    ))
    .unwrap();
    pub static ref ACKS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_acks_total",
        "Total command acknowledgements received from devices"
    ))
    .unwrap();
    pub static ref COMMANDS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("relayd_commands_total", "Relay commands published, by reason"),
        &["reason"]
    )
    .unwrap();
    pub static ref COMMAND_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_command_failures_total",
        "Relay commands the transport refused"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_store_failures_total",
        "Store operations that failed inside evaluation paths"
    ))
    .unwrap();
    pub static ref TIMERS_FIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_timers_fired_total",
        "Timers that reached their end and fired"
    ))
    .unwrap();
    pub static ref SCHEDULES_APPLIED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_schedules_applied_total",
        "Schedule state changes applied"
    ))
    .unwrap();
    pub static ref CUTOFFS_FIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_cutoffs_fired_total",
        "Energy budget cutoffs that switched a channel off"
    ))
    .unwrap();
    pub static ref TRIPS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relayd_trips_total",
        "Fault trips that latched and switched a device off"
    ))
    .unwrap();
    pub static ref SWEEP_OVERRUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "relayd_sweep_overruns_total",
            "Sweeps that ran longer than their interval (next tick skipped)"
        ),
        &["sweep"]
    )
    .unwrap();
    pub static ref TELEMETRY_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "relayd_telemetry_latency_seconds",
            "Time taken to store and evaluate one telemetry sample"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    )
    .unwrap();
    pub static ref SWEEP_LATENCY_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("relayd_sweep_latency_seconds", "Time taken by one sweep pass")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["sweep"]
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMAND_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TIMERS_FIRED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SCHEDULES_APPLIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CUTOFFS_FIRED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TRIPS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SWEEP_OVERRUNS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TELEMETRY_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(SWEEP_LATENCY_SECONDS.clone()))?;
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
