//! Metrics module
//!
//! Prometheus collectors for the control plane, exposed on `/metrics` by the
//! REST server.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::domain::model::VolumeState;

static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("couchestor".to_string()), None)
        .expect("failed to initialise couchestor metrics registry")
});

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    REGISTRY
        .register(Box::new(collector.clone()))
        .expect("failed to register couchestor metric collector");
    collector
}

static CSI_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "CSI requests grouped by method and result")
        .subsystem("csi");
    let counter = IntCounterVec::new(opts, &["method", "result"])
        .expect("failed to build csi request counter");
    register_collector(counter)
});

static CSI_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "request_duration_seconds",
        "Latency distribution for CSI requests",
    )
    .subsystem("csi")
    .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]);
    let histogram = HistogramVec::new(opts, &["method"])
        .expect("failed to build csi request histogram");
    register_collector(histogram)
});

static NODE_RPCS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "node_rpcs_total",
        "Node agent commands grouped by command and result",
    )
    .subsystem("bus");
    let counter = IntCounterVec::new(opts, &["command", "result"])
        .expect("failed to build node rpc counter");
    register_collector(counter)
});

static RECONCILE_TICKS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("ticks_total", "Completed reconciliation passes").subsystem("reconciler");
    let counter = IntCounter::with_opts(opts).expect("failed to build reconcile tick counter");
    register_collector(counter)
});

static REPAIRS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("repairs_total", "Replica repairs grouped by outcome")
        .subsystem("reconciler");
    let counter =
        IntCounterVec::new(opts, &["outcome"]).expect("failed to build repair counter");
    register_collector(counter)
});

static VOLUMES: Lazy<IntGaugeVec> = Lazy::new(|| {
    let opts = Opts::new("volumes", "Number of volumes grouped by state");
    let gauge = IntGaugeVec::new(opts, &["state"]).expect("failed to build volume state gauge");
    register_collector(gauge)
});

static ONLINE_NODES: Lazy<IntGauge> = Lazy::new(|| {
    let opts = Opts::new("online_nodes", "Number of storage nodes currently online");
    let gauge = IntGauge::with_opts(opts).expect("failed to build online node gauge");
    register_collector(gauge)
});

pub fn record_csi_request(method: &str, result: &str, elapsed: std::time::Duration) {
    CSI_REQUESTS_TOTAL.with_label_values(&[method, result]).inc();
    CSI_REQUEST_DURATION
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
}

pub fn record_node_rpc(command: &str, result: &str) {
    NODE_RPCS_TOTAL.with_label_values(&[command, result]).inc();
}

pub fn record_reconcile_tick() {
    RECONCILE_TICKS_TOTAL.inc();
}

/// `outcome` is one of `started`, `completed` or `failed`.
pub fn record_repair(outcome: &str) {
    REPAIRS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_volume_counts(counts: &[(VolumeState, usize)]) {
    for state in [
        VolumeState::Creating,
        VolumeState::Online,
        VolumeState::Degraded,
        VolumeState::Faulted,
        VolumeState::Destroying,
    ] {
        let count = counts
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, c)| *c)
            .unwrap_or(0);
        let label = state.to_string();
        VOLUMES.with_label_values(&[label.as_str()]).set(count as i64);
    }
}

pub fn set_online_nodes(count: usize) {
    ONLINE_NODES.set(count as i64);
}

/// Render all collectors in the Prometheus text format.
pub fn gather() -> crate::error::Result<(String, Vec<u8>)> {
    // Touch lazies so every family shows up even before first use.
    Lazy::force(&CSI_REQUESTS_TOTAL);
    Lazy::force(&NODE_RPCS_TOTAL);
    Lazy::force(&RECONCILE_TICKS_TOTAL);
    Lazy::force(&REPAIRS_TOTAL);
    Lazy::force(&VOLUMES);
    Lazy::force(&ONLINE_NODES);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| crate::error::Error::Internal(format!("metrics encoding failed: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}
