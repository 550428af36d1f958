use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static TRANSACTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_transactions_total", "Cache transactions by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_transactions_total");
    vec
});

static TRANSACTION_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "cache_transaction_duration_seconds",
        "Time from binding a transaction to closing it",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["outcome"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_transaction_duration_seconds");
    vec
});

static TRANSACTIONS_INFLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "cache_transactions_inflight",
        "Transactions currently bound to a cache object",
    )
    .expect("create cache_transactions_inflight");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_transactions_inflight");
    gauge
});

static CONDITIONAL_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_conditional_requests_total",
        "Upstream requests by conditional kind",
    );
    let vec = IntCounterVec::new(opts, &["kind"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_conditional_requests_total");
    vec
});

static DESCRIPTORS_COMMITTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_descriptors_committed_total",
        "Descriptors written to the metadata store",
    )
    .expect("create cache_descriptors_committed_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_descriptors_committed_total");
    counter
});

static SWEEP_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_sweep_runs_total", "Integrity sweep passes run");
    let vec = IntCounterVec::new(opts, &["pass"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_sweep_runs_total");
    vec
});

static SWEEP_ENTRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_sweep_entries_total",
        "Integrity sweep entries by pass and result",
    );
    let vec = IntCounterVec::new(opts, &["pass", "result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_sweep_entries_total");
    vec
});

static SWEEP_BYTES_RECLAIMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_sweep_bytes_reclaimed_total",
        "Bytes deleted by pruning sweeps",
    )
    .expect("create cache_sweep_bytes_reclaimed_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_bytes_reclaimed_total");
    counter
});

fn latency_buckets() -> Vec<f64> {
    // Transactions include the upstream exchange, so the tail is long.
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0,
    ]
}

pub fn inc_inflight() {
    TRANSACTIONS_INFLIGHT.inc();
}

pub fn dec_inflight() {
    TRANSACTIONS_INFLIGHT.dec();
}

pub fn record_transaction(outcome: &str, elapsed: Duration) {
    TRANSACTIONS_TOTAL.with_label_values(&[outcome]).inc();
    TRANSACTION_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(elapsed.as_secs_f64());
}

pub fn record_conditional(kind: &str) {
    CONDITIONAL_REQUESTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_descriptor_commit() {
    DESCRIPTORS_COMMITTED_TOTAL.inc();
}

pub fn record_sweep_run(pass: &str) {
    SWEEP_RUNS_TOTAL.with_label_values(&[pass]).inc();
}

pub fn record_sweep_entry(pass: &str, result: &str) {
    SWEEP_ENTRIES_TOTAL.with_label_values(&[pass, result]).inc();
}

pub fn record_sweep_reclaimed(bytes: u64) {
    if bytes > 0 {
        SWEEP_BYTES_RECLAIMED_TOTAL.inc_by(bytes);
    }
}

pub fn gather() -> Result<Vec<u8>> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String> {
    String::from_utf8(gather()?).context("metrics exposition is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_basic_metrics() {
        record_transaction("stored", Duration::from_millis(10));
        record_conditional("resume");
        record_descriptor_commit();
        record_sweep_entry("files", "orphan");
        record_sweep_reclaimed(400);
        let text = render().expect("render");
        assert!(
            text.contains("cache_transactions_total"),
            "expected cache_transactions_total in metrics output"
        );
        assert!(
            text.contains("cache_conditional_requests_total{kind=\"resume\"}"),
            "expected conditional kind label in metrics output"
        );
        assert!(
            text.contains("cache_sweep_bytes_reclaimed_total"),
            "expected cache_sweep_bytes_reclaimed_total in metrics output"
        );
    }
}
