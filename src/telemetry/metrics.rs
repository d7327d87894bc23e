//! Metrics recorded through the `metrics` facade.
//!
//! Nothing is exported unless the embedding application installs a recorder.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

/// Register metric descriptions with the installed recorder.
pub fn init_metrics() {
    describe_counter!("carton_infer_total", "Inference calls by runner and outcome");
    describe_histogram!(
        "carton_infer_latency_ms",
        Unit::Milliseconds,
        "Inference round-trip latency"
    );
    describe_counter!("carton_fetch_total", "Linked file downloads by outcome");
    describe_counter!("carton_cache_hits_total", "Linked files served from cache");
    describe_counter!("carton_runner_launch_total", "Runner launches by runner and outcome");
}

pub fn record_infer(runner: &str, ok: bool, elapsed: Duration) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("carton_infer_total", "runner" => runner.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("carton_infer_latency_ms", "runner" => runner.to_string())
        .record(elapsed.as_secs_f64() * 1000.0);
}

pub fn record_fetch(ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("carton_fetch_total", "outcome" => outcome).increment(1);
}

pub fn record_cache_hit() {
    counter!("carton_cache_hits_total").increment(1);
}

pub fn record_runner_launch(runner: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("carton_runner_launch_total", "runner" => runner.to_string(), "outcome" => outcome)
        .increment(1);
}
