use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, TextEncoder,
};

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: C, name: &str) -> C {
    if let Err(err) = prometheus::default_registry().register(Box::new(collector.clone())) {
        tracing::warn!(metric = name, error = %err, "failed to register metric");
    }
    collector
}

static EVENTS_CONSUMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "projection_events_consumed_total",
            "Change events read from the source",
        ),
        &["partition"],
    )
    .expect("failed to create projection_events_consumed_total");
    register(counter, "projection_events_consumed_total")
});

static EVENTS_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "projection_events_dropped_total",
            "Undecodable change events skipped",
        ),
        &["reason"],
    )
    .expect("failed to create projection_events_dropped_total");
    register(counter, "projection_events_dropped_total")
});

static EVENTS_FILTERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "projection_events_filtered_total",
            "Change events that produced no index operation",
        ),
        &["reason"],
    )
    .expect("failed to create projection_events_filtered_total");
    register(counter, "projection_events_filtered_total")
});

static EVENTS_STALE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "projection_events_stale_total",
            "Operations skipped because a newer version was already applied",
        ),
        &["detected_by"],
    )
    .expect("failed to create projection_events_stale_total");
    register(counter, "projection_events_stale_total")
});

static BATCH_FLUSH_SIZE: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "projection_batch_flush_size",
            "Index operations per flushed batch",
        )
        .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
    )
    .expect("failed to create projection_batch_flush_size");
    register(histogram, "projection_batch_flush_size")
});

static BATCH_FLUSH_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "projection_batch_flush_duration_seconds",
            "Time to apply and commit one batch",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
    )
    .expect("failed to create projection_batch_flush_duration_seconds");
    register(histogram, "projection_batch_flush_duration_seconds")
});

static WRITE_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "projection_write_retries_total",
        "Index operations re-sent after a transient failure",
    )
    .expect("failed to create projection_write_retries_total");
    register(counter, "projection_write_retries_total")
});

static RETRY_EXHAUSTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "projection_retry_exhausted_total",
            "Batches whose retries ran out, per blocked partition",
        ),
        &["partition"],
    )
    .expect("failed to create projection_retry_exhausted_total");
    register(counter, "projection_retry_exhausted_total")
});

static COMMITTED_OFFSET: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "projection_committed_offset",
            "Last committed source offset per partition",
        ),
        &["partition"],
    )
    .expect("failed to create projection_committed_offset");
    register(gauge, "projection_committed_offset")
});

static LANE_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "projection_lane_state",
            "Lane state (0 starting, 1 running, 2 backoff, 3 draining, 4 stopped, 5 failed)",
        ),
        &["lane"],
    )
    .expect("failed to create projection_lane_state");
    register(gauge, "projection_lane_state")
});

static NOTIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "projection_notifications_total",
            "Fan-out notifications by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create projection_notifications_total");
    register(counter, "projection_notifications_total")
});

static ENRICHMENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "projection_enrichment_total",
            "Quality enrichment results by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create projection_enrichment_total");
    register(counter, "projection_enrichment_total")
});

pub fn record_consumed(partition: i32) {
    EVENTS_CONSUMED_TOTAL
        .with_label_values(&[&partition.to_string()])
        .inc();
}

pub fn record_dropped(reason: &str) {
    EVENTS_DROPPED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_filtered(reason: &str) {
    EVENTS_FILTERED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_stale(detected_by: &str, count: u64) {
    EVENTS_STALE_TOTAL
        .with_label_values(&[detected_by])
        .inc_by(count);
}

pub fn observe_flush(size: usize, elapsed: Duration) {
    BATCH_FLUSH_SIZE.observe(size as f64);
    BATCH_FLUSH_DURATION_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_write_retries(count: usize) {
    WRITE_RETRIES_TOTAL.inc_by(count as u64);
}

pub fn record_retry_exhausted(partition: i32) {
    RETRY_EXHAUSTED_TOTAL
        .with_label_values(&[&partition.to_string()])
        .inc();
}

pub fn set_committed_offset(partition: i32, offset: i64) {
    COMMITTED_OFFSET
        .with_label_values(&[&partition.to_string()])
        .set(offset);
}

pub fn set_lane_state(lane: usize, code: i64) {
    LANE_STATE.with_label_values(&[&lane.to_string()]).set(code);
}

pub fn record_notification(outcome: &str) {
    NOTIFICATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_enrichment(outcome: &str) {
    ENRICHMENT_TOTAL.with_label_values(&[outcome]).inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
