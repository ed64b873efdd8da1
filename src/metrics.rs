// src/metrics.rs
use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series carry help text on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("fetch_attempts_total", "Feed requests sent, retries included.");
        describe_counter!("fetch_failures_total", "Sources whose fetch failed this run.");
        describe_counter!("fetch_items_total", "Raw items produced by the fetcher.");
        describe_histogram!("fetch_latency_ms", "Successful source fetch time in milliseconds.");
        describe_histogram!("feed_parse_ms", "Feed document parse time in milliseconds.");
        describe_counter!("dedup_clusters_total", "Canonical items produced by deduplication.");
        describe_counter!("dedup_merged_total", "Raw items merged into an existing cluster.");
        describe_counter!("dedup_malformed_total", "Raw items excluded as malformed.");
        describe_counter!("scorer_filtered_total", "Items filtered by the local scorer.");
        describe_counter!("classify_requests_total", "Classification service requests sent.");
        describe_counter!("classify_batches_total", "Classification batches by final outcome.");
        describe_counter!("recovery_layer_total", "Responses parsed, by recovery layer used.");
        describe_gauge!("pipeline_last_run_ts", "Unix ts when the pipeline last finished.");
    });
}

/// Install the Prometheus recorder with its own HTTP listener on `addr`.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    ensure_metrics_described();
    Ok(())
}
