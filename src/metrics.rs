//! Prometheus metrics (spec §9 ambient concerns), grounded on the donor
//! sidecar's `ApiMetrics` facade and `run_metrics_server` bootstrap.

use std::net::SocketAddr;
use std::time::Duration;

use eyre::{bail, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

const REGISTRATIONS_TOTAL: &str = "registrations_total";
const REGISTRATION_DURATION_SECONDS: &str = "registration_duration_seconds";
const TILES_WRITTEN_TOTAL: &str = "tiles_written_total";
const APPEND_CONFLICT_RETRIES_TOTAL: &str = "append_conflict_retries_total";
const CHECKPOINT_TREE_SIZE: &str = "checkpoint_tree_size";

/// Metrics for the registration pipeline and tile log.
#[derive(Debug, Clone, Copy)]
pub struct ApiMetrics;

impl ApiMetrics {
    pub fn describe_all() {
        describe_counter!(REGISTRATIONS_TOTAL, "Total number of registration attempts, by outcome");
        describe_histogram!(
            REGISTRATION_DURATION_SECONDS,
            "Duration of a full register() call, in seconds"
        );
        describe_counter!(TILES_WRITTEN_TOTAL, "Total number of tile blobs written");
        describe_counter!(
            APPEND_CONFLICT_RETRIES_TOTAL,
            "Total number of dedupe-and-persist retries due to serialization conflicts"
        );
        describe_gauge!(CHECKPOINT_TREE_SIZE, "tree_size of the most recently published checkpoint");
    }

    pub fn increment_registrations(outcome: &'static str) {
        counter!(REGISTRATIONS_TOTAL, &[("outcome", outcome)]).increment(1);
    }

    pub fn observe_registration_duration(duration: Duration) {
        histogram!(REGISTRATION_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    pub fn increment_tiles_written() {
        counter!(TILES_WRITTEN_TOTAL).increment(1);
    }

    pub fn increment_append_conflict_retries() {
        counter!(APPEND_CONFLICT_RETRIES_TOTAL).increment(1);
    }

    pub fn set_checkpoint_tree_size(size: u64) {
        gauge!(CHECKPOINT_TREE_SIZE).set(size as f64);
    }
}

/// Stand up the Prometheus HTTP exporter on its own bound address, separate
/// from the main HTTP surface.
pub fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    let builder = PrometheusBuilder::new().with_http_listener(addr);
    if let Err(e) = builder.install() {
        bail!("failed to install prometheus exporter: {e:?}");
    }
    info!("metrics server listening on http://{addr}");
    ApiMetrics::describe_all();
    Ok(())
}
