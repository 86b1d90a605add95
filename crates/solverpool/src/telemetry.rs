//! Pool metrics.
//!
//! With the `metrics` feature enabled, counters and histograms are recorded
//! through the OpenTelemetry global meter. The embedding process owns the
//! meter provider and its exporters; until one is installed the global meter
//! is a no-op. Without the feature every function below compiles to nothing.

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "metrics")]
struct Handles {
    items_dispatched: Counter<u64>,
    items_failed: Counter<u64>,
    worker_crashes: Counter<u64>,
    worker_restarts: Counter<u64>,
    item_duration_ms: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static HANDLES: OnceLock<Handles> = OnceLock::new();

#[cfg(feature = "metrics")]
fn handles() -> &'static Handles {
    HANDLES.get_or_init(|| {
        let meter = opentelemetry::global::meter("solverpool");
        Handles {
            items_dispatched: meter
                .u64_counter("items_dispatched")
                .with_description("Work item attempts handed to a worker")
                .build(),
            items_failed: meter
                .u64_counter("items_failed")
                .with_description("Work items that ended in an error")
                .build(),
            worker_crashes: meter
                .u64_counter("worker_crashes")
                .with_description("Workers lost to a crash, timeout or failed heartbeat")
                .build(),
            worker_restarts: meter
                .u64_counter("worker_restarts")
                .with_description("Workers successfully replaced")
                .build(),
            item_duration_ms: meter
                .f64_histogram("item_duration")
                .with_unit("ms")
                .with_description("Wall time of one item attempt")
                .build(),
        }
    })
}

#[cfg(feature = "metrics")]
pub fn increment_items_dispatched() {
    handles().items_dispatched.add(1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_items_dispatched() {}

#[cfg(feature = "metrics")]
pub fn increment_items_failed() {
    handles().items_failed.add(1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_items_failed() {}

#[cfg(feature = "metrics")]
pub fn increment_worker_crashes() {
    handles().worker_crashes.add(1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_worker_crashes() {}

#[cfg(feature = "metrics")]
pub fn increment_worker_restarts() {
    handles().worker_restarts.add(1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_worker_restarts() {}

#[cfg(feature = "metrics")]
pub fn record_item_duration(duration_ms: f64) {
    handles().item_duration_ms.record(duration_ms, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn record_item_duration(_duration_ms: f64) {}
