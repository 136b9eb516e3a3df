//! Prometheus metrics for the queue.
//!
//! Counters only; nothing here reads queue contents.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "durable_queue";

lazy_static! {
    /// Items accepted by `enqueue`, by destination (`store` or `buffer`)
    pub static ref ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_enqueued_total", METRIC_PREFIX),
        "Total items enqueued",
        &["target"]
    ).unwrap();

    /// Items returned by `dequeue`, by source (`store` or `buffer`)
    pub static ref DEQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_dequeued_total", METRIC_PREFIX),
        "Total items dequeued",
        &["source"]
    ).unwrap();

    /// Items replayed from the persistence log
    pub static ref REPLAYED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_replayed_total", METRIC_PREFIX),
        "Total items re-enqueued from the persistence log"
    ).unwrap();

    /// Persist ticks that failed to serialize or write
    pub static ref PERSIST_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_persist_failures_total", METRIC_PREFIX),
        "Total failed persistence log writes"
    ).unwrap();

    /// Failed store round trips
    pub static ref STORE_ERRORS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Total failed store operations"
    ).unwrap();
}

/// Label value for operations served by the durable store
pub const TARGET_STORE: &str = "store";
/// Label value for operations served by the fallback buffer
pub const TARGET_BUFFER: &str = "buffer";
