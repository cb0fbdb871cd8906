//! Prometheus counters for volume operations

use crate::error::Result;
use prometheus::{register_int_counter_vec, IntCounterVec};
use std::sync::OnceLock;

static OPERATIONS: OnceLock<Option<IntCounterVec>> = OnceLock::new();

fn operations() -> Option<&'static IntCounterVec> {
    OPERATIONS
        .get_or_init(|| {
            register_int_counter_vec!(
                "local_volume_operations_total",
                "Volume lifecycle operations by outcome",
                &["operation", "outcome"]
            )
            .ok()
        })
        .as_ref()
}

/// Count one finished operation under its outcome code
pub fn observe<T>(operation: &str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "success".to_string(),
        Err(e) => e.code().to_string(),
    };
    if let Some(counter) = operations() {
        counter.with_label_values(&[operation, outcome.as_str()]).inc();
    }
}
