use prometheus::{histogram_opts, register_histogram_vec, HistogramVec};
use std::sync::LazyLock;

/// Time spent applying a single watch event, bucketed by event type
pub static EVENT_PROCESSING: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "event_processing_duration_seconds",
            "time spent applying a single watch event"
        )
        .namespace("external_db_operator"),
        &["event_type"]
    )
    .expect("metric 'event_processing_duration_seconds' to not be already registered")
});
