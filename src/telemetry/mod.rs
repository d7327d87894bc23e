//! Structured logging and metrics.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    init_metrics, record_cache_hit, record_fetch, record_infer, record_runner_launch,
};
