//! Monitoring
//!
//! Health aggregation for the cache manager and Prometheus exposition of
//! its statistics. The binary serves both over HTTP.

mod export;
mod health;

pub use export::{render_prometheus, METRIC_PREFIX};
pub use health::{
    HealthCheckResult, HealthReport, HealthStatus, ProcessHealth, DEGRADED_PASS_RATIO,
};
