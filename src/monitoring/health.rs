//! Health Checks
//!
//! Cache health aggregation plus the process liveness/readiness flags served
//! by the binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Share of passing checks needed for `Degraded` rather than `Unhealthy`
pub const DEGRADED_PASS_RATIO: f64 = 0.75;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every check passes
    Healthy,
    /// Most checks pass
    Degraded,
    /// Too many checks fail
    Unhealthy,
    /// The checks themselves could not run
    Error,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Check if status is healthy
    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Error => write!(f, "error"),
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Message
    pub message: Option<String>,
    /// Duration of check
    pub duration_ms: u64,
}

impl HealthCheckResult {
    /// Create a passing result
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: None,
            duration_ms: 0,
        }
    }

    /// Create a failing result
    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Pass or fail depending on `ok`
    pub fn check(name: impl Into<String>, ok: bool, failure: impl Into<String>) -> Self {
        if ok {
            Self::pass(name)
        } else {
            Self::fail(name, failure)
        }
    }

    /// Set duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Overall cache health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Individual check results
    pub checks: Vec<HealthCheckResult>,
    /// Derived 0-100 score
    pub score: f64,
    /// Error that prevented the checks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
}

impl HealthReport {
    /// Aggregate checks: all pass is healthy, at least 75% degraded,
    /// anything less unhealthy
    pub fn from_checks(checks: Vec<HealthCheckResult>, score: f64, uptime: Duration) -> Self {
        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();
        let status = if passed == total {
            HealthStatus::Healthy
        } else if passed as f64 / total as f64 >= DEGRADED_PASS_RATIO {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        Self {
            status,
            checks,
            score,
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }

    /// Report for checks that could not run
    pub fn error(message: impl Into<String>, uptime: Duration) -> Self {
        Self {
            status: HealthStatus::Error,
            checks: Vec::new(),
            score: 0.0,
            error: Some(message.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }

    pub fn passed(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }
}

/// Process liveness and readiness flags
pub struct ProcessHealth {
    /// Start time
    start_time: Instant,
    /// Liveness flag
    live: AtomicBool,
    /// Readiness flag
    ready: AtomicBool,
}

impl ProcessHealth {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    /// Get uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}

impl Default for ProcessHealth {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(pass: usize, fail: usize) -> Vec<HealthCheckResult> {
        (0..pass)
            .map(|i| HealthCheckResult::pass(format!("ok{}", i)))
            .chain((0..fail).map(|i| HealthCheckResult::fail(format!("bad{}", i), "failing")))
            .collect()
    }

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(HealthStatus::Healthy.is_operational());
        assert!(!HealthStatus::Degraded.is_healthy());
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Unhealthy.is_operational());
        assert!(!HealthStatus::Error.is_operational());
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(format!("{}", HealthStatus::Healthy), "healthy");
        assert_eq!(format!("{}", HealthStatus::Error), "error");
    }

    #[test]
    fn test_majority_rule() {
        let uptime = Duration::from_secs(1);
        assert_eq!(HealthReport::from_checks(checks(4, 0), 100.0, uptime).status, HealthStatus::Healthy);
        assert_eq!(HealthReport::from_checks(checks(3, 1), 80.0, uptime).status, HealthStatus::Degraded);
        assert_eq!(HealthReport::from_checks(checks(2, 2), 50.0, uptime).status, HealthStatus::Unhealthy);
        assert_eq!(HealthReport::from_checks(Vec::new(), 100.0, uptime).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_check_constructor() {
        let ok = HealthCheckResult::check("l1_usage", true, "full");
        assert!(ok.passed);
        assert!(ok.message.is_none());

        let bad = HealthCheckResult::check("l1_usage", false, "full");
        assert_eq!(bad.message.as_deref(), Some("full"));
    }

    #[test]
    fn test_error_report() {
        let report = HealthReport::error("stats unavailable", Duration::from_secs(60));
        assert_eq!(report.status, HealthStatus::Error);
        assert_eq!(report.uptime_seconds, 60);
        assert_eq!(report.passed(), 0);
    }

    #[test]
    fn test_process_flags() {
        let health = ProcessHealth::new();
        assert!(health.is_live());
        assert!(!health.is_ready());

        health.set_ready(true);
        assert!(health.is_ready());
        health.set_live(false);
        assert!(!health.is_live());
    }

    #[test]
    fn test_serialization() {
        let report = HealthReport::from_checks(checks(1, 0), 99.0, Duration::from_secs(5));
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"healthy\""));

        let back: HealthReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, HealthStatus::Healthy);
        assert_eq!(back.checks.len(), 1);
    }
}
