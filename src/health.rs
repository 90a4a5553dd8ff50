//! Backend health snapshot.
//!
//! Mirrors the teacher's `db/health.rs`: a status that degrades as checks
//! fail, plus a flat list of the checks that ran. Kept generic over what a
//! "check" means so both SQL adapters can report the same shape from very
//! different underlying queries (pool saturation vs. replica lag, open
//! transaction count, pending zombie backlog).

use serde::{Deserialize, Serialize};

/// Overall health of an adapter's backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// All checks passed.
    Healthy,
    /// At least one non-critical check failed.
    Degraded,
    /// At least one critical check failed.
    Unhealthy,
}

/// One health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Check {
    /// Fraction of the connection pool currently checked out.
    PoolSaturation {
        /// Value observed.
        current: f64,
        /// Threshold above which this check is unhealthy.
        threshold: f64,
        /// Whether the check passed.
        healthy: bool,
    },
    /// Number of rows past their zombie-deletion deadline awaiting sweep.
    ZombieBacklog {
        /// Rows currently overdue for deletion.
        count: u64,
        /// Threshold above which this check is unhealthy.
        threshold: u64,
        /// Whether the check passed.
        healthy: bool,
    },
    /// Transactions currently open beyond the configured concurrency limit.
    OpenTransactions {
        /// Transactions currently open.
        count: usize,
        /// Configured maximum.
        limit: usize,
        /// Whether the check passed.
        healthy: bool,
    },
}

/// Aggregate health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall status, derived from `checks`.
    pub status: HealthStatus,
    /// Individual checks that ran.
    pub checks: Vec<Check>,
}

impl HealthCheck {
    /// Starts an empty, healthy report.
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    /// Folds one check's result into the overall status and appends it.
    pub fn add_check(&mut self, check: Check) {
        let healthy = match &check {
            Check::PoolSaturation { healthy, .. }
            | Check::ZombieBacklog { healthy, .. }
            | Check::OpenTransactions { healthy, .. } => *healthy,
        };

        if !healthy {
            self.status = match self.status {
                HealthStatus::Healthy => HealthStatus::Degraded,
                other => other,
            };
            if matches!(check, Check::OpenTransactions { .. }) {
                self.status = HealthStatus::Unhealthy;
            }
        }

        self.checks.push(check);
    }

    /// True if overall status is `Healthy`.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
