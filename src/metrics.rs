//! # Simulation-Task Execution Metrics
//!
//! Measures the duration of every simulation-task invocation with an HDR
//! histogram and checks the configured soft/hard execution-time limits.
//! A soft breach is reported once per invocation as a warning; a hard
//! breach forces the participant into the `Error` lifecycle state. The
//! escalation itself is the lifecycle coordinator's job; this module only
//! renders the verdict.
//!
//! HDR histograms record in constant time regardless of the value, so the
//! measurement does not distort the task timing it observes.

use crate::error::{IbError, IbResult};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::time::Duration;

/// Outcome of recording one simulation-task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecTimeVerdict {
    /// Within all configured limits
    Ok,
    /// The soft limit was exceeded; the coordinator logs a warning
    SoftLimitExceeded(Duration),
    /// The hard limit was exceeded; the coordinator escalates to `Error`
    HardLimitExceeded(Duration),
}

/// Summary statistics over all recorded invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecTimeSummary {
    pub count: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: u64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
}

/// Execution-time monitor for one participant's simulation task.
pub struct ExecTimeMonitor {
    histogram: Mutex<Histogram<u64>>,
    soft_limit: Option<Duration>,
    hard_limit: Option<Duration>,
}

impl ExecTimeMonitor {
    /// Create a monitor with optional soft/hard limits.
    ///
    /// The histogram covers 1 ns to ~1 hour with 3 significant digits,
    /// which is ample for per-tick task durations.
    pub fn new(soft_limit: Option<Duration>, hard_limit: Option<Duration>) -> IbResult<Self> {
        let histogram = Histogram::new_with_bounds(1, 3_600_000_000_000, 3)
            .map_err(|e| IbError::Misconfiguration(format!("histogram creation failed: {e}")))?;
        Ok(Self {
            histogram: Mutex::new(histogram),
            soft_limit,
            hard_limit,
        })
    }

    /// Record one invocation and judge it against the limits.
    pub fn record(&self, elapsed: Duration) -> ExecTimeVerdict {
        let nanos = elapsed.as_nanos().min(u128::from(u64::MAX)) as u64;
        {
            let mut histogram = self.histogram.lock();
            // saturating: out-of-range values clamp to the highest bucket
            histogram.saturating_record(nanos.max(1));
        }

        if let Some(hard) = self.hard_limit {
            if elapsed > hard {
                return ExecTimeVerdict::HardLimitExceeded(elapsed);
            }
        }
        if let Some(soft) = self.soft_limit {
            if elapsed > soft {
                return ExecTimeVerdict::SoftLimitExceeded(elapsed);
            }
        }
        ExecTimeVerdict::Ok
    }

    /// Summary of everything recorded so far.
    pub fn summary(&self) -> ExecTimeSummary {
        let histogram = self.histogram.lock();
        ExecTimeSummary {
            count: histogram.len(),
            min_ns: histogram.min(),
            max_ns: histogram.max(),
            mean_ns: histogram.mean() as u64,
            p50_ns: histogram.value_at_quantile(0.50),
            p95_ns: histogram.value_at_quantile(0.95),
            p99_ns: histogram.value_at_quantile(0.99),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_judged_in_order() {
        let monitor = ExecTimeMonitor::new(
            Some(Duration::from_millis(5)),
            Some(Duration::from_millis(50)),
        )
        .unwrap();

        assert_eq!(
            monitor.record(Duration::from_millis(1)),
            ExecTimeVerdict::Ok
        );
        assert!(matches!(
            monitor.record(Duration::from_millis(10)),
            ExecTimeVerdict::SoftLimitExceeded(_)
        ));
        assert!(matches!(
            monitor.record(Duration::from_millis(100)),
            ExecTimeVerdict::HardLimitExceeded(_)
        ));
    }

    #[test]
    fn test_summary_counts_all_records() {
        let monitor = ExecTimeMonitor::new(None, None).unwrap();
        for ms in 1..=10 {
            monitor.record(Duration::from_millis(ms));
        }
        let summary = monitor.summary();
        assert_eq!(summary.count, 10);
        assert!(summary.max_ns >= summary.p50_ns);
        assert!(summary.p50_ns >= summary.min_ns);
    }

    #[test]
    fn test_no_limits_never_breach() {
        let monitor = ExecTimeMonitor::new(None, None).unwrap();
        assert_eq!(
            monitor.record(Duration::from_secs(30)),
            ExecTimeVerdict::Ok
        );
    }
}
