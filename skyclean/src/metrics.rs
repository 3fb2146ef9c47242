//! Caller-owned profiling counters.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Counts and wall-clock time spent in each phase of a solve.
///
/// The deconvolver never keeps its own counters; pass the same value to
/// successive calls to accumulate across major cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeconvolutionMetrics {
    pub coupling_builds: usize,
    pub residual_basis_builds: usize,
    pub iterations: usize,
    pub coupling_time: Duration,
    pub residual_basis_time: Duration,
    pub search_time: Duration,
    pub update_time: Duration,
    pub residual_update_time: Duration,
}

impl DeconvolutionMetrics {
    /// Total time over every phase.
    pub fn total_time(&self) -> Duration {
        self.coupling_time
            + self.residual_basis_time
            + self.search_time
            + self.update_time
            + self.residual_update_time
    }

    /// Mean milliseconds per minor-cycle iteration (search plus update).
    pub fn mean_iteration_ms(&self) -> f64 {
        if self.iterations == 0 {
            return 0.0;
        }
        (self.search_time + self.update_time).as_secs_f64() * 1000.0 / self.iterations as f64
    }
}

/// Runs `f` and adds its wall-clock time to `slot`.
pub(crate) fn timed<R>(slot: &mut Duration, f: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let result = f();
    *slot += start.elapsed();
    result
}
