//! Convergence state and progress reporting.

use std::sync::Arc;

use serde::Serialize;

/// Stage of a deconvolution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum_macros::Display)]
pub enum CleanStage {
    /// Minor cycles are running with the regular search masks.
    #[default]
    Running,
    /// Search restricted to pixels that already hold components.
    DeepClean,
    /// Target objective (or deep threshold) reached.
    Converged,
    /// Iteration limit reached before convergence.
    MaxIterationsReached,
    /// Stopped by the caller through the stop flag.
    Cancelled,
}

impl CleanStage {
    /// True for stages that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CleanStage::Converged | CleanStage::MaxIterationsReached | CleanStage::Cancelled
        )
    }
}

/// Snapshot of the solver after an iteration.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DeconvolutionState {
    pub iteration_count: usize,
    pub peak_residual: f32,
    pub objective_function: f32,
    pub initial_objective_function: f32,
    /// Sum of the term-0 model, in `f64` and scan order.
    pub total_flux: f64,
    /// Set on entry to deep clean and never cleared within a run.
    pub deep_clean_mode: bool,
    pub decoupled_mode: bool,
    pub stage: CleanStage,
}

impl DeconvolutionState {
    /// Clears the per-run counters. The deep-clean flag survives.
    pub fn reset(&mut self, decoupled: bool) {
        *self = Self {
            deep_clean_mode: self.deep_clean_mode,
            decoupled_mode: decoupled,
            stage: if self.deep_clean_mode {
                CleanStage::DeepClean
            } else {
                CleanStage::Running
            },
            ..Self::default()
        };
    }
}

type MonitorFn = dyn Fn(&DeconvolutionState) + Send + Sync;

/// Optional callback invoked once per iteration with the current state.
#[derive(Clone, Default)]
pub struct Monitor(Option<Arc<MonitorFn>>);

impl Monitor {
    pub fn new(f: impl Fn(&DeconvolutionState) + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(f)))
    }

    pub fn is_some(&self) -> bool {
        self.0.is_some()
    }

    /// Report the state using the callback if set.
    pub fn report(&self, state: &DeconvolutionState) {
        if let Some(f) = self.0.as_ref() {
            f(state);
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            None => write!(f, "Monitor::None"),
            Some(_) => write!(f, "Monitor::Some(...)"),
        }
    }
}
