//! Skyclean - multi-term, multi-scale CLEAN deconvolution.
//!
//! The engine models a sky image as a sum of scaled basis functions (points
//! and tapered discs of several sizes) with a Taylor polynomial spectrum per
//! component, and removes the dirty beam response of each component from the
//! residuals one iteration at a time:
//! - Basis functions and their term coupling matrices
//! - Residual responses per (scale, term), updated incrementally
//! - Component search under weight and deep-clean masks
//! - Convergence control with an optional deep-clean phase
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use skyclean::{DeconvolutionControl, DeconvolutionMetrics, Deconvolver};
//!
//! // One residual per Taylor term, 2T - 1 PSFs
//! let control = DeconvolutionControl::default().with_scales(vec![0.0, 4.0, 12.0]);
//! let mut deconvolver = Deconvolver::new(control, residuals, psfs)?;
//!
//! let mut metrics = DeconvolutionMetrics::default();
//! let stage = deconvolver.deconvolve(&mut metrics)?;
//! println!("{stage} after {} iterations", deconvolver.state().iteration_count);
//! ```

mod backend;
mod basis;
mod config;
mod coupling;
mod deconvolver;
mod error;
pub(crate) mod fft;
mod image;
pub(crate) mod linalg;
mod mask;
mod metrics;
mod residual_basis;
mod selector;
mod state;
mod update;
mod version;

#[cfg(test)]
pub mod testing;

// ============================================================================
// Core image types
// ============================================================================

pub use image::{Image, Shape};

// ============================================================================
// Configuration and errors
// ============================================================================

pub use config::{DeconvolutionControl, SolutionType};
pub use error::{Error, ErrorKind, Result};

// ============================================================================
// Execution backends
// ============================================================================

pub use backend::{Backend, SerialBackend, ThreadedBackend};

// ============================================================================
// Caches and building blocks
// ============================================================================

pub use basis::BasisFunctionSet;
pub use coupling::CouplingMatrixCache;
pub use mask::MaskManager;
pub use residual_basis::ResidualBasisCache;
pub use selector::{Component, ComponentSelector};
pub use update::{ModelUpdater, TermBaseFlux, term_flux};
pub use version::{InputVersions, Version};

// ============================================================================
// Solver
// ============================================================================

pub use deconvolver::Deconvolver;
pub use metrics::DeconvolutionMetrics;
pub use state::{CleanStage, DeconvolutionState, Monitor};
