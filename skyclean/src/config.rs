//! Deconvolution control parameters.
//!
//! [`DeconvolutionControl`] carries every knob of the minor-cycle loop: the
//! scales of the basis functions, the component selection criterion, the loop
//! gain and the stopping thresholds.
//!
//! # Examples
//!
//! ```
//! use skyclean::{DeconvolutionControl, SolutionType};
//!
//! let control = DeconvolutionControl::default()
//!     .with_scales(vec![0.0, 3.0, 10.0])
//!     .with_loop_gain(0.2)
//!     .with_deep_threshold(0.001);
//! assert_eq!(control.solution_type, SolutionType::MaxChisq);
//! assert!(control.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// Criterion used to pick the next component.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SolutionType {
    /// Peak of the term-0 residual response, normalised per scale.
    MaxBase,
    /// Peak of the decoupled term-0 coefficient.
    MaxTerm0,
    /// Largest reduction in chi-squared over all terms.
    #[default]
    MaxChisq,
}

/// Parameters of the minor-cycle loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvolutionControl {
    /// Scale sizes in pixels. Zero is a point (delta) component.
    pub scales: Vec<f32>,
    /// Orthogonalise the scale kernels before use.
    pub orthogonal_basis: bool,
    /// Component selection criterion.
    pub solution_type: SolutionType,
    /// Report the raw selector peak instead of the coupled residual estimate.
    pub decoupled: bool,
    /// Secondary threshold for the deep-clean phase. `None` disables it.
    pub deep_threshold: Option<f32>,
    /// Peak residual at which the primary phase stops.
    pub target_objective: f32,
    /// Maximum number of minor-cycle iterations. Zero skips deconvolution.
    pub target_iterations: usize,
    /// Fraction of the component amplitude subtracted per iteration.
    pub loop_gain: f32,
    /// Width of the PSF support window in pixels. `None` uses the full image.
    pub psf_width: Option<usize>,
}

impl Default for DeconvolutionControl {
    fn default() -> Self {
        Self {
            scales: vec![0.0],
            orthogonal_basis: false,
            solution_type: SolutionType::MaxChisq,
            decoupled: false,
            deep_threshold: None,
            target_objective: 0.0,
            target_iterations: 1000,
            loop_gain: 0.1,
            psf_width: None,
        }
    }
}

impl DeconvolutionControl {
    pub fn with_scales(mut self, scales: Vec<f32>) -> Self {
        assert!(
            scales.iter().all(|s| s.is_finite() && *s >= 0.0),
            "scales must be finite and non-negative"
        );
        self.scales = scales;
        self
    }

    pub fn with_orthogonal_basis(mut self, orthogonal: bool) -> Self {
        self.orthogonal_basis = orthogonal;
        self
    }

    pub fn with_solution_type(mut self, solution_type: SolutionType) -> Self {
        self.solution_type = solution_type;
        self
    }

    pub fn with_decoupled(mut self, decoupled: bool) -> Self {
        self.decoupled = decoupled;
        self
    }

    pub fn with_deep_threshold(mut self, threshold: f32) -> Self {
        assert!(threshold >= 0.0, "deep threshold must be non-negative");
        self.deep_threshold = Some(threshold);
        self
    }

    pub fn with_target_objective(mut self, objective: f32) -> Self {
        assert!(objective >= 0.0, "target objective must be non-negative");
        self.target_objective = objective;
        self
    }

    pub fn with_target_iterations(mut self, iterations: usize) -> Self {
        self.target_iterations = iterations;
        self
    }

    pub fn with_loop_gain(mut self, gain: f32) -> Self {
        assert!(gain > 0.0 && gain <= 1.0, "loop gain must be in (0, 1]");
        self.loop_gain = gain;
        self
    }

    pub fn with_psf_width(mut self, width: usize) -> Self {
        assert!(width > 0, "PSF width must be positive");
        self.psf_width = Some(width);
        self
    }

    /// Deep threshold if the deep-clean phase is enabled.
    pub fn deep_clean_threshold(&self) -> Option<f32> {
        self.deep_threshold.filter(|&t| t > 0.0)
    }

    /// Checks every field, for controls built without the `with_*` setters.
    pub fn validate(&self) -> Result<()> {
        if let Some(s) = self.scales.iter().find(|s| !s.is_finite() || **s < 0.0) {
            return Err(invalid("scales", format!("scale {s} is not a non-negative number")));
        }
        if !(self.loop_gain > 0.0 && self.loop_gain <= 1.0) {
            return Err(invalid(
                "loop_gain",
                format!("{} is outside (0, 1]", self.loop_gain),
            ));
        }
        if !(self.target_objective >= 0.0) {
            return Err(invalid(
                "target_objective",
                format!("{} is negative or NaN", self.target_objective),
            ));
        }
        if let Some(t) = self.deep_threshold.filter(|t| !(*t >= 0.0)) {
            return Err(invalid("deep_threshold", format!("{t} is negative or NaN")));
        }
        if self.psf_width == Some(0) {
            return Err(invalid("psf_width", "must be positive".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> Error {
    Error::InvalidControl { field, reason }
}
