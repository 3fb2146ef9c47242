//! Application of an accepted component to the model and the caches.

use crate::backend::Backend;
use crate::basis::BasisFunctionSet;
use crate::coupling::CouplingMatrixCache;
use crate::image::{AlignedWindows, Image};
use crate::residual_basis::ResidualBasisCache;
use crate::selector::Component;

/// Flux attributed to each (scale, term) pair, indexed `[scale][term]`.
pub type TermBaseFlux = Vec<Vec<f64>>;

#[derive(Debug, Clone, Copy)]
pub struct ModelUpdater {
    gain: f32,
}

impl ModelUpdater {
    pub fn new(gain: f32) -> Self {
        assert!(gain > 0.0 && gain <= 1.0, "loop gain must be in (0, 1]");
        Self { gain }
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Adds `gain · amplitudes[t] · basis[w]`, centred on the component
    /// position, to every model term and subtracts the matching response
    /// from the residual basis of every scale.
    pub fn apply<B: Backend>(
        &self,
        backend: &B,
        component: &Component,
        basis: &BasisFunctionSet,
        models: &mut [Image],
        term_base_flux: &mut TermBaseFlux,
        residual_basis: &mut ResidualBasisCache,
        coupling: &CouplingMatrixCache,
    ) {
        let w = component.scale;
        let kernel = basis.function(w);
        let support = kernel.shape();
        let gain = self.gain;

        let windows = models.first().and_then(|model| {
            AlignedWindows::new(model.shape(), component.position, support, support.center())
        });
        if let Some(windows) = windows {
            backend.for_each_mut(models, |t, model| {
                let amplitude = component.amplitudes[t];
                if amplitude != 0.0 {
                    model.add_scaled_window(kernel, &windows, gain * amplitude);
                }
            });
        }

        for (flux, &amplitude) in term_base_flux[w].iter_mut().zip(&component.amplitudes) {
            *flux += (gain * amplitude) as f64;
        }

        residual_basis.subtract_component(backend, coupling, component, gain);
    }
}

/// Total flux of every (scale, term) pair for term `t`, summed in scale order.
pub fn term_flux(term_base_flux: &TermBaseFlux, t: usize) -> f64 {
    term_base_flux.iter().map(|terms| terms[t]).sum()
}
