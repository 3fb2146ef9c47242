//! Matched-filter responses of the residual to every scale.
//!
//! `RB[b][t] = IFFT(conj(B̂b) · R̂t)` over the image, computed on a zero-padded
//! grid so the result is a linear (not circular) correlation. Between full
//! recomputes the responses are kept current by subtracting the windowed cross
//! terms of each accepted component, which is exact up to the support window.


use crate::backend::Backend;
use crate::basis::BasisFunctionSet;
use crate::coupling::CouplingMatrixCache;
use crate::fft::{Complex32, Fft2d};
use crate::image::{AlignedWindows, Image, Shape};
use crate::selector::Component;
use crate::version::{InputVersions, Version};

/// Residual responses indexed by scale, then Taylor term.
#[derive(Debug, Clone)]
pub struct ResidualBasisCache {
    shape: Shape,
    num_terms: usize,
    scales: Vec<Vec<Image>>,
    built_from: (Version, Version, Version),
}

impl ResidualBasisCache {
    /// Full recompute from the residual images, which are divided by `norm_psf`.
    pub fn build<B: Backend>(
        backend: &B,
        basis: &BasisFunctionSet,
        residuals: &[Image],
        norm_psf: f64,
        versions: InputVersions,
    ) -> Self {
        let num_terms = residuals.len();
        let num_bases = basis.num_bases();
        let shape = residuals.first().map(Image::shape).unwrap_or_default();
        let support = basis.shape().unwrap_or(shape);
        let center = support.center();
        let fft = Fft2d::new(Shape::new(
            shape.width + support.width,
            shape.height + support.height,
        ));

        let scale = (1.0 / norm_psf) as f32;
        let residual_fft: Vec<Vec<Complex32>> = backend.map(num_terms, |t| {
            let mut data = fft.embed_corner(&residuals[t], scale);
            fft.forward(&mut data);
            data
        });
        let basis_fft: Vec<Vec<Complex32>> = backend.map(num_bases, |b| {
            let mut data = fft.embed_origin(basis.function(b), center);
            fft.forward(&mut data);
            data
        });

        let mut flat = backend.map(num_bases * num_terms, |i| {
            let (b, t) = (i / num_terms, i % num_terms);
            let mut data: Vec<Complex32> = basis_fft[b]
                .iter()
                .zip(&residual_fft[t])
                .map(|(k, r)| k.conj() * *r)
                .collect();
            fft.inverse(&mut data);
            fft.extract_corner(&data, shape)
        })
        .into_iter();

        let scales = (0..num_bases)
            .map(|_| flat.by_ref().take(num_terms).collect())
            .collect();

        tracing::info!(
            "Residual basis recomputed: {} scales x {} terms on {} image",
            num_bases,
            num_terms,
            shape
        );

        Self {
            shape,
            num_terms,
            scales,
            built_from: (versions.basis, versions.psf, versions.residual),
        }
    }

    /// True if built from the current basis, PSF and residual.
    pub fn is_current(&self, versions: &InputVersions) -> bool {
        self.built_from == (versions.basis, versions.psf, versions.residual)
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn num_bases(&self) -> usize {
        self.scales.len()
    }

    #[inline]
    pub fn num_terms(&self) -> usize {
        self.num_terms
    }

    #[inline]
    pub fn get(&self, b: usize, t: usize) -> &Image {
        &self.scales[b][t]
    }

    /// All term images of scale `b`.
    #[inline]
    pub fn terms(&self, b: usize) -> &[Image] {
        &self.scales[b]
    }

    /// Values of every term of scale `b` at pixel index `idx`.
    #[inline]
    pub fn values_at(&self, b: usize, idx: usize, out: &mut [f32]) {
        for (o, image) in out.iter_mut().zip(&self.scales[b]) {
            *o = image.pixels()[idx];
        }
    }

    /// Subtracts the response of `component` (scaled by `gain`) from every
    /// scale, inside the support window around the component position.
    pub fn subtract_component<B: Backend>(
        &mut self,
        backend: &B,
        coupling: &CouplingMatrixCache,
        component: &Component,
        gain: f32,
    ) {
        let support = coupling.support();
        let Some(windows) =
            AlignedWindows::new(self.shape, component.position, support, support.center())
        else {
            return;
        };
        let w = component.scale;
        let amplitudes = &component.amplitudes;

        backend.for_each_mut(&mut self.scales, |b, terms| {
            for (t1, image) in terms.iter_mut().enumerate() {
                for (t2, &amplitude) in amplitudes.iter().enumerate() {
                    if amplitude == 0.0 {
                        continue;
                    }
                    let cross = coupling.cross_term(b, w, t1, t2);
                    image.add_scaled_window(cross, &windows, -gain * amplitude);
                }
            }
        });
    }
}
