//! Term-coupling matrices and cross-term PSF responses.
//!
//! For a pair of scales (a, b) and a pair of Taylor terms (t1, t2) the cross
//! term is the response of the scale-a residual basis for term t1 to a unit
//! component of scale b in term t2:
//!
//! ```text
//! Cross[a][b](t1, t2) = IFFT(conj(B̂a) · B̂b · P̂[t1 + t2]) / normPSF
//! ```
//!
//! evaluated over the PSF support window, origin at the window centre. A
//! scale's coupling matrix is its self cross term sampled at that origin.
//!
//! An entry depends on its terms only through `t1 + t2`, and swapping the
//! scales mirrors the terms, so only `(min scale, max scale, t1 + t2)` is stored.


use nalgebra::DMatrix;

use crate::backend::Backend;
use crate::basis::BasisFunctionSet;
use crate::error::{Error, Result};
use crate::fft::{Complex32, Fft2d};
use crate::image::{Image, Shape};
use crate::linalg::invert_spd;
use crate::version::{InputVersions, Version};

/// Canonical storage key of a cross term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CrossTermKey {
    pub low: usize,
    pub high: usize,
    pub order: usize,
}

impl CrossTermKey {
    pub fn new(a: usize, b: usize, t1: usize, t2: usize) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
            order: t1 + t2,
        }
    }
}

/// Coupling data of a single scale.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleCoupling {
    pub matrix: DMatrix<f64>,
    pub inverse: DMatrix<f64>,
    pub determinant: f64,
    /// Row-major `f32` copy of `inverse` for per-pixel loops.
    inverse_f32: Vec<f32>,
    terms: usize,
}

impl ScaleCoupling {
    #[inline]
    pub fn inverse_at(&self, t1: usize, t2: usize) -> f32 {
        self.inverse_f32[t1 * self.terms + t2]
    }

    /// `Σ_t2 inverse[t1][t2] · values[t2]` for every t1.
    #[inline]
    pub fn decouple(&self, values: &[f32], out: &mut [f32]) {
        for (t1, o) in out.iter_mut().enumerate().take(self.terms) {
            let row = &self.inverse_f32[t1 * self.terms..(t1 + 1) * self.terms];
            *o = row.iter().zip(values).map(|(w, v)| w * v).sum();
        }
    }
}

/// Per-scale coupling matrices and canonical cross terms, built once per
/// basis/PSF version.
#[derive(Debug, Clone)]
pub struct CouplingMatrixCache {
    num_bases: usize,
    num_terms: usize,
    support: Shape,
    norm_psf: f64,
    cross_terms: Vec<Image>,
    scales: Vec<ScaleCoupling>,
    built_from: (Version, Version),
}

impl CouplingMatrixCache {
    /// Builds the cache.
    ///
    /// `psf_window` holds the `2T - 1` PSF images already cropped to the
    /// support window with the PSF peak at the window centre.
    pub fn build<B: Backend>(
        backend: &B,
        basis: &BasisFunctionSet,
        psf_window: &[Image],
        num_terms: usize,
        versions: InputVersions,
    ) -> Result<Self> {
        if num_terms == 0 {
            return Err(Error::NoTerms);
        }
        let expected = 2 * num_terms - 1;
        if psf_window.len() != expected {
            return Err(Error::PsfCount {
                terms: num_terms,
                expected,
                actual: psf_window.len(),
            });
        }
        let support = psf_window[0].shape();
        if basis.shape() != Some(support) {
            return Err(Error::BasisFunctionUnset);
        }

        let num_bases = basis.num_bases();
        let center = support.center();
        let pad = 2 * basis.support_radius();
        let fft = Fft2d::new(Shape::new(support.width + pad, support.height + pad));

        let basis_fft: Vec<Vec<Complex32>> = backend.map(num_bases, |b| {
            let mut data = fft.embed_origin(basis.function(b), center);
            fft.forward(&mut data);
            data
        });
        let psf_fft: Vec<Vec<Complex32>> = backend.map(expected, |order| {
            let mut data = fft.embed_origin(&psf_window[order], center);
            fft.forward(&mut data);
            data
        });

        let norm_psf = psf_fft[0].iter().map(|c| c.re as f64).sum::<f64>()
            / psf_fft[0].len() as f64;
        if !(norm_psf.is_finite() && norm_psf > 0.0) {
            return Err(Error::PsfNormalisation { value: norm_psf });
        }

        let keys = canonical_keys(num_bases, expected);
        let inv_norm = (1.0 / norm_psf) as f32;
        let cross_terms = backend.map(keys.len(), |i| {
            let key = keys[i];
            let mut data: Vec<Complex32> = basis_fft[key.low]
                .iter()
                .zip(&basis_fft[key.high])
                .zip(&psf_fft[key.order])
                .map(|((a, b), p)| a.conj() * *b * *p * inv_norm)
                .collect();
            fft.inverse(&mut data);
            fft.extract_origin(&data, support, center)
        });

        let mut cache = Self {
            num_bases,
            num_terms,
            support,
            norm_psf,
            cross_terms,
            scales: Vec::with_capacity(num_bases),
            built_from: (versions.basis, versions.psf),
        };

        for b in 0..num_bases {
            let matrix = DMatrix::from_fn(num_terms, num_terms, |t1, t2| {
                cache.cross_term(b, b, t1, t2)[center] as f64
            });
            let spd = invert_spd(&matrix, b)?;
            tracing::debug!(
                "Scale {} ({}): coupling {:?}, determinant {:e}",
                b,
                basis.scales()[b],
                matrix.as_slice(),
                spd.determinant
            );
            let inverse_f32 = (0..num_terms * num_terms)
                .map(|i| spd.inverse[(i / num_terms, i % num_terms)] as f32)
                .collect();
            cache.scales.push(ScaleCoupling {
                matrix,
                inverse: spd.inverse,
                determinant: spd.determinant,
                inverse_f32,
                terms: num_terms,
            });
        }

        tracing::info!(
            "Coupling cache: {} scales, {} terms, {} cross terms on {} window, normPSF {:.6}",
            num_bases,
            num_terms,
            cache.cross_terms.len(),
            support,
            norm_psf
        );
        Ok(cache)
    }

    /// True if built from the current basis and PSF.
    pub fn is_current(&self, versions: &InputVersions) -> bool {
        self.built_from == (versions.basis, versions.psf)
    }

    #[inline]
    pub fn num_bases(&self) -> usize {
        self.num_bases
    }

    #[inline]
    pub fn num_terms(&self) -> usize {
        self.num_terms
    }

    /// Support window shape; its centre is the PSF peak.
    #[inline]
    pub fn support(&self) -> Shape {
        self.support
    }

    #[inline]
    pub fn norm_psf(&self) -> f64 {
        self.norm_psf
    }

    #[inline]
    pub fn scale(&self, b: usize) -> &ScaleCoupling {
        &self.scales[b]
    }

    pub fn coupling_matrix(&self, b: usize) -> &DMatrix<f64> {
        &self.scales[b].matrix
    }

    pub fn inverse_coupling_matrix(&self, b: usize) -> &DMatrix<f64> {
        &self.scales[b].inverse
    }

    pub fn determinant(&self, b: usize) -> f64 {
        self.scales[b].determinant
    }

    /// Cross term for any index order; symmetric by construction.
    #[inline]
    pub fn cross_term(&self, a: usize, b: usize, t1: usize, t2: usize) -> &Image {
        debug_assert!(a < self.num_bases && b < self.num_bases);
        debug_assert!(t1 < self.num_terms && t2 < self.num_terms);
        &self.cross_terms[self.key_index(CrossTermKey::new(a, b, t1, t2))]
    }

    /// Number of stored cross-term images.
    pub fn stored_cross_terms(&self) -> usize {
        self.cross_terms.len()
    }

    fn key_index(&self, key: CrossTermKey) -> usize {
        let n = self.num_bases;
        let pair = key.low * (2 * n - key.low + 1) / 2 + (key.high - key.low);
        pair * (2 * self.num_terms - 1) + key.order
    }
}

/// Keys in storage order: scale pairs (low <= high) outer, orders inner.
fn canonical_keys(num_bases: usize, orders: usize) -> Vec<CrossTermKey> {
    let mut keys = Vec::with_capacity(num_bases * (num_bases + 1) / 2 * orders);
    for low in 0..num_bases {
        for high in low..num_bases {
            for order in 0..orders {
                keys.push(CrossTermKey { low, high, order });
            }
        }
    }
    keys
}

/// Crops `psf` to a `support` window centred on `peak`, zero-filling outside.
pub fn crop_psf(psf: &Image, peak: (usize, usize), support: Shape) -> Image {
    let (cx, cy) = support.center();
    Image::from_fn(support, |x, y| {
        let sx = peak.0 as isize + x as isize - cx as isize;
        let sy = peak.1 as isize + y as isize - cy as isize;
        if sx >= 0 && sy >= 0 && (sx as usize) < psf.width() && (sy as usize) < psf.height() {
            psf[(sx as usize, sy as usize)]
        } else {
            0.0
        }
    })
}
