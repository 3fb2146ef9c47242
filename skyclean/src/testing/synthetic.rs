//! Synthetic skies, PSFs and dirty images.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::image::{Image, Shape};

/// PSF that is 1 at `peak` and 0 elsewhere.
pub fn delta_psf(shape: Shape, peak: (usize, usize)) -> Image {
    let mut psf = Image::zeros(shape);
    psf[peak] = 1.0;
    psf
}

/// Circular Gaussian PSF with unit peak.
pub fn gaussian_psf(shape: Shape, peak: (usize, usize), sigma: f32) -> Image {
    let inv = 1.0 / (2.0 * sigma * sigma);
    Image::from_fn(shape, |x, y| {
        let dx = x as f32 - peak.0 as f32;
        let dy = y as f32 - peak.1 as f32;
        (-(dx * dx + dy * dy) * inv).exp()
    })
}

/// Long PSF vector `moments[k] · base` for k = 0..moments.len().
pub fn taylor_psfs(base: &Image, moments: &[f32]) -> Vec<Image> {
    moments
        .iter()
        .map(|&m| {
            let pixels = base.pixels().iter().map(|v| v * m).collect();
            Image::new(base.width(), base.height(), pixels)
        })
        .collect()
}

/// Image with the given `(x, y, flux)` point sources.
pub fn point_model(shape: Shape, sources: &[(usize, usize, f32)]) -> Image {
    let mut model = Image::zeros(shape);
    for &(x, y, flux) in sources {
        model[(x, y)] += flux;
    }
    model
}

/// Linear convolution `Σ_p model(p) · psf(q − p + peak)` evaluated directly.
pub fn convolve(psf: &Image, peak: (usize, usize), model: &Image) -> Image {
    let mut out = Image::zeros(model.shape());
    for py in 0..model.height() {
        for px in 0..model.width() {
            let flux = model[(px, py)];
            if flux == 0.0 {
                continue;
            }
            for qy in 0..out.height() {
                let sy = qy as isize - py as isize + peak.1 as isize;
                if sy < 0 || sy as usize >= psf.height() {
                    continue;
                }
                for qx in 0..out.width() {
                    let sx = qx as isize - px as isize + peak.0 as isize;
                    if sx < 0 || sx as usize >= psf.width() {
                        continue;
                    }
                    out[(qx, qy)] += flux * psf[(sx as usize, sy as usize)];
                }
            }
        }
    }
    out
}

/// Multi-term dirty images `dirty[t1] = Σ_t2 psf[t1 + t2] ⊛ model[t2]`.
pub fn multi_term_dirty(psfs: &[Image], peak: (usize, usize), models: &[Image]) -> Vec<Image> {
    let terms = models.len();
    assert_eq!(psfs.len(), 2 * terms - 1, "need 2T - 1 PSFs");
    (0..terms)
        .map(|t1| {
            let mut dirty = Image::zeros(models[0].shape());
            for (t2, model) in models.iter().enumerate() {
                let response = convolve(&psfs[t1 + t2], peak, model);
                for (d, r) in dirty.pixels_mut().iter_mut().zip(response.pixels()) {
                    *d += r;
                }
            }
            dirty
        })
        .collect()
}

/// Extended source: a circular Gaussian blob of total `flux`.
pub fn gaussian_blob(shape: Shape, center: (usize, usize), sigma: f32, flux: f32) -> Image {
    let mut blob = gaussian_psf(shape, center, sigma);
    let sum = blob.sum() as f32;
    for v in blob.pixels_mut() {
        *v *= flux / sum;
    }
    blob
}

/// Adds uniform noise in `[-amplitude, amplitude)` with a fixed seed.
pub fn add_noise(image: &mut Image, amplitude: f32, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for v in image.pixels_mut() {
        *v += rng.random_range(-amplitude..amplitude);
    }
}
