//! 2-D FFT over arbitrary rectangular grids.
//!
//! Transforms use row-column decomposition on top of `rustfft`. Kernels are
//! embedded with their origin pixel moved to index (0, 0) so that products of
//! transforms correspond to convolutions/correlations about that origin.

use std::sync::Arc;

use rustfft::{Fft, FftPlanner, num_complex::Complex};

use crate::image::{Image, Shape};

pub type Complex32 = Complex<f32>;

/// Planned forward and inverse transforms for one grid shape.
pub struct Fft2d {
    shape: Shape,
    row_forward: Arc<dyn Fft<f32>>,
    row_inverse: Arc<dyn Fft<f32>>,
    col_forward: Arc<dyn Fft<f32>>,
    col_inverse: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for Fft2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft2d").field("shape", &self.shape).finish()
    }
}

impl Fft2d {
    pub fn new(shape: Shape) -> Self {
        assert!(shape.pixel_count() > 0, "FFT grid must not be empty");
        let mut planner = FftPlanner::new();
        Self {
            shape,
            row_forward: planner.plan_fft_forward(shape.width),
            row_inverse: planner.plan_fft_inverse(shape.width),
            col_forward: planner.plan_fft_forward(shape.height),
            col_inverse: planner.plan_fft_inverse(shape.height),
        }
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// In-place forward transform of a row-major grid.
    pub fn forward(&self, data: &mut [Complex32]) {
        self.process(data, &self.row_forward, &self.col_forward);
    }

    /// In-place inverse transform, normalised by the grid size.
    pub fn inverse(&self, data: &mut [Complex32]) {
        self.process(data, &self.row_inverse, &self.col_inverse);
        let norm = 1.0 / self.shape.pixel_count() as f32;
        for v in data.iter_mut() {
            *v *= norm;
        }
    }

    fn process(&self, data: &mut [Complex32], rows: &Arc<dyn Fft<f32>>, cols: &Arc<dyn Fft<f32>>) {
        let Shape { width, height } = self.shape;
        assert_eq!(data.len(), width * height, "FFT buffer has wrong length");

        // Rows are contiguous; rustfft processes all of them in one call.
        rows.process(data);

        let mut transposed = vec![Complex32::default(); data.len()];
        transpose(data, &mut transposed, width, height);
        cols.process(&mut transposed);
        transpose(&transposed, data, height, width);
    }

    /// Zero-filled grid of this shape.
    pub fn zeroed(&self) -> Vec<Complex32> {
        vec![Complex32::default(); self.shape.pixel_count()]
    }

    /// Embeds `image` in the top-left corner of the grid, scaled by `scale`.
    pub fn embed_corner(&self, image: &Image, scale: f32) -> Vec<Complex32> {
        let mut data = self.zeroed();
        let width = self.shape.width;
        for y in 0..image.height().min(self.shape.height) {
            let row = image.row(y);
            for (x, &v) in row.iter().enumerate().take(width) {
                data[y * width + x] = Complex32::new(v * scale, 0.0);
            }
        }
        data
    }

    /// Embeds `kernel` so that its `origin` pixel lands on grid index (0, 0),
    /// wrapping negative offsets to the far edges.
    pub fn embed_origin(&self, kernel: &Image, origin: (usize, usize)) -> Vec<Complex32> {
        let Shape { width, height } = self.shape;
        assert!(
            kernel.width() <= width && kernel.height() <= height,
            "kernel {} does not fit FFT grid {}",
            kernel.shape(),
            self.shape
        );
        let mut data = self.zeroed();
        for ky in 0..kernel.height() {
            let gy = wrap(ky as isize - origin.1 as isize, height);
            for (kx, &v) in kernel.row(ky).iter().enumerate() {
                let gx = wrap(kx as isize - origin.0 as isize, width);
                data[gy * width + gx] = Complex32::new(v, 0.0);
            }
        }
        data
    }

    /// Inverse of [`Fft2d::embed_origin`]: reads the real part into an image of
    /// `shape` whose `origin` pixel comes from grid index (0, 0).
    pub fn extract_origin(
        &self,
        data: &[Complex32],
        shape: Shape,
        origin: (usize, usize),
    ) -> Image {
        let Shape { width, height } = self.shape;
        Image::from_fn(shape, |x, y| {
            let gx = wrap(x as isize - origin.0 as isize, width);
            let gy = wrap(y as isize - origin.1 as isize, height);
            data[gy * width + gx].re
        })
    }

    /// Reads the real part of the top-left `shape` corner of the grid.
    pub fn extract_corner(&self, data: &[Complex32], shape: Shape) -> Image {
        let width = self.shape.width;
        Image::from_fn(shape, |x, y| data[y * width + x].re)
    }
}

#[inline]
fn wrap(offset: isize, len: usize) -> usize {
    offset.rem_euclid(len as isize) as usize
}

/// Transposes a `width x height` row-major grid into `dst` (`height x width`).
fn transpose(src: &[Complex32], dst: &mut [Complex32], width: usize, height: usize) {
    const BLOCK: usize = 16;
    for by in (0..height).step_by(BLOCK) {
        for bx in (0..width).step_by(BLOCK) {
            for y in by..(by + BLOCK).min(height) {
                for x in bx..(bx + BLOCK).min(width) {
                    dst[x * height + y] = src[y * width + x];
                }
            }
        }
    }
}
