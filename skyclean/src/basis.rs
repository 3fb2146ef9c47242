//! Multi-scale basis functions.
//!
//! Each scale is a compact, circularly symmetric kernel defined on the PSF
//! support window with its origin at the window centre:
//! - scale 0 is a delta function (a point component);
//! - scale `s > 0` is the tapered prolate spheroidal `ψ(r/s)·(1 − (r/s)²)` for
//!   `r < s`, normalised to unit sum.
//!
//! Optionally the kernels are orthogonalised against each other in ascending
//! scale order.

use crate::image::{Image, Shape};

/// Set of scale kernels, generated on demand for a support window shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisFunctionSet {
    scales: Vec<f32>,
    orthogonal: bool,
    shape: Option<Shape>,
    functions: Vec<Image>,
}

impl BasisFunctionSet {
    pub fn new(scales: Vec<f32>, orthogonal: bool) -> Self {
        assert!(
            scales.iter().all(|s| s.is_finite() && *s >= 0.0),
            "scales must be finite and non-negative"
        );
        Self {
            scales,
            orthogonal,
            shape: None,
            functions: Vec::new(),
        }
    }

    #[inline]
    pub fn num_bases(&self) -> usize {
        self.scales.len()
    }

    #[inline]
    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    #[inline]
    pub fn is_orthogonal(&self) -> bool {
        self.orthogonal
    }

    /// Shape the kernels were generated for, if any.
    #[inline]
    pub fn shape(&self) -> Option<Shape> {
        self.shape
    }

    /// Generated kernels; empty until [`BasisFunctionSet::initialise`] is called.
    #[inline]
    pub fn functions(&self) -> &[Image] {
        &self.functions
    }

    #[inline]
    pub fn function(&self, base: usize) -> &Image {
        &self.functions[base]
    }

    /// Half-width in pixels needed to hold the largest kernel.
    pub fn support_radius(&self) -> usize {
        self.scales
            .iter()
            .map(|s| s.ceil() as usize)
            .max()
            .unwrap_or(0)
    }

    /// Generates the kernels on a window of `shape` centred at `shape.center()`.
    /// Does nothing if they already exist for this shape.
    pub fn initialise(&mut self, shape: Shape) {
        if self.shape == Some(shape) && self.functions.len() == self.scales.len() {
            return;
        }
        let center = shape.center();
        self.functions = self
            .scales
            .iter()
            .map(|&scale| scale_function(shape, center, scale))
            .collect();
        if self.orthogonal {
            orthogonalise(&mut self.functions);
        }
        self.shape = Some(shape);
        tracing::debug!(
            "Generated {} basis functions on {} window (orthogonal: {})",
            self.functions.len(),
            shape,
            self.orthogonal
        );
    }
}

/// Kernel for one scale, normalised to unit sum.
fn scale_function(shape: Shape, center: (usize, usize), scale: f32) -> Image {
    let mut kernel = Image::zeros(shape);
    if scale <= 0.0 {
        kernel[center] = 1.0;
        return kernel;
    }

    let scale = scale as f64;
    let mut sum = 0.0f64;
    let mut values = vec![0.0f64; shape.pixel_count()];
    for y in 0..shape.height {
        let dy = y as f64 - center.1 as f64;
        for x in 0..shape.width {
            let dx = x as f64 - center.0 as f64;
            let nu = (dx * dx + dy * dy).sqrt() / scale;
            if nu < 1.0 {
                let v = spheroidal(nu) * (1.0 - nu * nu);
                values[y * shape.width + x] = v;
                sum += v;
            }
        }
    }

    if sum > 0.0 {
        for (dst, v) in kernel.pixels_mut().iter_mut().zip(&values) {
            *dst = (v / sum) as f32;
        }
    } else {
        kernel[center] = 1.0;
    }
    kernel
}

/// Prolate spheroidal wave function (rational approximation, α = 1, m = 6).
///
/// Defined on `0 <= nu <= 1`; zero outside.
pub fn spheroidal(nu: f64) -> f64 {
    const P: [[f64; 5]; 2] = [
        [8.203343e-2, -3.644705e-1, 6.278660e-1, -5.335581e-1, 2.312756e-1],
        [4.028559e-3, -3.697768e-2, 1.021332e-1, -1.201436e-1, 6.412774e-2],
    ];
    const Q: [[f64; 3]; 2] = [
        [1.0000000, 8.212018e-1, 2.078043e-1],
        [1.0000000, 9.599102e-1, 2.918724e-1],
    ];

    if !(0.0..=1.0).contains(&nu) {
        return 0.0;
    }
    let (part, nu_end) = if nu <= 0.75 { (0, 0.75) } else { (1, 1.0) };
    let delta = nu * nu - nu_end * nu_end;

    let top = P[part].iter().rev().fold(0.0, |acc, &c| acc * delta + c);
    let bottom = Q[part].iter().rev().fold(0.0, |acc, &c| acc * delta + c);
    if bottom == 0.0 { 0.0 } else { top / bottom }
}

/// Modified Gram-Schmidt in ascending scale order.
///
/// Each orthogonalised kernel is rescaled to unit sum, or to unit L2 norm when
/// its sum vanishes.
fn orthogonalise(functions: &mut [Image]) {
    let mut basis: Vec<Vec<f64>> = functions
        .iter()
        .map(|f| f.pixels().iter().map(|&v| v as f64).collect())
        .collect();
    let mut units: Vec<Vec<f64>> = Vec::with_capacity(basis.len());

    for vector in basis.iter_mut() {
        for unit in &units {
            let projection = dot(vector, unit);
            for (v, u) in vector.iter_mut().zip(unit) {
                *v -= projection * u;
            }
        }
        let norm = dot(vector, vector).sqrt();
        if norm > 0.0 {
            units.push(vector.iter().map(|v| v / norm).collect());
        }

        let sum: f64 = vector.iter().sum();
        let l1: f64 = vector.iter().map(|v| v.abs()).sum();
        let divisor = if sum.abs() > 1e-6 * l1 { sum } else { norm };
        if divisor != 0.0 {
            for v in vector.iter_mut() {
                *v /= divisor;
            }
        }
    }

    for (function, vector) in functions.iter_mut().zip(&basis) {
        for (dst, &v) in function.pixels_mut().iter_mut().zip(vector) {
            *dst = v as f32;
        }
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
