//! Real-valued 2-D images and window alignment.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Width and height of an image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    pub width: usize,
    pub height: usize,
}

impl Shape {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Pixel that acts as the origin of a kernel of this shape.
    #[inline]
    pub fn center(&self) -> (usize, usize) {
        (self.width / 2, self.height / 2)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Row-major `f32` image.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: Vec<f32>,
    width: usize,
    height: usize,
}

impl Image {
    pub fn new(width: usize, height: usize, pixels: Vec<f32>) -> Self {
        assert_eq!(
            pixels.len(),
            width * height,
            "pixels length must equal width * height"
        );
        Self {
            pixels,
            width,
            height,
        }
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: Shape, value: f32) -> Self {
        Self {
            pixels: vec![value; shape.pixel_count()],
            width: shape.width,
            height: shape.height,
        }
    }

    /// Builds an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(shape: Shape, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut pixels = Vec::with_capacity(shape.pixel_count());
        for y in 0..shape.height {
            for x in 0..shape.width {
                pixels.push(f(x, y));
            }
        }
        Self::new(shape.width, shape.height, pixels)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        Shape::new(self.width, self.height)
    }

    #[inline]
    pub fn index_of(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    #[inline]
    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [f32] {
        &mut self.pixels
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[f32] {
        let start = y * self.width;
        &self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [f32] {
        let start = y * self.width;
        &mut self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn fill(&mut self, value: f32) {
        self.pixels.fill(value);
    }

    /// Sum of all pixels, accumulated in `f64` in scan order.
    pub fn sum(&self) -> f64 {
        self.pixels.iter().map(|&v| v as f64).sum()
    }

    /// Position and value of the largest pixel (first one in scan order on ties).
    pub fn argmax(&self) -> (usize, usize, f32) {
        let mut best = (0, 0, f32::NEG_INFINITY);
        for y in 0..self.height {
            for (x, &v) in self.row(y).iter().enumerate() {
                if v > best.2 {
                    best = (x, y, v);
                }
            }
        }
        best
    }

    /// `self[windows.image] += factor * kernel[windows.kernel]`.
    pub fn add_scaled_window(&mut self, kernel: &Image, windows: &AlignedWindows, factor: f32) {
        let (iw, kw) = (windows.image, windows.kernel);
        for row in 0..iw.height {
            let dst = &mut self.row_mut(iw.y + row)[iw.x..iw.x + iw.width];
            let src = &kernel.row(kw.y + row)[kw.x..kw.x + kw.width];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += factor * s;
            }
        }
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.pixels
    }
}

impl Index<(usize, usize)> for Image {
    type Output = f32;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.pixels[y * self.width + x]
    }
}

impl IndexMut<(usize, usize)> for Image {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        &mut self.pixels[y * self.width + x]
    }
}

/// Axis-aligned rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// Matching windows in an image and in a kernel placed with its `anchor` on `position`.
///
/// The two regions have equal size and satisfy
/// `image.x - position.0 == kernel.x - anchor.0` (same for y).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedWindows {
    pub image: Region,
    pub kernel: Region,
}

impl AlignedWindows {
    /// Clips the kernel footprint against the image bounds.
    ///
    /// Returns `None` when the kernel does not overlap the image at all.
    pub fn new(
        image: Shape,
        position: (usize, usize),
        kernel: Shape,
        anchor: (usize, usize),
    ) -> Option<Self> {
        let (x0, kx0, w) = clip_axis(image.width, position.0, kernel.width, anchor.0)?;
        let (y0, ky0, h) = clip_axis(image.height, position.1, kernel.height, anchor.1)?;
        Some(Self {
            image: Region {
                x: x0,
                y: y0,
                width: w,
                height: h,
            },
            kernel: Region {
                x: kx0,
                y: ky0,
                width: w,
                height: h,
            },
        })
    }
}

/// Returns (image start, kernel start, length) along one axis.
fn clip_axis(
    image_len: usize,
    position: usize,
    kernel_len: usize,
    anchor: usize,
) -> Option<(usize, usize, usize)> {
    // Kernel pixel k lands on image pixel position + k - anchor.
    let start = position as isize - anchor as isize;
    let end = start + kernel_len as isize;
    let clipped_start = start.max(0);
    let clipped_end = end.min(image_len as isize);
    if clipped_end <= clipped_start {
        return None;
    }
    Some((
        clipped_start as usize,
        (clipped_start - start) as usize,
        (clipped_end - clipped_start) as usize,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_fn_row_major() {
        let image = Image::from_fn(Shape::new(3, 2), |x, y| (y * 10 + x) as f32);
        assert_eq!(image.pixels(), &[0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
        assert_eq!(image[(2, 1)], 12.0);
        assert_eq!(image.row(1), &[10.0, 11.0, 12.0]);
    }

    #[test]
    #[should_panic(expected = "pixels length must equal")]
    fn test_new_rejects_wrong_length() {
        Image::new(4, 4, vec![0.0; 15]);
    }

    #[test]
    fn test_argmax_first_on_ties() {
        let mut image = Image::zeros(Shape::new(4, 4));
        image[(3, 0)] = 2.0;
        image[(1, 2)] = 2.0;
        assert_eq!(image.argmax(), (3, 0, 2.0));
    }

    #[test]
    fn test_windows_fully_inside() {
        let w = AlignedWindows::new(Shape::new(64, 64), (32, 32), Shape::new(9, 9), (4, 4))
            .unwrap();
        assert_eq!(
            w.image,
            Region {
                x: 28,
                y: 28,
                width: 9,
                height: 9
            }
        );
        assert_eq!(w.kernel.x, 0);
        assert_eq!(w.kernel.y, 0);
    }

    #[test]
    fn test_windows_clipped_at_corner() {
        let w = AlignedWindows::new(Shape::new(16, 16), (1, 15), Shape::new(7, 7), (3, 3))
            .unwrap();
        // x: kernel spans image -2..5, clipped to 0..5
        assert_eq!((w.image.x, w.image.width), (0, 5));
        assert_eq!(w.kernel.x, 2);
        // y: kernel spans image 12..19, clipped to 12..16
        assert_eq!((w.image.y, w.image.height), (12, 4));
        assert_eq!(w.kernel.y, 0);
        // Alignment invariant
        assert_eq!(w.image.x as isize - 1, w.kernel.x as isize - 3);
        assert_eq!(w.image.y as isize - 15, w.kernel.y as isize - 3);
    }

    #[test]
    fn test_windows_no_overlap() {
        assert!(AlignedWindows::new(Shape::new(8, 8), (0, 0), Shape::new(3, 3), (10, 1)).is_none());
    }

    #[test]
    fn test_add_scaled_window_clipped() {
        let mut image = Image::zeros(Shape::new(5, 5));
        let kernel = Image::filled(Shape::new(3, 3), 2.0);
        let w = AlignedWindows::new(image.shape(), (0, 4), kernel.shape(), (1, 1)).unwrap();
        image.add_scaled_window(&kernel, &w, -0.5);
        assert_eq!(image[(0, 4)], -1.0);
        assert_eq!(image[(1, 3)], -1.0);
        assert_eq!(image[(2, 4)], 0.0);
        assert!((image.sum() + 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_sum_accumulates_in_f64() {
        let image = Image::filled(Shape::new(100, 100), 0.1);
        assert!((image.sum() - 1000.0).abs() < 1e-3);
    }
}
