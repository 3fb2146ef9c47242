//! Search masks.
//!
//! Every scale owns a persistent mask that starts at 0 and is set to 1 at each
//! pixel where a component of that scale was accepted. An optional weight map
//! (squared under MAXCHISQ) restricts the search everywhere; in deep-clean mode
//! the scale's own mask is multiplied in as well, so the search only revisits
//! pixels that already hold components of that scale.

use crate::backend::Backend;
use crate::config::SolutionType;
use crate::error::{Result, ensure_shape};
use crate::image::{Image, Shape};
use crate::version::Version;

#[derive(Debug, Clone)]
pub struct MaskManager {
    shape: Shape,
    weight: Option<Image>,
    base: Option<Image>,
    scale_masks: Vec<Image>,
    /// `base · scale_masks[b]`, prepared on entry to deep-clean mode.
    deep_masks: Vec<Image>,
    /// Weight version the deep masks were prepared for.
    prepared_from: Option<Version>,
}

impl MaskManager {
    pub fn new(num_bases: usize, shape: Shape) -> Self {
        Self {
            shape,
            weight: None,
            base: None,
            scale_masks: vec![Image::zeros(shape); num_bases],
            deep_masks: Vec::new(),
            prepared_from: None,
        }
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn num_bases(&self) -> usize {
        self.scale_masks.len()
    }

    /// Re-targets the manager to a new scale count or image shape.
    /// Existing scale masks survive when neither changes.
    pub fn resize(&mut self, num_bases: usize, shape: Shape) {
        if num_bases == self.num_bases() && shape == self.shape {
            return;
        }
        tracing::debug!("Resetting {} scale masks on {} image", num_bases, shape);
        let same_shape = shape == self.shape;
        let weight = self.weight.take().filter(|_| same_shape);
        let base = self.base.take().filter(|_| same_shape);
        *self = Self {
            weight,
            base,
            ..Self::new(num_bases, shape)
        };
    }

    /// Installs (or clears) the weight map and derives the base search mask.
    pub fn set_weight(&mut self, weight: Option<Image>, solution_type: SolutionType) -> Result<()> {
        if let Some(w) = &weight {
            ensure_shape("weight", 0, self.shape, w.shape())?;
        }
        self.weight = weight;
        self.update_base(solution_type);
        Ok(())
    }

    /// Recomputes the base mask from the current weight for `solution_type`.
    pub fn update_base(&mut self, solution_type: SolutionType) {
        self.base = self.weight.as_ref().map(|w| {
            if solution_type == SolutionType::MaxChisq {
                let pixels = w.pixels().iter().map(|v| v * v).collect();
                Image::new(w.width(), w.height(), pixels)
            } else {
                w.clone()
            }
        });
        self.deep_masks.clear();
        self.prepared_from = None;
    }

    #[inline]
    pub fn weight(&self) -> Option<&Image> {
        self.weight.as_ref()
    }

    /// Weight-derived mask applied outside deep-clean mode.
    #[inline]
    pub fn base_mask(&self) -> Option<&Image> {
        self.base.as_ref()
    }

    #[inline]
    pub fn scale_mask(&self, b: usize) -> &Image {
        &self.scale_masks[b]
    }

    /// Builds the deep-clean products for the weight at version `weight`,
    /// partitioned by row chunks. Needed only with a weight map.
    pub fn prepare<B: Backend>(&mut self, backend: &B, deep: bool, weight: Version) {
        self.prepared_from = Some(weight);
        let Some(base) = self.base.as_ref().filter(|_| deep) else {
            self.deep_masks.clear();
            return;
        };
        let chunk_len = self.shape.width * backend.rows_per_chunk(self.shape.height);
        let mut deep_masks = self.scale_masks.clone();
        for mask in &mut deep_masks {
            backend.for_each_chunk_mut(mask.pixels_mut(), chunk_len, |c, chunk| {
                let base = &base.pixels()[c * chunk_len..];
                for (m, w) in chunk.iter_mut().zip(base) {
                    *m *= w;
                }
            });
        }
        self.deep_masks = deep_masks;
    }

    /// True if the deep masks were prepared for the weight at version `weight`.
    #[inline]
    pub fn is_prepared_for(&self, weight: Version) -> bool {
        self.prepared_from == Some(weight)
    }

    /// Effective mask for scale `b`; `None` means the search is unrestricted.
    pub fn search_mask(&self, b: usize, deep: bool) -> Option<&Image> {
        if !deep {
            self.base.as_ref()
        } else if self.base.is_some() && self.deep_masks.len() == self.scale_masks.len() {
            Some(&self.deep_masks[b])
        } else {
            Some(&self.scale_masks[b])
        }
    }

    /// Records an accepted component of scale `b` at `position`.
    pub fn mark(&mut self, b: usize, position: (usize, usize)) {
        self.scale_masks[b][position] = 1.0;
        if let (Some(base), Some(deep)) = (&self.base, self.deep_masks.get_mut(b)) {
            deep[position] = base[position];
        }
    }

    /// Clears every scale mask.
    pub fn clear(&mut self) {
        for mask in &mut self.scale_masks {
            mask.fill(0.0);
        }
        self.deep_masks.clear();
        self.prepared_from = None;
    }
}
