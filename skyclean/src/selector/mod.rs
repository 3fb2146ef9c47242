//! Greedy component search.
//!
//! Each scale is searched independently for its strongest masked response
//! under the configured criterion; the per-scale candidates are then reduced
//! in ascending scale order with a strict `>` so that ties keep the earlier
//! scale. Within an image the first pixel in row-major order wins ties.

#[cfg(test)]
mod tests;

use std::ops::Range;

use crate::backend::Backend;
use crate::config::SolutionType;
use crate::coupling::CouplingMatrixCache;
use crate::error::{Error, Result};
use crate::image::{Image, Shape};
use crate::mask::MaskManager;
use crate::residual_basis::ResidualBasisCache;

/// Component chosen for subtraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub scale: usize,
    pub position: (usize, usize),
    /// Decoupled per-term amplitudes at `position`.
    pub amplitudes: Vec<f32>,
    /// Convergence metric of this selection.
    pub abs_peak: f32,
}

/// Signed extremum of a masked image and its pixel index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extremum {
    pub index: usize,
    pub value: f32,
}

/// Scans `values · mask` in row-major order for its minimum and maximum and
/// returns whichever has the larger magnitude (the maximum on equal magnitude).
/// The first occurrence wins ties. `None` mask means no masking.
pub fn masked_abs_extremum(values: &[f32], mask: Option<&[f32]>) -> Extremum {
    MinMax::scan(0..values.len(), mask, |i| values[i]).map_or(
        Extremum {
            index: 0,
            value: 0.0,
        },
        MinMax::abs_extremum,
    )
}

/// Minimum and maximum of a pixel range, first occurrence on ties.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MinMax {
    min: Extremum,
    max: Extremum,
    /// A non-finite value was seen anywhere in the range.
    non_finite: bool,
}

impl MinMax {
    fn scan(
        range: Range<usize>,
        mask: Option<&[f32]>,
        value_at: impl Fn(usize) -> f32,
    ) -> Option<Self> {
        let masked = |i: usize| match mask {
            Some(m) => value_at(i) * m[i],
            None => value_at(i),
        };
        let mut indices = range;
        let first = indices.next()?;
        let v = masked(first);
        let seed = Extremum {
            index: first,
            value: v,
        };
        let mut acc = Self {
            min: seed,
            max: seed,
            non_finite: !v.is_finite(),
        };
        for i in indices {
            let v = masked(i);
            acc.non_finite |= !v.is_finite();
            if v < acc.min.value {
                acc.min = Extremum { index: i, value: v };
            }
            if v > acc.max.value {
                acc.max = Extremum { index: i, value: v };
            }
        }
        Some(acc)
    }

    /// Combines with the result of the range that follows this one. Equal to
    /// scanning both ranges in one pass.
    fn merge(self, next: Self) -> Self {
        Self {
            min: if next.min.value < self.min.value { next.min } else { self.min },
            max: if next.max.value > self.max.value { next.max } else { self.max },
            non_finite: self.non_finite || next.non_finite,
        }
    }

    fn abs_extremum(self) -> Extremum {
        if self.non_finite {
            return Extremum {
                index: self.min.index,
                value: f32::NAN,
            };
        }
        if self.min.value.abs() > self.max.value.abs() {
            self.min
        } else {
            self.max
        }
    }
}

/// Masked absolute extremum of `count` images of `shape`, each searched in row
/// chunks on the backend. Chunk results are merged in ascending row order, so
/// the outcome does not depend on the chunking.
fn search_rows<B, F>(backend: &B, shape: Shape, count: usize, scan: F) -> Vec<Extremum>
where
    B: Backend,
    F: Fn(usize, Range<usize>) -> Option<MinMax> + Sync + Send,
{
    let rows = backend.rows_per_chunk(shape.height);
    let chunks = shape.height.div_ceil(rows).max(1);
    let partials = backend.map(count * chunks, |i| {
        let (item, chunk) = (i / chunks, i % chunks);
        let start = (chunk * rows).min(shape.height) * shape.width;
        let end = ((chunk + 1) * rows).min(shape.height) * shape.width;
        scan(item, start..end)
    });
    partials
        .chunks(chunks)
        .map(|parts| {
            parts
                .iter()
                .flatten()
                .copied()
                .reduce(MinMax::merge)
                .map_or(
                    Extremum {
                        index: 0,
                        value: 0.0,
                    },
                    MinMax::abs_extremum,
                )
        })
        .collect()
}

/// Stateless search over the residual basis for one solution type.
#[derive(Debug, Clone, Copy)]
pub struct ComponentSelector {
    solution_type: SolutionType,
}

impl ComponentSelector {
    pub fn new(solution_type: SolutionType) -> Self {
        Self { solution_type }
    }

    #[inline]
    pub fn solution_type(&self) -> SolutionType {
        self.solution_type
    }

    /// Finds the next component, or `None` when there are no scales.
    ///
    /// `deep` selects the deep-clean masks. Unless `deep` or `decoupled` is set,
    /// the reported `abs_peak` is the coupled-residual estimate rather than the
    /// criterion value of the winning pixel.
    pub fn select<B: Backend>(
        &self,
        backend: &B,
        residual_basis: &ResidualBasisCache,
        coupling: &CouplingMatrixCache,
        masks: &MaskManager,
        deep: bool,
        decoupled: bool,
    ) -> Result<Option<Component>> {
        let num_bases = residual_basis.num_bases();
        if num_bases == 0 {
            return Ok(None);
        }

        let candidates = search_rows(backend, residual_basis.shape(), num_bases, |b, range| {
            let mask = masks.search_mask(b, deep).map(Image::pixels);
            self.scan_scale(b, residual_basis, coupling, mask, range)
        });

        // Ascending scale order; ties keep the earlier scale.
        let mut best: Option<(usize, Extremum)> = None;
        for (b, candidate) in candidates.into_iter().enumerate() {
            if !candidate.value.is_finite() {
                return Err(Error::NonFinite {
                    what: "peak residual",
                    scale: b,
                });
            }
            match best {
                Some((_, current)) if candidate.value.abs() > current.value.abs() => {
                    best = Some((b, candidate))
                }
                None => best = Some((b, candidate)),
                _ => {}
            }
        }
        let Some((scale, candidate)) = best else {
            return Ok(None);
        };

        let shape = residual_basis.shape();
        let position = (candidate.index % shape.width, candidate.index / shape.width);
        let num_terms = residual_basis.num_terms();
        let mut values = vec![0.0f32; num_terms];
        residual_basis.values_at(scale, candidate.index, &mut values);
        let mut amplitudes = vec![0.0f32; num_terms];
        coupling.scale(scale).decouple(&values, &mut amplitudes);
        if let Some(t) = amplitudes.iter().position(|a| !a.is_finite()) {
            tracing::warn!("Non-finite amplitude for term {} at {:?}", t, position);
            return Err(Error::NonFinite {
                what: "component amplitude",
                scale,
            });
        }

        let mut abs_peak = match self.solution_type {
            SolutionType::MaxChisq => candidate.value.max(0.0).sqrt(),
            SolutionType::MaxBase | SolutionType::MaxTerm0 => candidate.value.abs(),
        };
        if !deep && !decoupled {
            abs_peak = coupled_residual_estimate(backend, residual_basis, masks);
        }

        tracing::trace!(
            "Selected scale {} at {:?}, criterion {:e}, amplitudes {:?}",
            scale,
            position,
            candidate.value,
            amplitudes
        );

        Ok(Some(Component {
            scale,
            position,
            amplitudes,
            abs_peak,
        }))
    }

    /// Criterion extremum of scale `b` over the pixel `range`.
    fn scan_scale(
        &self,
        b: usize,
        residual_basis: &ResidualBasisCache,
        coupling: &CouplingMatrixCache,
        mask: Option<&[f32]>,
        range: Range<usize>,
    ) -> Option<MinMax> {
        let terms = residual_basis.terms(b);
        let scale = coupling.scale(b);

        match self.solution_type {
            SolutionType::MaxBase => {
                let rb0 = terms[0].pixels();
                let norm = 1.0 / (coupling.coupling_matrix(b)[(0, 0)].sqrt() as f32);
                MinMax::scan(range, mask, |i| rb0[i] * norm)
            }
            SolutionType::MaxTerm0 => MinMax::scan(range, mask, |i| {
                terms
                    .iter()
                    .enumerate()
                    .map(|(t2, rb)| scale.inverse_at(0, t2) * rb.pixels()[i])
                    .sum()
            }),
            SolutionType::MaxChisq => MinMax::scan(range, mask, |i| {
                let mut negchisq = 0.0f32;
                for (t1, rb1) in terms.iter().enumerate() {
                    let coeff: f32 = terms
                        .iter()
                        .enumerate()
                        .map(|(t2, rb2)| scale.inverse_at(t1, t2) * rb2.pixels()[i])
                        .sum();
                    negchisq += coeff * rb1.pixels()[i];
                }
                negchisq
            }),
        }
    }
}

/// Max over terms of the max over scales of the masked absolute residual
/// response, ignoring deep-clean masks.
pub fn coupled_residual_estimate<B: Backend>(
    backend: &B,
    residual_basis: &ResidualBasisCache,
    masks: &MaskManager,
) -> f32 {
    let num_bases = residual_basis.num_bases();
    let num_terms = residual_basis.num_terms();
    let peaks = search_rows(
        backend,
        residual_basis.shape(),
        num_bases * num_terms,
        |i, range| {
            let (b, t) = (i / num_terms, i % num_terms);
            let mask = masks.search_mask(b, false).map(Image::pixels);
            let rb = residual_basis.get(b, t).pixels();
            MinMax::scan(range, mask, |p| rb[p])
        },
    );

    let mut estimate = 0.0f32;
    for t in 0..num_terms {
        let mut term_peak = 0.0f32;
        for b in 0..num_bases {
            term_peak = term_peak.max(peaks[b * num_terms + t].value.abs());
        }
        estimate = estimate.max(term_peak);
    }
    estimate
}
