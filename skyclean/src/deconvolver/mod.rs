//! Minor-cycle driver.
//!
//! [`Deconvolver`] owns the inputs (residual, PSF long vector, optional weight
//! and initial model), the caches derived from them and the convergence state.
//! Caches are rebuilt lazily when the version of an input they depend on moves
//! on; everything else mutates in place every iteration.
//!
//! # Examples
//!
//! ```
//! use skyclean::{
//!     CleanStage, DeconvolutionControl, DeconvolutionMetrics, Deconvolver, Image, Shape,
//! };
//!
//! let shape = Shape::new(32, 32);
//! let mut dirty = Image::zeros(shape);
//! dirty[(16, 16)] = 4.0;
//! let mut psf = Image::zeros(shape);
//! psf[(16, 16)] = 1.0;
//!
//! let control = DeconvolutionControl::default()
//!     .with_target_objective(0.01)
//!     .with_target_iterations(200);
//! let mut deconvolver = Deconvolver::new(control, vec![dirty], vec![psf]).unwrap();
//! let mut metrics = DeconvolutionMetrics::default();
//! let stage = deconvolver.deconvolve(&mut metrics).unwrap();
//! assert_eq!(stage, CleanStage::Converged);
//! assert!((deconvolver.model(0)[(16, 16)] - 4.0).abs() < 0.01);
//! ```


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::{Backend, ThreadedBackend};
use crate::basis::BasisFunctionSet;
use crate::config::DeconvolutionControl;
use crate::coupling::{CouplingMatrixCache, crop_psf};
use crate::error::{Error, Result, ensure_shape};
use crate::fft::{Complex32, Fft2d};
use crate::image::{Image, Shape};
use crate::mask::MaskManager;
use crate::metrics::{DeconvolutionMetrics, timed};
use crate::residual_basis::ResidualBasisCache;
use crate::selector::{Component, ComponentSelector};
use crate::state::{CleanStage, DeconvolutionState, Monitor};
use crate::update::{ModelUpdater, TermBaseFlux};
use crate::version::InputVersions;

/// Multi-term, multi-scale CLEAN solver.
pub struct Deconvolver<B: Backend = ThreadedBackend> {
    control: DeconvolutionControl,
    backend: B,
    selector: ComponentSelector,
    updater: ModelUpdater,

    basis: BasisFunctionSet,
    residuals: Vec<Image>,
    psfs: Vec<Image>,
    models: Vec<Image>,
    /// Model the residuals were last consistent with.
    reference_models: Vec<Image>,

    masks: MaskManager,
    coupling: Option<CouplingMatrixCache>,
    residual_basis: Option<ResidualBasisCache>,
    term_base_flux: TermBaseFlux,

    state: DeconvolutionState,
    versions: InputVersions,
    monitor: Monitor,
    stop_flag: Option<Arc<AtomicBool>>,
    /// Most recently subtracted component.
    last_component: Option<Component>,
}

impl Deconvolver<ThreadedBackend> {
    /// Solver on a rayon pool with the default number of threads.
    pub fn new(
        control: DeconvolutionControl,
        residuals: Vec<Image>,
        psfs: Vec<Image>,
    ) -> Result<Self> {
        let backend = ThreadedBackend::new(None)?;
        Self::with_backend(control, residuals, psfs, backend)
    }
}

impl<B: Backend> Deconvolver<B> {
    /// Solver for `residuals` (one image per Taylor term) and the `2T - 1`
    /// image PSF long vector. Shapes and counts are checked by
    /// [`Deconvolver::initialize`].
    pub fn with_backend(
        control: DeconvolutionControl,
        residuals: Vec<Image>,
        psfs: Vec<Image>,
        backend: B,
    ) -> Result<Self> {
        control.validate()?;
        let shape = residuals.first().map(Image::shape).unwrap_or_default();
        let basis = BasisFunctionSet::new(control.scales.clone(), control.orthogonal_basis);
        let models = vec![Image::zeros(shape); residuals.len()];
        let state = DeconvolutionState {
            decoupled_mode: control.decoupled,
            ..Default::default()
        };

        tracing::debug!(
            "Deconvolver: {} terms on {} image, {} scales, {} backend",
            residuals.len(),
            shape,
            basis.num_bases(),
            backend.name()
        );

        Ok(Self {
            selector: ComponentSelector::new(control.solution_type),
            updater: ModelUpdater::new(control.loop_gain),
            masks: MaskManager::new(basis.num_bases(), shape),
            term_base_flux: vec![vec![0.0; residuals.len()]; basis.num_bases()],
            reference_models: models.clone(),
            control,
            backend,
            basis,
            residuals,
            psfs,
            models,
            coupling: None,
            residual_basis: None,
            state,
            versions: InputVersions::default(),
            monitor: Monitor::default(),
            stop_flag: None,
            last_component: None,
        })
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Replaces the scale kernels. They are regenerated on the support window
    /// at the next initialization.
    pub fn set_basis_functions(&mut self, basis: BasisFunctionSet) {
        self.basis = basis;
        self.versions.basis.bump();
    }

    /// Replaces the residual images. The next initialization recomputes the
    /// residual basis from them.
    pub fn set_residuals(&mut self, residuals: Vec<Image>) {
        self.residuals = residuals;
        self.reference_models = self.models.clone();
        self.versions.residual.bump();
    }

    /// Replaces the PSF long vector.
    pub fn set_psfs(&mut self, psfs: Vec<Image>) {
        self.psfs = psfs;
        self.versions.psf.bump();
    }

    /// Installs or clears the weight map restricting the search.
    pub fn set_weight(&mut self, weight: Option<Image>) -> Result<()> {
        self.masks.set_weight(weight, self.control.solution_type)?;
        self.versions.weight.bump();
        Ok(())
    }

    /// Starts from an existing model. The residuals must already be the
    /// residuals of this model.
    pub fn set_model(&mut self, models: Vec<Image>) -> Result<()> {
        let terms = self.residuals.len();
        if models.len() != terms {
            return Err(Error::TermCount {
                what: "model",
                expected: terms,
                actual: models.len(),
            });
        }
        let shape = self.image_shape();
        for (t, model) in models.iter().enumerate() {
            ensure_shape("model", t, shape, model.shape())?;
        }
        self.models = models;
        self.reference_models = self.models.clone();
        for flux in &mut self.term_base_flux {
            flux.fill(0.0);
        }
        Ok(())
    }

    pub fn set_monitor(&mut self, monitor: Monitor) {
        self.monitor = monitor;
    }

    /// Flag polled between iterations; setting it stops the run.
    pub fn set_stop_flag(&mut self, flag: Arc<AtomicBool>) {
        self.stop_flag = Some(flag);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn control(&self) -> &DeconvolutionControl {
        &self.control
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn num_terms(&self) -> usize {
        self.residuals.len()
    }

    #[inline]
    pub fn basis(&self) -> &BasisFunctionSet {
        &self.basis
    }

    #[inline]
    pub fn models(&self) -> &[Image] {
        &self.models
    }

    #[inline]
    pub fn model(&self, t: usize) -> &Image {
        &self.models[t]
    }

    #[inline]
    pub fn residuals(&self) -> &[Image] {
        &self.residuals
    }

    #[inline]
    pub fn residual(&self, t: usize) -> &Image {
        &self.residuals[t]
    }

    #[inline]
    pub fn psfs(&self) -> &[Image] {
        &self.psfs
    }

    #[inline]
    pub fn state(&self) -> &DeconvolutionState {
        &self.state
    }

    /// Flux of every accepted component, indexed `[scale][term]`.
    #[inline]
    pub fn term_base_flux(&self) -> &TermBaseFlux {
        &self.term_base_flux
    }

    #[inline]
    pub fn masks(&self) -> &MaskManager {
        &self.masks
    }

    #[inline]
    pub fn coupling(&self) -> Option<&CouplingMatrixCache> {
        self.coupling.as_ref()
    }

    #[inline]
    pub fn residual_basis(&self) -> Option<&ResidualBasisCache> {
        self.residual_basis.as_ref()
    }

    #[inline]
    pub fn versions(&self) -> InputVersions {
        self.versions
    }

    /// Most recently subtracted component, if any.
    #[inline]
    pub fn last_component(&self) -> Option<&Component> {
        self.last_component.as_ref()
    }

    pub fn into_models(self) -> Vec<Image> {
        self.models
    }

    // ========================================================================
    // Solve
    // ========================================================================

    /// Checks the inputs and brings every cache up to date.
    pub fn initialize(&mut self, metrics: &mut DeconvolutionMetrics) -> Result<()> {
        let terms = self.residuals.len();
        if terms == 0 {
            return Err(Error::NoTerms);
        }
        let expected = 2 * terms - 1;
        if self.psfs.len() != expected {
            return Err(Error::PsfCount {
                terms,
                expected,
                actual: self.psfs.len(),
            });
        }
        let shape = self.image_shape();
        for (t, residual) in self.residuals.iter().enumerate() {
            ensure_shape("residual", t, shape, residual.shape())?;
        }
        for (order, psf) in self.psfs.iter().enumerate() {
            ensure_shape("psf", order, shape, psf.shape())?;
        }
        if self.models.len() != terms || self.models[0].shape() != shape {
            self.models = vec![Image::zeros(shape); terms];
            self.reference_models = self.models.clone();
        }

        let support = support_shape(shape, self.control.psf_width, self.basis.support_radius());
        if self.basis.shape() != Some(support) {
            self.basis.initialise(support);
            self.versions.basis.bump();
        }
        let num_bases = self.basis.num_bases();
        self.masks.resize(num_bases, shape);
        if self.state.deep_clean_mode && !self.masks.is_prepared_for(self.versions.weight) {
            self.masks.prepare(&self.backend, true, self.versions.weight);
        }
        if self.term_base_flux.len() != num_bases
            || self.term_base_flux.iter().any(|f| f.len() != terms)
        {
            self.term_base_flux = vec![vec![0.0; terms]; num_bases];
        }

        let coupling_current = self
            .coupling
            .as_ref()
            .is_some_and(|c| c.is_current(&self.versions) && c.num_terms() == terms);
        if !coupling_current {
            let (px, py, peak) = self.psfs[0].argmax();
            if peak <= 0.0 {
                tracing::warn!("PSF term 0 peaks at {} at ({}, {})", peak, px, py);
            }
            let window: Vec<Image> = self
                .psfs
                .iter()
                .map(|psf| crop_psf(psf, (px, py), support))
                .collect();
            let coupling = timed(&mut metrics.coupling_time, || {
                CouplingMatrixCache::build(
                    &self.backend,
                    &self.basis,
                    &window,
                    terms,
                    self.versions,
                )
            })?;
            metrics.coupling_builds += 1;
            self.coupling = Some(coupling);
            // The residual basis depends on normPSF.
            self.residual_basis = None;
        }

        let residual_basis_current = self
            .residual_basis
            .as_ref()
            .is_some_and(|rb| rb.is_current(&self.versions));
        if !residual_basis_current {
            let norm_psf = self.coupling.as_ref().map_or(1.0, CouplingMatrixCache::norm_psf);
            let residual_basis = timed(&mut metrics.residual_basis_time, || {
                ResidualBasisCache::build(
                    &self.backend,
                    &self.basis,
                    &self.residuals,
                    norm_psf,
                    self.versions,
                )
            });
            metrics.residual_basis_builds += 1;
            self.residual_basis = Some(residual_basis);
        }
        Ok(())
    }

    /// Runs minor cycles until a terminal stage, then recomputes the true
    /// residuals from the model change.
    ///
    /// With `target_iterations == 0` nothing is touched and the current stage
    /// is returned.
    pub fn deconvolve(&mut self, metrics: &mut DeconvolutionMetrics) -> Result<CleanStage> {
        if self.control.target_iterations == 0 {
            tracing::info!("Target iterations is zero, skipping deconvolution");
            return Ok(self.state.stage);
        }
        self.initialize(metrics)?;
        self.state.reset(self.control.decoupled);
        let deep = self.state.deep_clean_mode;
        self.masks.prepare(&self.backend, deep, self.versions.weight);

        tracing::info!(
            "Deconvolving {} terms, {} scales on {} image ({}, gain {}, {} backend)",
            self.num_terms(),
            self.basis.num_bases(),
            self.image_shape(),
            self.control.solution_type,
            self.control.loop_gain,
            self.backend.name()
        );

        let stage = loop {
            let stage = self.one_iteration(metrics)?;
            if stage.is_terminal() {
                break stage;
            }
        };

        tracing::info!(
            "Deconvolution finished: {} after {} iterations, peak residual {:e}, total flux {:.6}",
            stage,
            self.state.iteration_count,
            self.state.peak_residual,
            self.state.total_flux
        );

        self.update_residuals(metrics)?;
        Ok(stage)
    }

    /// One select-and-subtract step. Returns the stage after the step.
    ///
    /// A terminal stage means no component was subtracted.
    pub fn one_iteration(&mut self, metrics: &mut DeconvolutionMetrics) -> Result<CleanStage> {
        self.initialize(metrics)?;

        if self.stop_requested() {
            tracing::info!("Stop requested after {} iterations", self.state.iteration_count);
            self.state.stage = CleanStage::Cancelled;
            return Ok(self.state.stage);
        }
        if self.state.iteration_count >= self.control.target_iterations {
            self.state.stage = CleanStage::MaxIterationsReached;
            return Ok(self.state.stage);
        }

        let mut component = timed(&mut metrics.search_time, || {
            self.select(self.state.deep_clean_mode)
        })?;
        let mut abs_peak = component.as_ref().map_or(0.0, |c| c.abs_peak);
        if self.state.iteration_count == 0 {
            self.state.initial_objective_function = abs_peak;
        }

        let deep_threshold = self.control.deep_clean_threshold();
        if let Some(deep) = deep_threshold {
            if !self.state.deep_clean_mode
                && abs_peak < self.control.target_objective
                && abs_peak > deep
            {
                tracing::info!(
                    "Entering deep clean at iteration {}: peak {:e}, threshold {:e}",
                    self.state.iteration_count,
                    abs_peak,
                    deep
                );
                self.state.deep_clean_mode = true;
                self.state.stage = CleanStage::DeepClean;
                self.masks.prepare(&self.backend, true, self.versions.weight);
                component = timed(&mut metrics.search_time, || self.select(true))?;
                abs_peak = component.as_ref().map_or(0.0, |c| c.abs_peak);
            }
        }

        let converged = match deep_threshold {
            Some(deep) => abs_peak <= deep,
            None => abs_peak < self.control.target_objective || abs_peak == 0.0,
        };
        self.state.peak_residual = abs_peak;
        self.state.objective_function = abs_peak;

        match component {
            Some(component) if !converged => {
                tracing::debug!(
                    "Iteration {}: scale {} at {:?}, amplitudes {:?}, peak {:e}",
                    self.state.iteration_count,
                    component.scale,
                    component.position,
                    component.amplitudes,
                    abs_peak
                );
                timed(&mut metrics.update_time, || self.apply(&component))?;
                self.state.iteration_count += 1;
                metrics.iterations += 1;
                self.state.total_flux = self.models[0].sum();
                self.state.stage = if self.state.deep_clean_mode {
                    CleanStage::DeepClean
                } else {
                    CleanStage::Running
                };
                self.last_component = Some(component);
            }
            _ => self.state.stage = CleanStage::Converged,
        }

        self.monitor.report(&self.state);
        Ok(self.state.stage)
    }

    /// Recomputes the residuals from the model change since they were last
    /// consistent with the model:
    /// `residual[t1] -= Σ_t2 PSF[t1 + t2] ⊛ (model[t2] − reference[t2])`.
    pub fn update_residuals(&mut self, metrics: &mut DeconvolutionMetrics) -> Result<()> {
        let terms = self.residuals.len();
        if terms == 0 {
            return Err(Error::NoTerms);
        }
        if self.psfs.len() != 2 * terms - 1 {
            return Err(Error::PsfCount {
                terms,
                expected: 2 * terms - 1,
                actual: self.psfs.len(),
            });
        }
        let shape = self.image_shape();
        let start = std::time::Instant::now();

        let fft = Fft2d::new(Shape::new(2 * shape.width, 2 * shape.height));
        let models = &self.models;
        let reference = &self.reference_models;
        let delta_fft: Vec<Vec<Complex32>> = self.backend.map(terms, |t| {
            let pixels = models[t]
                .pixels()
                .iter()
                .zip(reference[t].pixels())
                .map(|(m, r)| m - r)
                .collect();
            let mut data = fft.embed_corner(&Image::new(shape.width, shape.height, pixels), 1.0);
            fft.forward(&mut data);
            data
        });
        let psfs = &self.psfs;
        let (px, py, _) = psfs[0].argmax();
        let psf_fft: Vec<Vec<Complex32>> = self.backend.map(psfs.len(), |order| {
            let mut data = fft.embed_origin(&psfs[order], (px, py));
            fft.forward(&mut data);
            data
        });

        let responses = self.backend.map(terms, |t1| {
            let mut data = fft.zeroed();
            for (t2, delta) in delta_fft.iter().enumerate() {
                for ((acc, d), p) in data.iter_mut().zip(delta).zip(&psf_fft[t1 + t2]) {
                    *acc += d * p;
                }
            }
            fft.inverse(&mut data);
            fft.extract_corner(&data, shape)
        });

        for (t, (residual, response)) in self.residuals.iter_mut().zip(&responses).enumerate() {
            for (r, d) in residual.pixels_mut().iter_mut().zip(response.pixels()) {
                *r -= d;
            }
            if let Some(v) = residual.pixels().iter().find(|v| !v.is_finite()) {
                tracing::warn!("Residual term {} contains {}", t, v);
            }
        }

        self.reference_models = self.models.clone();
        self.versions.residual.bump();
        metrics.residual_update_time += start.elapsed();
        tracing::debug!("Residuals updated from model change in {:?}", start.elapsed());
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn image_shape(&self) -> Shape {
        self.residuals.first().map(Image::shape).unwrap_or_default()
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn select(&self, deep: bool) -> Result<Option<Component>> {
        let (Some(coupling), Some(residual_basis)) = (&self.coupling, &self.residual_basis) else {
            return Err(Error::BasisFunctionUnset);
        };
        self.selector.select(
            &self.backend,
            residual_basis,
            coupling,
            &self.masks,
            deep,
            self.state.decoupled_mode,
        )
    }

    fn apply(&mut self, component: &Component) -> Result<()> {
        let (Some(coupling), Some(residual_basis)) = (&self.coupling, &mut self.residual_basis)
        else {
            return Err(Error::BasisFunctionUnset);
        };
        self.masks.mark(component.scale, component.position);
        self.updater.apply(
            &self.backend,
            component,
            &self.basis,
            &mut self.models,
            &mut self.term_base_flux,
            residual_basis,
            coupling,
        );
        Ok(())
    }
}

impl<B: Backend + std::fmt::Debug> std::fmt::Debug for Deconvolver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deconvolver")
            .field("control", &self.control)
            .field("backend", &self.backend)
            .field("terms", &self.residuals.len())
            .field("state", &self.state)
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}

/// Support window: `psf_width` (full image by default), at least large enough
/// for the largest basis kernel, never larger than the image.
pub(crate) fn support_shape(image: Shape, psf_width: Option<usize>, radius: usize) -> Shape {
    let min = 2 * radius + 1;
    let axis = |len: usize| psf_width.unwrap_or(len).max(min).min(len);
    Shape::new(axis(image.width), axis(image.height))
}
