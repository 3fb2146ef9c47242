//! Example: Deconvolve a synthetic two-term sky with point and extended sources
//!
//! Builds a Gaussian dirty beam with a linear spectral response, a sky with two
//! point sources and one Gaussian blob, forms the two Taylor-term dirty images
//! and runs two major cycles of multi-scale CLEAN on them.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=skyclean=debug cargo run --example two_term_sky
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use skyclean::{
    DeconvolutionControl, DeconvolutionMetrics, DeconvolutionState, Deconvolver, Image, Monitor,
    Shape, SolutionType, term_flux,
};
use tracing_subscriber::EnvFilter;

const SIZE: usize = 96;
const BEAM_SIGMA: f32 = 1.8;
/// Spectral moments of the dirty beam: PSF[k] = MOMENTS[k] · beam.
const MOMENTS: [f32; 3] = [1.0, 0.15, 0.45];

fn main() {
    init_tracing();

    let shape = Shape::new(SIZE, SIZE);
    let peak = shape.center();
    let beam = gaussian(shape, peak, BEAM_SIGMA, 1.0);
    let psfs: Vec<Image> = MOMENTS.iter().map(|&m| scaled(&beam, m)).collect();

    // Term 0 is the flux at the reference frequency, term 1 its spectral slope.
    let mut sky0 = gaussian(shape, (60, 40), 4.0, 1.0);
    let blob_flux = sky0.sum() as f32;
    sky0 = scaled(&sky0, 80.0 / blob_flux);
    sky0[(30, 30)] += 12.0;
    sky0[(70, 72)] += 6.0;
    let mut sky1 = Image::zeros(shape);
    sky1[(30, 30)] = -4.0;
    sky1[(70, 72)] = 1.5;

    let dirty = [0, 1].map(|t1| {
        let mut dirty = Image::zeros(shape);
        for (t2, sky) in [&sky0, &sky1].into_iter().enumerate() {
            let response = convolve(&psfs[t1 + t2], peak, sky);
            for (d, r) in dirty.pixels_mut().iter_mut().zip(response.pixels()) {
                *d += r;
            }
        }
        dirty
    });

    let control = DeconvolutionControl::default()
        .with_scales(vec![0.0, 4.0, 10.0])
        .with_solution_type(SolutionType::MaxChisq)
        .with_loop_gain(0.2)
        .with_target_objective(0.05)
        .with_deep_threshold(0.01)
        .with_target_iterations(400);

    let mut deconvolver =
        Deconvolver::new(control, dirty.to_vec(), psfs).expect("Failed to create deconvolver");

    let reported = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reported);
    deconvolver.set_monitor(Monitor::new(move |state: &DeconvolutionState| {
        counter.fetch_add(1, Ordering::Relaxed);
        if state.iteration_count % 50 == 0 {
            tracing::info!(
                iteration = state.iteration_count,
                peak = state.peak_residual,
                flux = state.total_flux,
                stage = %state.stage,
                "Progress"
            );
        }
    }));

    let mut metrics = DeconvolutionMetrics::default();
    for cycle in 1..=2 {
        let stage = deconvolver
            .deconvolve(&mut metrics)
            .expect("Deconvolution failed");
        tracing::info!(
            cycle,
            %stage,
            iterations = deconvolver.state().iteration_count,
            peak = deconvolver.state().peak_residual,
            "Major cycle done"
        );
    }

    for t in 0..deconvolver.num_terms() {
        tracing::info!(
            term = t,
            model_flux = deconvolver.model(t).sum(),
            booked_flux = term_flux(deconvolver.term_base_flux(), t),
            "Term summary"
        );
    }
    for (b, flux) in deconvolver.term_base_flux().iter().enumerate() {
        tracing::info!(scale = deconvolver.basis().scales()[b], ?flux, "Flux per scale");
    }

    tracing::info!(
        monitor_calls = reported.load(Ordering::Relaxed),
        total_ms = metrics.total_time().as_secs_f64() * 1000.0,
        mean_iteration_ms = metrics.mean_iteration_ms(),
        "Timing"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&metrics).expect("Failed to serialize metrics")
    );
}

fn gaussian(shape: Shape, center: (usize, usize), sigma: f32, peak: f32) -> Image {
    let inv = 1.0 / (2.0 * sigma * sigma);
    Image::from_fn(shape, |x, y| {
        let dx = x as f32 - center.0 as f32;
        let dy = y as f32 - center.1 as f32;
        peak * (-(dx * dx + dy * dy) * inv).exp()
    })
}

fn scaled(image: &Image, factor: f32) -> Image {
    let pixels = image.pixels().iter().map(|v| v * factor).collect();
    Image::new(image.width(), image.height(), pixels)
}

/// Direct linear convolution with the PSF peak as origin.
fn convolve(psf: &Image, peak: (usize, usize), sky: &Image) -> Image {
    let mut out = Image::zeros(sky.shape());
    for py in 0..sky.height() {
        for px in 0..sky.width() {
            let flux = sky[(px, py)];
            if flux.abs() < 1e-6 {
                continue;
            }
            for qy in 0..out.height() {
                let Some(sy) = (qy + peak.1).checked_sub(py).filter(|&s| s < psf.height()) else {
                    continue;
                };
                for qx in 0..out.width() {
                    if let Some(sx) = (qx + peak.0).checked_sub(px).filter(|&s| s < psf.width()) {
                        out[(qx, qy)] += flux * psf[(sx, sy)];
                    }
                }
            }
        }
    }
    out
}

/// Initialize tracing subscriber with console output.
fn init_tracing() {
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
