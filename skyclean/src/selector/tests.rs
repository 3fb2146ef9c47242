use super::*;
use crate::backend::{SerialBackend, ThreadedBackend};
use crate::basis::BasisFunctionSet;
use crate::coupling::crop_psf;
use crate::image::{AlignedWindows, Image, Shape};
use crate::testing::synthetic::{add_noise, delta_psf, point_model, taylor_psfs};
use crate::version::InputVersions;

const SHAPE: Shape = Shape::new(24, 24);
const PEAK: (usize, usize) = (12, 12);
const SUPPORT: Shape = Shape::new(15, 15);

struct Fixture {
    basis: BasisFunctionSet,
    coupling: CouplingMatrixCache,
    residual_basis: ResidualBasisCache,
    masks: MaskManager,
}

impl Fixture {
    fn new(scales: &[f32], psfs: &[Image], residuals: &[Image]) -> Self {
        let mut basis = BasisFunctionSet::new(scales.to_vec(), false);
        basis.initialise(SUPPORT);
        let window: Vec<Image> = psfs.iter().map(|p| crop_psf(p, PEAK, SUPPORT)).collect();
        let coupling = CouplingMatrixCache::build(
            &SerialBackend,
            &basis,
            &window,
            residuals.len(),
            InputVersions::default(),
        )
        .unwrap();
        let residual_basis = ResidualBasisCache::build(
            &SerialBackend,
            &basis,
            residuals,
            coupling.norm_psf(),
            InputVersions::default(),
        );
        Self {
            masks: MaskManager::new(scales.len(), SHAPE),
            basis,
            coupling,
            residual_basis,
        }
    }

    fn select(
        &self,
        solution_type: SolutionType,
        deep: bool,
        decoupled: bool,
    ) -> Option<Component> {
        ComponentSelector::new(solution_type)
            .select(
                &SerialBackend,
                &self.residual_basis,
                &self.coupling,
                &self.masks,
                deep,
                decoupled,
            )
            .unwrap()
    }
}

/// Delta PSFs with moments [1, 0, 0.5]: coupling matrix diag(1, 0.5).
fn two_term_psfs() -> Vec<Image> {
    taylor_psfs(&delta_psf(SHAPE, PEAK), &[1.0, 0.0, 0.5])
}

#[test]
fn test_masked_abs_extremum_prefers_larger_magnitude() {
    let values = [1.0, -3.0, 2.0, 3.0, -3.0];
    let e = masked_abs_extremum(&values, None);
    // |min| == |max|: the maximum wins
    assert_eq!(e, Extremum { index: 3, value: 3.0 });

    let values = [1.0, -4.0, 2.0, 3.0, -4.0];
    let e = masked_abs_extremum(&values, None);
    assert_eq!(e, Extremum { index: 1, value: -4.0 });
}

#[test]
fn test_masked_abs_extremum_applies_mask() {
    let values = [5.0, 1.0, -2.0, 1.5];
    let mask = [0.0, 1.0, 0.5, 1.0];
    let e = masked_abs_extremum(&values, Some(&mask));
    assert_eq!(e, Extremum { index: 3, value: 1.5 });

    let empty = masked_abs_extremum(&[], None);
    assert_eq!(empty.value, 0.0);
}

#[test]
fn test_row_chunked_search_matches_single_pass() {
    let shape = Shape::new(7, 23);
    let mut values = Image::zeros(shape);
    add_noise(&mut values, 1.0, 11);
    // Equal minima in different row chunks: the earlier one wins.
    values[(2, 3)] = -4.0;
    values[(5, 19)] = -4.0;
    values[(6, 20)] = 3.5;
    let mask = Image::from_fn(shape, |x, y| if (3 * x + y) % 7 == 0 { 0.0 } else { 1.0 });

    let expected = masked_abs_extremum(values.pixels(), Some(mask.pixels()));
    assert_eq!(
        expected,
        Extremum {
            index: values.index_of(2, 3),
            value: -4.0
        }
    );
    let search = |backend: &ThreadedBackend, values: &Image| {
        search_rows(backend, shape, 1, |_, range| {
            MinMax::scan(range, Some(mask.pixels()), |i| values.pixels()[i])
        })
    };
    for threads in 1..=5 {
        let backend = ThreadedBackend::new(Some(threads)).unwrap();
        assert_eq!(search(&backend, &values), vec![expected], "{threads} threads");
    }

    // A non-finite value in the last row poisons the result for any chunking.
    values[(0, 22)] = f32::NAN;
    for threads in [1, 4] {
        let backend = ThreadedBackend::new(Some(threads)).unwrap();
        assert!(search(&backend, &values)[0].value.is_nan());
    }
}

#[test]
fn test_maxbase_point_source_picks_point_scale() {
    let residual = point_model(SHAPE, &[(7, 9, 5.0)]);
    let fixture = Fixture::new(&[0.0, 3.0], &[delta_psf(SHAPE, PEAK)], &[residual]);

    let component = fixture.select(SolutionType::MaxBase, false, true).unwrap();
    assert_eq!(component.scale, 0);
    assert_eq!(component.position, (7, 9));
    assert!((component.amplitudes[0] - 5.0).abs() < 1e-4);
    assert!((component.abs_peak - 5.0).abs() < 1e-4);
}

#[test]
fn test_maxbase_extended_source_picks_matching_scale() {
    let fixture_basis = {
        let mut basis = BasisFunctionSet::new(vec![0.0, 3.0], false);
        basis.initialise(SUPPORT);
        basis
    };
    // Residual is the scale-3 kernel itself, centred on (11, 10).
    let mut residual = Image::zeros(SHAPE);
    let windows = AlignedWindows::new(SHAPE, (11, 10), SUPPORT, SUPPORT.center()).unwrap();
    let kernel = fixture_basis.function(1);
    for row in 0..windows.image.height {
        for col in 0..windows.image.width {
            residual[(windows.image.x + col, windows.image.y + row)] =
                4.0 * kernel[(windows.kernel.x + col, windows.kernel.y + row)];
        }
    }
    let fixture = Fixture::new(&[0.0, 3.0], &[delta_psf(SHAPE, PEAK)], &[residual]);
    assert_eq!(fixture.basis.function(1), kernel);

    let component = fixture.select(SolutionType::MaxBase, false, true).unwrap();
    assert_eq!(component.scale, 1);
    assert_eq!(component.position, (11, 10));
    // Amplitude of the matching kernel is recovered exactly by the coupling inverse.
    assert!((component.amplitudes[0] - 4.0).abs() < 1e-3);
}

#[test]
fn test_tie_keeps_earlier_scale() {
    let residual = point_model(SHAPE, &[(3, 3, -2.0), (20, 20, 1.0)]);
    let fixture = Fixture::new(&[0.0, 0.0], &[delta_psf(SHAPE, PEAK)], &[residual]);
    for solution_type in [SolutionType::MaxBase, SolutionType::MaxTerm0, SolutionType::MaxChisq] {
        let component = fixture.select(solution_type, false, true).unwrap();
        assert_eq!(component.scale, 0, "{solution_type}");
    }
}

#[test]
fn test_maxterm0_decouples_terms() {
    // Model amplitudes [1, 4] give residual terms [1, 0.5 * 4].
    let residuals = vec![
        point_model(SHAPE, &[(5, 6, 1.0)]),
        point_model(SHAPE, &[(5, 6, 2.0)]),
    ];
    let fixture = Fixture::new(&[0.0], &two_term_psfs(), &residuals);

    let component = fixture.select(SolutionType::MaxTerm0, false, true).unwrap();
    assert_eq!(component.position, (5, 6));
    assert!((component.amplitudes[0] - 1.0).abs() < 1e-4);
    assert!((component.amplitudes[1] - 4.0).abs() < 1e-4);
    assert!((component.abs_peak - 1.0).abs() < 1e-4);
}

#[test]
fn test_maxchisq_reports_root_of_negchisq() {
    let residuals = vec![
        point_model(SHAPE, &[(5, 6, 1.0)]),
        point_model(SHAPE, &[(5, 6, 2.0)]),
    ];
    let fixture = Fixture::new(&[0.0], &two_term_psfs(), &residuals);

    // negchisq = 1 * 1 + 4 * 2
    let component = fixture.select(SolutionType::MaxChisq, false, true).unwrap();
    assert!((component.abs_peak - 3.0).abs() < 1e-4);
}

#[test]
fn test_coupled_estimate_overrides_abs_peak() {
    let residuals = vec![
        point_model(SHAPE, &[(5, 6, 1.0)]),
        point_model(SHAPE, &[(5, 6, 2.0)]),
    ];
    let fixture = Fixture::new(&[0.0], &two_term_psfs(), &residuals);

    let coupled = fixture.select(SolutionType::MaxTerm0, false, false).unwrap();
    let decoupled = fixture.select(SolutionType::MaxTerm0, false, true).unwrap();
    assert_eq!(coupled.position, decoupled.position);
    assert_eq!(coupled.amplitudes, decoupled.amplitudes);
    // Largest term response is term 1
    assert!((coupled.abs_peak - 2.0).abs() < 1e-4);
    assert!((decoupled.abs_peak - 1.0).abs() < 1e-4);

    // Deep mode keeps the criterion value as well.
    let mut fixture = fixture;
    fixture.masks.mark(0, (5, 6));
    let deep = fixture.select(SolutionType::MaxTerm0, true, false).unwrap();
    assert!((deep.abs_peak - 1.0).abs() < 1e-4);
}

#[test]
fn test_weight_mask_excludes_pixels() {
    let residual = point_model(SHAPE, &[(4, 4, 9.0), (15, 8, 3.0)]);
    let mut fixture = Fixture::new(&[0.0], &[delta_psf(SHAPE, PEAK)], &[residual]);
    let mut weight = Image::filled(SHAPE, 1.0);
    weight[(4, 4)] = 0.0;
    fixture.masks.set_weight(Some(weight), SolutionType::MaxBase).unwrap();

    let component = fixture.select(SolutionType::MaxBase, false, true).unwrap();
    assert_eq!(component.position, (15, 8));
    assert!((component.amplitudes[0] - 3.0).abs() < 1e-4);
}

#[test]
fn test_deep_search_restricted_to_marked_pixels() {
    let residual = point_model(SHAPE, &[(4, 4, 9.0), (15, 8, 3.0)]);
    let mut fixture = Fixture::new(&[0.0], &[delta_psf(SHAPE, PEAK)], &[residual]);
    fixture.masks.mark(0, (15, 8));

    let component = fixture.select(SolutionType::MaxBase, true, false).unwrap();
    assert_eq!(component.position, (15, 8));
    assert!((component.abs_peak - 3.0).abs() < 1e-4);
}

#[test]
fn test_zero_scales_selects_nothing() {
    let residual = point_model(SHAPE, &[(4, 4, 1.0)]);
    let fixture = Fixture::new(&[], &[delta_psf(SHAPE, PEAK)], &[residual]);
    assert!(fixture.select(SolutionType::MaxChisq, false, false).is_none());
}

#[test]
fn test_non_finite_residual_is_an_error() {
    let mut residual = point_model(SHAPE, &[(4, 4, 1.0)]);
    residual[(10, 10)] = f32::NAN;
    let fixture = Fixture::new(&[0.0], &[delta_psf(SHAPE, PEAK)], &[residual]);
    let err = ComponentSelector::new(SolutionType::MaxBase)
        .select(
            &SerialBackend,
            &fixture.residual_basis,
            &fixture.coupling,
            &fixture.masks,
            false,
            true,
        )
        .unwrap_err();
    assert_eq!(err.scale(), Some(0));
}

#[test]
fn test_threaded_selection_matches_serial() {
    let residuals = vec![
        point_model(SHAPE, &[(5, 6, 1.0), (17, 3, -0.7), (9, 20, 0.4)]),
        point_model(SHAPE, &[(5, 6, 2.0), (17, 3, 0.1), (9, 20, -0.3)]),
    ];
    let fixture = Fixture::new(&[0.0, 2.0, 4.0], &two_term_psfs(), &residuals);
    let threaded = ThreadedBackend::new(Some(3)).unwrap();
    for solution_type in [SolutionType::MaxBase, SolutionType::MaxTerm0, SolutionType::MaxChisq] {
        let selector = ComponentSelector::new(solution_type);
        let (rb, coupling, masks) = (&fixture.residual_basis, &fixture.coupling, &fixture.masks);
        let a = selector.select(&SerialBackend, rb, coupling, masks, false, false).unwrap();
        let b = selector.select(&threaded, rb, coupling, masks, false, false).unwrap();
        assert_eq!(a, b);
    }
}
