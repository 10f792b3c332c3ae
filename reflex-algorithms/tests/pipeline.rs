use nalgebra::Vector3;
use reflex_algorithms::{BackgroundConfig, BackgroundModel, IntegrationParams, Integrator};
use reflex_core::{
    Beam, BoundingBox, Detector, Experiment, Goniometer, GridMethod, MaskCode, Panel,
    ProfileConfig, Reflection, ReflectionFlags, ReflectionTable, Scan, Shoebox,
};

const BACKGROUND: f64 = 2.0;
const HALF_XY: i32 = 6;
const HALF_Z: i32 = 4;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn experiment() -> Experiment {
    let panel = Panel {
        origin: Vector3::new(-20.0, 40.0, -100.0),
        fast_axis: Vector3::new(1.0, 0.0, 0.0),
        slow_axis: Vector3::new(0.0, -1.0, 0.0),
        pixel_size: (0.2, 0.2),
        image_size: (200, 200),
    };
    Experiment::new(
        Beam::from_wavelength(1.0).unwrap(),
        Detector::new(vec![panel]),
        Goniometer::new(Vector3::new(1.0, 0.0, 0.0)).unwrap(),
        Scan::new((0, 100), (0.0, 0.005)).unwrap(),
    )
    .unwrap()
}

fn params() -> IntegrationParams {
    params_for(GridMethod::Single, BackgroundModel::Constant3d)
}

fn params_for(method: GridMethod, model: BackgroundModel) -> IntegrationParams {
    let profile = ProfileConfig::new(0.004, 0.005)
        .with_grid_size(4)
        .with_grid_method(method);
    IntegrationParams::new(profile, BackgroundConfig::new(model))
}

/// Gaussian spot of total `intensity` centred on pixel `(px, py)` and
/// frame `frame`, on a flat background.
#[allow(clippy::cast_possible_truncation)]
fn spot(exp: &Experiment, px: f64, py: f64, frame: f64, intensity: f64) -> Reflection<f32> {
    let (cx, cy, cz) = (px.floor() as i32, py.floor() as i32, frame.floor() as i32);
    let bbox = BoundingBox::new(
        cx - HALF_XY,
        cx + HALF_XY + 1,
        cy - HALF_XY,
        cy + HALF_XY + 1,
        cz - HALF_Z,
        cz + HALF_Z + 1,
    )
    .unwrap();
    let mut shoebox = Shoebox::<f32>::new(0, bbox).unwrap();

    let offset = |k: usize, j: usize, i: usize| {
        let at = |n: usize, lo: i32| f64::from(lo) + f64::from(u32::try_from(n).unwrap()) + 0.5;
        (at(i, bbox.x0) - px, at(j, bbox.y0) - py, at(k, bbox.z0) - frame)
    };
    let shape = |k: usize, j: usize, i: usize| {
        let (dx, dy, dz) = offset(k, j, i);
        (-(dx * dx + dy * dy) / (2.0 * 1.2 * 1.2) - dz * dz / (2.0 * 0.8 * 0.8)).exp()
    };
    let total: f64 = shoebox
        .data
        .indexed_iter()
        .map(|((k, j, i), _)| shape(k, j, i))
        .sum();

    for ((k, j, i), value) in shoebox.data.indexed_iter_mut() {
        #[allow(clippy::cast_possible_truncation)]
        let v = (BACKGROUND + intensity * shape(k, j, i) / total) as f32;
        *value = v;
    }
    for ((k, j, i), code) in shoebox.mask.indexed_iter_mut() {
        let (dx, dy, dz) = offset(k, j, i);
        *code = if dx * dx + dy * dy <= 16.0 && dz.abs() <= 2.5 {
            MaskCode::VALID | MaskCode::FOREGROUND
        } else {
            MaskCode::VALID | MaskCode::BACKGROUND
        };
    }

    let panel = &exp.detector.panels[0];
    let s1 = panel.pixel_to_lab(px, py).normalize() * exp.beam.s0.norm();
    let phi = exp.scan.angle_from_array_index(frame);
    Reflection::new(
        shoebox,
        s1,
        Vector3::new(px * 0.2, py * 0.2, phi),
        Vector3::new(px, py, frame),
    )
}

fn spot_table(exp: &Experiment) -> (ReflectionTable<f32>, Vec<f64>) {
    let mut table = ReflectionTable::with_capacity(12);
    let mut expected = Vec::new();
    let mut n = 0_u32;
    for py in [40.5, 80.5, 120.5] {
        for px in [40.5, 80.5, 120.5, 160.5] {
            let frame = [30.5, 50.5, 70.5][(n % 3) as usize];
            let intensity = 1000.0 * f64::from(n + 1);
            table.push(spot(exp, px, py, frame, intensity));
            expected.push(intensity);
            n += 1;
        }
    }
    (table, expected)
}

#[test]
fn test_pipeline_recovers_intensities() {
    init_logger();
    let exp = experiment();
    let (mut table, expected) = spot_table(&exp);
    let integrator = Integrator::new(&exp, params()).unwrap();
    let report = integrator.integrate(&mut table).unwrap();

    assert_eq!(report.num_reflections, 12);
    assert_eq!(report.num_overlaps, 0);
    assert_eq!(report.num_background, 12);
    assert_eq!(report.num_summed, 12);
    assert_eq!(report.num_modelled, 12);
    assert_eq!(report.num_fitted, 12);
    assert_eq!(report.reference.num_usable(), 1);

    for (index, &intensity) in expected.iter().enumerate() {
        let flags = table.flags[index];
        assert!(flags.contains(
            ReflectionFlags::BACKGROUND_FITTED
                | ReflectionFlags::INTEGRATED_SUM
                | ReflectionFlags::INTEGRATED_PRF
                | ReflectionFlags::USED_IN_MODELLING
                | ReflectionFlags::OVERLAP_CHECKED
        ));

        let sum = table.intensity_sum(index).unwrap();
        assert!(
            (sum.value - intensity).abs() < 0.05 * intensity,
            "summed {} for {intensity}",
            sum.value
        );
        assert!(sum.variance > 0.0);

        let prf = table.intensity_prf(index).unwrap();
        assert!(
            (prf.value - intensity).abs() < 0.1 * intensity,
            "profile fitted {} for {intensity}",
            prf.value
        );
        assert!(prf.variance > 0.0);
        assert!(table.profile_correlation[index] > 0.9);
        assert!((table.background_mean[index] - BACKGROUND).abs() < 0.1);
    }
}

#[test]
fn test_overlapping_neighbours_are_masked() {
    init_logger();
    let exp = experiment();
    let mut table = ReflectionTable::with_capacity(2);
    table.push(spot(&exp, 80.5, 80.5, 50.5, 5000.0));
    table.push(spot(&exp, 88.5, 80.5, 50.5, 3000.0));

    let integrator = Integrator::new(&exp, params()).unwrap();
    let report = integrator.integrate(&mut table).unwrap();

    assert_eq!(report.num_overlaps, 1);
    assert_eq!(report.num_overlap_masked, 2);
    for index in 0..2 {
        assert!(table.flags[index].contains(ReflectionFlags::OVERLAPPED_BG));
        assert!(!table.flags[index].contains(ReflectionFlags::OVERLAPPED_FG));
        assert!(table.flags[index].contains(ReflectionFlags::INTEGRATED_SUM));
        assert!(table.shoebox[index].count_mask_values(MaskCode::OVERLAPPED_BACKGROUND) > 0);
    }
    assert!((table.intensity_sum_value[0] - 5000.0).abs() < 250.0);
    assert!((table.intensity_sum_value[1] - 3000.0).abs() < 150.0);
}

#[test]
fn test_edge_and_rejected_reflections_keep_sentinels() {
    init_logger();
    let exp = experiment();
    let (mut table, _) = spot_table(&exp);
    // Box runs past the left edge of the image.
    table.push(spot(&exp, 3.5, 100.5, 50.5, 4000.0));
    // Excluded by the caller.
    table.push(spot(&exp, 100.5, 160.5, 40.5, 4000.0));
    table.flags[13].insert(ReflectionFlags::DONT_INTEGRATE);

    let integrator = Integrator::new(&exp, params()).unwrap();
    let report = integrator.integrate(&mut table).unwrap();

    assert_eq!(report.num_reflections, 14);
    assert_eq!(report.num_modelled, 12);
    assert_eq!(report.num_fitted, 12);

    assert!(table.flags[12].contains(ReflectionFlags::INTEGRATED_SUM));
    assert!(!table.flags[12].contains(ReflectionFlags::USED_IN_MODELLING));
    assert!(!table.flags[12].contains(ReflectionFlags::INTEGRATED_PRF));
    assert!(!table.intensity_prf(12).unwrap().is_valid());

    assert!(!table.flags[13].contains(ReflectionFlags::INTEGRATED_SUM));
    assert!(!table.intensity_sum(13).unwrap().is_valid());
    assert!(!table.intensity_prf(13).unwrap().is_valid());
    assert_eq!(table.profile_correlation[13], 0.0);
}

#[test]
fn test_multi_panel_rejects_grid_sampling() {
    let mut exp = experiment();
    let panel = exp.detector.panels[0];
    exp.detector.panels.push(panel);
    let params = IntegrationParams::new(
        ProfileConfig::default().with_grid_method(GridMethod::RegularGrid),
        BackgroundConfig::default(),
    );
    assert!(Integrator::new(&exp, params).is_err());
}

#[test]
fn test_pipeline_with_spatial_reference_cells() {
    init_logger();
    let exp = experiment();
    for method in [GridMethod::RegularGrid, GridMethod::CircularGrid] {
        let (mut table, expected) = spot_table(&exp);
        let integrator =
            Integrator::new(&exp, params_for(method, BackgroundModel::Constant3d)).unwrap();
        let report = integrator.integrate(&mut table).unwrap();

        let sampler = integrator.modeller().sampler();
        assert_eq!(report.reference.num_cells(), sampler.size());
        assert!(report.reference.num_usable() > 1, "{method:?}");

        let mut cells: Vec<usize> = table
            .xyzcal_px
            .iter()
            .map(|xyz| sampler.nearest(xyz).unwrap())
            .collect();
        cells.sort_unstable();
        cells.dedup();
        assert!(cells.len() > 1, "{method:?} put every spot in one cell");

        assert_eq!(report.num_modelled, 12, "{method:?}");
        assert_eq!(report.num_fitted, 12, "{method:?}");
        for (index, &intensity) in expected.iter().enumerate() {
            let prf = table.intensity_prf(index).unwrap();
            assert!(
                (prf.value - intensity).abs() < 0.1 * intensity,
                "{method:?}: profile fitted {} for {intensity}",
                prf.value
            );
            assert!(table.profile_correlation[index] > 0.9);
        }
    }
}

#[test]
fn test_single_row_background_is_rejected_by_plane_model() {
    init_logger();
    let exp = experiment();
    let (mut table, _) = spot_table(&exp);
    let mut degenerate = spot(&exp, 100.5, 100.5, 50.5, 4000.0);
    // Only the first row of each frame is left as background.
    for ((_, j, _), code) in degenerate.shoebox.mask.indexed_iter_mut() {
        if j > 0 && !code.has(MaskCode::FOREGROUND) {
            *code = MaskCode::VALID;
        }
    }
    table.push(degenerate);

    let integrator =
        Integrator::new(&exp, params_for(GridMethod::Single, BackgroundModel::Linear2d)).unwrap();
    let report = integrator.integrate(&mut table).unwrap();

    assert_eq!(report.num_background, 12);
    assert_eq!(report.num_summed, 12);
    assert_eq!(report.num_fitted, 12);
    let flags = table.flags[12];
    assert!(!flags.contains(ReflectionFlags::BACKGROUND_FITTED));
    assert!(flags.contains(ReflectionFlags::DONT_INTEGRATE));
    assert!(!flags.contains(ReflectionFlags::INTEGRATED_SUM));
    assert!(!table.intensity_sum(12).unwrap().is_valid());
    assert!(!table.intensity_prf(12).unwrap().is_valid());
    assert_eq!(table.background_mse[12], 0.0);
}
