//! Forward transform of shoebox pixels into the reciprocal-space profile
//! grid.
//!
//! The grid is centred on the reflection, with axes `(e3, e2, e1)` and
//! `(2g+1)^3` voxels. Each detector pixel is projected through the panel
//! geometry into the `(e1, e2)` plane, where its quadrilateral footprint is
//! split over the grid cells by area. Frames are split over the `e3` axis
//! by the mosaicity model. A voxel receives
//! `area fraction × frame fraction × pixel value` summed over all selected
//! pixels, so an unclipped transform conserves total intensity.

mod map_frames;
mod polygon;

pub use map_frames::MapFramesForward;
pub use polygon::{quad_to_grid, GridMatch};

use crate::coordinate_system::CoordinateSystem;
use nalgebra::{Vector2, Vector3};
use ndarray::{Array2, Array3, ArrayView3};
use reflex_core::{BoundingBox, Error, Experiment, Panel, Pixel, ProfileConfig, Result};

/// Shared, immutable description of the profile grid.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSpec {
    experiment: Experiment,
    sigma_b: f64,
    sigma_m: f64,
    n_sigma: f64,
    half_size: usize,
    grid_size: [usize; 3],
    step_size: [f64; 3],
    grid_centre: [f64; 3],
    map_frames: MapFramesForward,
}

impl TransformSpec {
    /// Grid of half-width `half_size` spanning `±n_sigma` standard
    /// deviations of beam divergence (`e1`, `e2`) and mosaicity (`e3`).
    pub fn new(
        experiment: &Experiment,
        sigma_b: f64,
        sigma_m: f64,
        n_sigma: f64,
        half_size: usize,
    ) -> Result<Self> {
        if !(sigma_b > 0.0 && sigma_m > 0.0 && n_sigma > 0.0) {
            return Err(Error::ConfigError(format!(
                "sigma_b ({sigma_b}), sigma_m ({sigma_m}) and n_sigma ({n_sigma}) must be positive"
            )));
        }
        if experiment.detector.is_empty() {
            return Err(Error::ConfigError("detector has no panels".into()));
        }
        #[allow(clippy::cast_precision_loss)]
        let half = half_size as f64 + 0.5;
        let extent = 2 * half_size + 1;
        let step_size = [
            sigma_m * n_sigma / half,
            sigma_b * n_sigma / half,
            sigma_b * n_sigma / half,
        ];
        let scan = &experiment.scan;
        let map_frames = MapFramesForward::new(
            scan.array_range.0,
            scan.oscillation.0,
            scan.oscillation.1,
            sigma_m,
            half_size,
            step_size[0],
        )?;

        Ok(Self {
            experiment: experiment.clone(),
            sigma_b,
            sigma_m,
            n_sigma,
            half_size,
            grid_size: [extent; 3],
            step_size,
            grid_centre: [half; 3],
            map_frames,
        })
    }

    /// Builds the grid description from a profile configuration.
    pub fn from_config(experiment: &Experiment, config: &ProfileConfig) -> Result<Self> {
        Self::new(
            experiment,
            config.sigma_b,
            config.sigma_m,
            config.n_sigma,
            config.grid_size,
        )
    }

    /// Geometry the grid was built for.
    #[must_use]
    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Beam divergence.
    #[must_use]
    pub fn sigma_b(&self) -> f64 {
        self.sigma_b
    }

    /// Mosaicity.
    #[must_use]
    pub fn sigma_m(&self) -> f64 {
        self.sigma_m
    }

    /// Extent of the grid in standard deviations.
    #[must_use]
    pub fn n_sigma(&self) -> f64 {
        self.n_sigma
    }

    /// Half-width `g`.
    #[must_use]
    pub fn half_size(&self) -> usize {
        self.half_size
    }

    /// Grid shape `(e3, e2, e1)`.
    #[must_use]
    pub fn grid_size(&self) -> [usize; 3] {
        self.grid_size
    }

    /// Voxel sizes `(e3, e2, e1)`.
    #[must_use]
    pub fn step_size(&self) -> [f64; 3] {
        self.step_size
    }

    /// Centre of the grid in voxel units.
    #[must_use]
    pub fn grid_centre(&self) -> [f64; 3] {
        self.grid_centre
    }

    /// Frame to grid mapping.
    #[must_use]
    pub fn map_frames(&self) -> &MapFramesForward {
        &self.map_frames
    }
}

/// Transformed profile (and optionally background) of one reflection.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformForward<T = f64> {
    profile: Array3<T>,
    background: Option<Array3<T>>,
}

impl<T: Pixel> TransformForward<T> {
    /// Transforms the selected pixels of `image`.
    pub fn new(
        spec: &TransformSpec,
        cs: &CoordinateSystem,
        bbox: BoundingBox,
        panel: usize,
        image: ArrayView3<'_, T>,
        mask: ArrayView3<'_, bool>,
    ) -> Result<Self> {
        let (profile, _) = transform(spec, cs, bbox, panel, image, None, mask)?;
        Ok(Self {
            profile: profile.mapv(T::narrow),
            background: None,
        })
    }

    /// Transforms the selected pixels of `image` and `background` together.
    pub fn with_background(
        spec: &TransformSpec,
        cs: &CoordinateSystem,
        bbox: BoundingBox,
        panel: usize,
        image: ArrayView3<'_, T>,
        background: ArrayView3<'_, T>,
        mask: ArrayView3<'_, bool>,
    ) -> Result<Self> {
        let (profile, background) =
            transform(spec, cs, bbox, panel, image, Some(background), mask)?;
        Ok(Self {
            profile: profile.mapv(T::narrow),
            background: background.map(|b| b.mapv(T::narrow)),
        })
    }

    /// Transformed data.
    #[must_use]
    pub fn profile(&self) -> &Array3<T> {
        &self.profile
    }

    /// Transformed background, when one was given.
    #[must_use]
    pub fn background(&self) -> Option<&Array3<T>> {
        self.background.as_ref()
    }

    /// Profile and background grids.
    #[must_use]
    pub fn into_parts(self) -> (Array3<T>, Option<Array3<T>>) {
        (self.profile, self.background)
    }
}

fn check_shape<T>(array: &ArrayView3<'_, T>, expected: [usize; 3]) -> Result<()> {
    let (z, y, x) = array.dim();
    if [z, y, x] == expected {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            expected,
            found: [z, y, x],
        })
    }
}

/// Projects pixel corners into grid coordinates `(e1, e2)`.
struct CornerMapper<'a> {
    panel: &'a Panel,
    x0: i32,
    y0: i32,
    s1: Vector3<f64>,
    s1_length: f64,
    e1: Vector3<f64>,
    e2: Vector3<f64>,
    centre: [f64; 3],
    step: [f64; 3],
}

impl CornerMapper<'_> {
    #[allow(clippy::cast_precision_loss)]
    fn grid_coord(&self, j: usize, i: usize) -> Vector2<f64> {
        let sp = self.panel.pixel_to_lab(
            f64::from(self.x0) + i as f64,
            f64::from(self.y0) + j as f64,
        );
        let ds = sp.normalize() * self.s1_length - self.s1;
        Vector2::new(
            self.centre[2] + self.e1.dot(&ds) / self.step[2],
            self.centre[1] + self.e2.dot(&ds) / self.step[1],
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn transform<T: Pixel>(
    spec: &TransformSpec,
    cs: &CoordinateSystem,
    bbox: BoundingBox,
    panel: usize,
    image: ArrayView3<'_, T>,
    background: Option<ArrayView3<'_, T>>,
    mask: ArrayView3<'_, bool>,
) -> Result<(Array3<f64>, Option<Array3<f64>>)> {
    bbox.validate()?;
    let shape = bbox.shape();
    check_shape(&image, shape)?;
    check_shape(&mask, shape)?;
    if let Some(background) = &background {
        check_shape(background, shape)?;
    }

    let panel_model = spec.experiment.detector.panel(panel)?;
    let (width, height) = panel_model.image_size();
    if bbox.x0 < 0
        || bbox.y0 < 0
        || usize::try_from(bbox.x1).map_or(true, |x1| x1 > width)
        || usize::try_from(bbox.y1).map_or(true, |y1| y1 > height)
    {
        return Err(Error::BoundingBoxOutsideImage);
    }

    let s1 = cs.s1();
    let s1_length = s1.norm();
    if s1_length <= 0.0 {
        return Err(Error::degenerate("zero length diffracted beam vector"));
    }

    let zfraction: Array2<f64> = spec
        .map_frames
        .map((bbox.z0, bbox.z1), cs.phi(), cs.zeta())?;

    let mapper = CornerMapper {
        panel: panel_model,
        x0: bbox.x0,
        y0: bbox.y0,
        s1,
        s1_length,
        e1: cs.e1() / s1_length,
        e2: cs.e2() / s1_length,
        centre: spec.grid_centre,
        step: spec.step_size,
    };

    let [nz, ny, nx] = shape;
    let mut corners = Array2::from_elem((ny + 1, nx + 1), Vector2::zeros());
    for ((j, i), c) in corners.indexed_iter_mut() {
        *c = mapper.grid_coord(j, i);
    }

    let [gz, gy, gx] = spec.grid_size;
    let mut profile = Array3::<f64>::zeros((gz, gy, gx));
    let mut profile_bg = background.as_ref().map(|_| Array3::<f64>::zeros((gz, gy, gx)));

    for j in 0..ny {
        for i in 0..nx {
            let quad = [
                corners[[j, i]],
                corners[[j, i + 1]],
                corners[[j + 1, i + 1]],
                corners[[j + 1, i]],
            ];
            let matches = quad_to_grid(&quad, gy, gx);
            if matches.is_empty() {
                continue;
            }
            for k in 0..nz {
                if !mask[[k, j, i]] {
                    continue;
                }
                let value = image[[k, j, i]].widen();
                let bg_value = background.as_ref().map(|b| b[[k, j, i]].widen());
                for m in &matches {
                    for kk in 0..gz {
                        let zf = zfraction[[k, kk]];
                        if zf == 0.0 {
                            continue;
                        }
                        let weight = m.fraction * zf;
                        profile[[kk, m.row, m.col]] += value * weight;
                        if let (Some(out), Some(b)) = (profile_bg.as_mut(), bg_value) {
                            out[[kk, m.row, m.col]] += b * weight;
                        }
                    }
                }
            }
        }
    }
    Ok((profile, profile_bg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use reflex_core::{Beam, Detector, Goniometer, Scan};

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

    /// Reflection centred on pixel (150.5, 50.5) at frame 50.5.
    fn reflection(exp: &Experiment) -> (CoordinateSystem, BoundingBox) {
        let panel = &exp.detector.panels[0];
        let s0 = exp.beam.s0;
        let s1 = panel.pixel_to_lab(150.5, 50.5).normalize() * s0.norm();
        let phi = exp.scan.angle_from_array_index(50.5);
        let cs = CoordinateSystem::new(exp.goniometer.rotation_axis, s0, s1, phi).unwrap();
        let bbox = BoundingBox::new(146, 156, 46, 56, 48, 53).unwrap();
        (cs, bbox)
    }

    #[test]
    fn test_spec_grid() {
        let spec = TransformSpec::new(&experiment(), 0.01, 0.02, 3.0, 4).unwrap();
        assert_eq!(spec.grid_size(), [9, 9, 9]);
        assert_relative_eq!(spec.step_size()[0], 0.02 * 3.0 / 4.5);
        assert_relative_eq!(spec.step_size()[2], 0.01 * 3.0 / 4.5);
        assert_relative_eq!(spec.grid_centre()[1], 4.5);
        assert!(TransformSpec::new(&experiment(), 0.0, 0.02, 3.0, 4).is_err());
    }

    #[test]
    fn test_transform_conserves_intensity() {
        let exp = experiment();
        let spec = TransformSpec::new(&exp, 0.01, 0.02, 3.0, 4).unwrap();
        let (cs, bbox) = reflection(&exp);
        let image = Array3::from_shape_fn(bbox.shape(), |(k, j, i)| {
            1.0 + (k * 7 + j * 3 + i) as f64 % 5.0
        });
        let mask = Array3::from_elem(bbox.shape(), true);

        let transformed =
            TransformForward::new(&spec, &cs, bbox, 0, image.view(), mask.view()).unwrap();
        assert_eq!(transformed.profile().dim(), (9, 9, 9));
        assert_relative_eq!(transformed.profile().sum(), image.sum(), max_relative = 1e-9);
    }

    #[test]
    fn test_masked_pixels_are_excluded() {
        let exp = experiment();
        let spec = TransformSpec::new(&exp, 0.01, 0.02, 3.0, 4).unwrap();
        let (cs, bbox) = reflection(&exp);
        let image = Array3::<f32>::ones(bbox.shape());
        let mut mask = Array3::from_elem(bbox.shape(), true);
        mask.slice_mut(ndarray::s![.., 0..5, ..]).fill(false);

        let transformed =
            TransformForward::new(&spec, &cs, bbox, 0, image.view(), mask.view()).unwrap();
        assert_relative_eq!(transformed.profile().sum(), 250.0, max_relative = 1e-5);
    }

    #[test]
    fn test_background_transform_matches_profile_transform() {
        let exp = experiment();
        let spec = TransformSpec::new(&exp, 0.01, 0.02, 3.0, 4).unwrap();
        let (cs, bbox) = reflection(&exp);
        let image = Array3::from_elem(bbox.shape(), 3.0_f64);
        let background = Array3::from_elem(bbox.shape(), 1.5_f64);
        let mask = Array3::from_elem(bbox.shape(), true);

        let both = TransformForward::with_background(
            &spec,
            &cs,
            bbox,
            0,
            image.view(),
            background.view(),
            mask.view(),
        )
        .unwrap();
        let bg = both.background().unwrap();
        for (p, b) in both.profile().iter().zip(bg.iter()) {
            assert_abs_diff_eq!(*p, 2.0 * *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_transform_preconditions() {
        let exp = experiment();
        let spec = TransformSpec::new(&exp, 0.01, 0.02, 3.0, 4).unwrap();
        let (cs, bbox) = reflection(&exp);
        let image = Array3::<f64>::ones(bbox.shape());
        let mask = Array3::from_elem((5, 10, 9), true);
        assert!(matches!(
            TransformForward::new(&spec, &cs, bbox, 0, image.view(), mask.view()),
            Err(Error::ShapeMismatch { .. })
        ));

        let outside = BoundingBox::new(195, 205, 46, 56, 48, 53).unwrap();
        let mask = Array3::from_elem(outside.shape(), true);
        assert_eq!(
            TransformForward::new(&spec, &cs, outside, 0, image.view(), mask.view()),
            Err(Error::BoundingBoxOutsideImage)
        );
        assert!(matches!(
            TransformForward::new(&spec, &cs, bbox, 3, image.view(), mask.view()),
            Err(Error::IndexOutOfRange { .. })
        ));
    }
}
