//! Reference profile samplers.
//!
//! A sampler divides the detector area and the scan into cells, each of
//! which holds one reference profile. Positions are `(x px, y px, frame)`.
//! Neighbourhood weights use the kernel `exp(-4 ln2 d²)` with `d` the
//! distance in cell steps, normalised to sum to 1 over the returned cells.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use nalgebra::Vector3;
use reflex_core::{Error, Experiment, GridMethod, ProfileConfig, Result};
use std::f64::consts::{LN_2, TAU};

/// Angular sectors in the outer ring of the circular sampler.
const NUM_SECTORS: usize = 8;

fn kernel(d2: f64) -> f64 {
    (-4.0 * LN_2 * d2).exp()
}

fn out_of_domain(xyz: &Vector3<f64>) -> Error {
    Error::OutOfDomain {
        x: xyz.x,
        y: xyz.y,
        z: xyz.z,
    }
}

/// Block of frames along the scan.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScanAxis {
    z0: f64,
    z1: f64,
    n: usize,
}

impl ScanAxis {
    fn new(scan_range: (i32, i32), n: usize) -> Result<Self> {
        if scan_range.1 <= scan_range.0 || n == 0 {
            return Err(Error::ConfigError(format!(
                "invalid scan sampling: range {scan_range:?}, {n} points"
            )));
        }
        Ok(Self {
            z0: f64::from(scan_range.0),
            z1: f64::from(scan_range.1),
            n,
        })
    }

    fn step(&self) -> f64 {
        (self.z1 - self.z0) / self.n as f64
    }

    fn contains(&self, z: f64) -> bool {
        z >= self.z0 && z <= self.z1
    }

    fn index(&self, z: f64) -> usize {
        (((z - self.z0) / self.step()).floor().max(0.0) as usize).min(self.n - 1)
    }

    fn centre(&self, iz: usize) -> f64 {
        self.z0 + (iz as f64 + 0.5) * self.step()
    }

    fn neighbours(&self, iz: usize) -> impl Iterator<Item = usize> {
        let lo = iz.saturating_sub(1);
        let hi = (iz + 1).min(self.n - 1);
        lo..=hi
    }
}

/// One cell per block of frames, ignoring detector position.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleSampler {
    scan: ScanAxis,
}

impl SingleSampler {
    /// Sampler splitting `scan_range` into `num_scan_points` blocks.
    pub fn new(scan_range: (i32, i32), num_scan_points: usize) -> Result<Self> {
        Ok(Self {
            scan: ScanAxis::new(scan_range, num_scan_points)?,
        })
    }

    fn size(&self) -> usize {
        self.scan.n
    }

    fn check(&self, xyz: &Vector3<f64>) -> Result<()> {
        if self.scan.contains(xyz.z) {
            Ok(())
        } else {
            Err(out_of_domain(xyz))
        }
    }

    fn nearest(&self, xyz: &Vector3<f64>) -> usize {
        self.scan.index(xyz.z)
    }

    fn neighbours(&self, xyz: &Vector3<f64>) -> Vec<usize> {
        self.scan.neighbours(self.nearest(xyz)).collect()
    }

    fn coord(&self, index: usize) -> Vector3<f64> {
        Vector3::new(0.0, 0.0, self.scan.centre(index))
    }

    fn distance2(&self, index: usize, xyz: &Vector3<f64>) -> f64 {
        ((xyz.z - self.scan.centre(index)) / self.scan.step()).powi(2)
    }
}

/// Regular `nx × ny` detector grid per block of frames.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSampler {
    image_size: (usize, usize),
    nx: usize,
    ny: usize,
    scan: ScanAxis,
}

impl GridSampler {
    /// Sampler with `grid = (nx, ny, nz)` cells over the image and scan.
    pub fn new(
        image_size: (usize, usize),
        scan_range: (i32, i32),
        grid: (usize, usize, usize),
    ) -> Result<Self> {
        let (nx, ny, nz) = grid;
        if image_size.0 == 0 || image_size.1 == 0 || nx == 0 || ny == 0 {
            return Err(Error::ConfigError(format!(
                "invalid detector grid {nx}x{ny} over {image_size:?}"
            )));
        }
        Ok(Self {
            image_size,
            nx,
            ny,
            scan: ScanAxis::new(scan_range, nz)?,
        })
    }

    fn step(&self) -> (f64, f64) {
        (
            self.image_size.0 as f64 / self.nx as f64,
            self.image_size.1 as f64 / self.ny as f64,
        )
    }

    fn size(&self) -> usize {
        self.nx * self.ny * self.scan.n
    }

    fn check(&self, xyz: &Vector3<f64>) -> Result<()> {
        let inside = xyz.x >= 0.0
            && xyz.y >= 0.0
            && xyz.x <= self.image_size.0 as f64
            && xyz.y <= self.image_size.1 as f64
            && self.scan.contains(xyz.z);
        if inside {
            Ok(())
        } else {
            Err(out_of_domain(xyz))
        }
    }

    fn cell(&self, xyz: &Vector3<f64>) -> (usize, usize, usize) {
        let (sx, sy) = self.step();
        let ix = ((xyz.x / sx).floor().max(0.0) as usize).min(self.nx - 1);
        let iy = ((xyz.y / sy).floor().max(0.0) as usize).min(self.ny - 1);
        (ix, iy, self.scan.index(xyz.z))
    }

    fn index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        ix + self.nx * (iy + self.ny * iz)
    }

    fn nearest(&self, xyz: &Vector3<f64>) -> usize {
        let (ix, iy, iz) = self.cell(xyz);
        self.index(ix, iy, iz)
    }

    fn neighbours(&self, xyz: &Vector3<f64>) -> Vec<usize> {
        let (ix, iy, iz) = self.cell(xyz);
        let mut cells = Vec::with_capacity(27);
        for kz in self.scan.neighbours(iz) {
            for ky in iy.saturating_sub(1)..=(iy + 1).min(self.ny - 1) {
                for kx in ix.saturating_sub(1)..=(ix + 1).min(self.nx - 1) {
                    cells.push(self.index(kx, ky, kz));
                }
            }
        }
        cells
    }

    fn coord(&self, index: usize) -> Vector3<f64> {
        let (sx, sy) = self.step();
        let ix = index % self.nx;
        let iy = (index / self.nx) % self.ny;
        let iz = index / (self.nx * self.ny);
        Vector3::new(
            (ix as f64 + 0.5) * sx,
            (iy as f64 + 0.5) * sy,
            self.scan.centre(iz),
        )
    }

    fn distance2(&self, index: usize, xyz: &Vector3<f64>) -> f64 {
        let (sx, sy) = self.step();
        let c = self.coord(index);
        ((xyz.x - c.x) / sx).powi(2)
            + ((xyz.y - c.y) / sy).powi(2)
            + ((xyz.z - c.z) / self.scan.step()).powi(2)
    }
}

/// Central disc plus a ring of angular sectors per block of frames.
#[derive(Debug, Clone, PartialEq)]
pub struct CircleSampler {
    image_size: (usize, usize),
    centre: (f64, f64),
    /// Radius of the central disc; the ring is one disc radius wide.
    r1: f64,
    scan: ScanAxis,
}

impl CircleSampler {
    /// Sampler centred on the image with `num_scan_points` scan blocks.
    pub fn new(image_size: (usize, usize), scan_range: (i32, i32), num_scan_points: usize) -> Result<Self> {
        if image_size.0 == 0 || image_size.1 == 0 {
            return Err(Error::ConfigError(format!(
                "invalid image size {image_size:?}"
            )));
        }
        let (w, h) = (image_size.0 as f64, image_size.1 as f64);
        Ok(Self {
            image_size,
            centre: (w / 2.0, h / 2.0),
            r1: w.min(h) / 2.0 / 3.0,
            scan: ScanAxis::new(scan_range, num_scan_points)?,
        })
    }

    fn cells_per_frame_block() -> usize {
        NUM_SECTORS + 1
    }

    fn size(&self) -> usize {
        Self::cells_per_frame_block() * self.scan.n
    }

    fn check(&self, xyz: &Vector3<f64>) -> Result<()> {
        let inside = xyz.x >= 0.0
            && xyz.y >= 0.0
            && xyz.x <= self.image_size.0 as f64
            && xyz.y <= self.image_size.1 as f64
            && self.scan.contains(xyz.z);
        if inside {
            Ok(())
        } else {
            Err(out_of_domain(xyz))
        }
    }

    /// In-plane cell: 0 for the disc, `1..=8` for the sectors.
    fn plane_cell(&self, x: f64, y: f64) -> usize {
        let (dx, dy) = (x - self.centre.0, y - self.centre.1);
        if dx.hypot(dy) < self.r1 {
            return 0;
        }
        let theta = dy.atan2(dx).rem_euclid(TAU);
        1 + ((theta / (TAU / NUM_SECTORS as f64)) as usize).min(NUM_SECTORS - 1)
    }

    fn nearest(&self, xyz: &Vector3<f64>) -> usize {
        self.plane_cell(xyz.x, xyz.y) + Self::cells_per_frame_block() * self.scan.index(xyz.z)
    }

    fn neighbours(&self, xyz: &Vector3<f64>) -> Vec<usize> {
        let plane = self.plane_cell(xyz.x, xyz.y);
        let in_plane: Vec<usize> = if plane == 0 {
            (0..=NUM_SECTORS).collect()
        } else {
            let s = plane - 1;
            vec![
                plane,
                0,
                1 + (s + NUM_SECTORS - 1) % NUM_SECTORS,
                1 + (s + 1) % NUM_SECTORS,
            ]
        };
        self.scan
            .neighbours(self.scan.index(xyz.z))
            .flat_map(|iz| {
                in_plane
                    .iter()
                    .map(move |&c| c + Self::cells_per_frame_block() * iz)
            })
            .collect()
    }

    fn coord(&self, index: usize) -> Vector3<f64> {
        let plane = index % Self::cells_per_frame_block();
        let iz = index / Self::cells_per_frame_block();
        let (x, y) = if plane == 0 {
            self.centre
        } else {
            let theta = (plane as f64 - 0.5) * TAU / NUM_SECTORS as f64;
            let r = 2.0 * self.r1;
            (self.centre.0 + r * theta.cos(), self.centre.1 + r * theta.sin())
        };
        Vector3::new(x, y, self.scan.centre(iz))
    }

    fn distance2(&self, index: usize, xyz: &Vector3<f64>) -> f64 {
        let c = self.coord(index);
        ((xyz.x - c.x).powi(2) + (xyz.y - c.y).powi(2)) / (self.r1 * self.r1)
            + ((xyz.z - c.z) / self.scan.step()).powi(2)
    }
}

/// Sampler variant chosen once from configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Sampler {
    /// [`GridMethod::Single`](reflex_core::GridMethod::Single).
    Single(SingleSampler),
    /// [`GridMethod::RegularGrid`](reflex_core::GridMethod::RegularGrid).
    Grid(GridSampler),
    /// [`GridMethod::CircularGrid`](reflex_core::GridMethod::CircularGrid).
    Circle(CircleSampler),
}

impl Sampler {
    /// Builds the sampler named by `config.grid_method`.
    ///
    /// Grid and circle samplers need a single-panel detector.
    pub fn from_config(experiment: &Experiment, config: &ProfileConfig) -> Result<Self> {
        let scan_range = experiment.scan.array_range;
        let nz = config.num_scan_points;
        if config.grid_method == GridMethod::Single {
            return Ok(Sampler::Single(SingleSampler::new(scan_range, nz)?));
        }
        if experiment.detector.len() != 1 {
            return Err(Error::ConfigError(format!(
                "{:?} sampling needs exactly one panel, detector has {}",
                config.grid_method,
                experiment.detector.len()
            )));
        }
        let image_size = experiment.detector.panel(0)?.image_size();
        match config.grid_method {
            GridMethod::Single => Ok(Sampler::Single(SingleSampler::new(scan_range, nz)?)),
            GridMethod::RegularGrid => Ok(Sampler::Grid(GridSampler::new(
                image_size,
                scan_range,
                (3, 3, nz),
            )?)),
            GridMethod::CircularGrid => Ok(Sampler::Circle(CircleSampler::new(
                image_size, scan_range, nz,
            )?)),
        }
    }

    /// Number of cells.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Sampler::Single(s) => s.size(),
            Sampler::Grid(s) => s.size(),
            Sampler::Circle(s) => s.size(),
        }
    }

    fn check(&self, xyz: &Vector3<f64>) -> Result<()> {
        match self {
            Sampler::Single(s) => s.check(xyz),
            Sampler::Grid(s) => s.check(xyz),
            Sampler::Circle(s) => s.check(xyz),
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        let len = self.size();
        if index < len {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange { index, len })
        }
    }

    /// Cell containing `xyz`.
    pub fn nearest(&self, xyz: &Vector3<f64>) -> Result<usize> {
        self.check(xyz)?;
        Ok(match self {
            Sampler::Single(s) => s.nearest(xyz),
            Sampler::Grid(s) => s.nearest(xyz),
            Sampler::Circle(s) => s.nearest(xyz),
        })
    }

    /// Cells around `xyz` with normalised weights; the nearest cell comes
    /// first.
    pub fn nearest_n(&self, xyz: &Vector3<f64>) -> Result<Vec<(usize, f64)>> {
        let nearest = self.nearest(xyz)?;
        let mut cells = match self {
            Sampler::Single(s) => s.neighbours(xyz),
            Sampler::Grid(s) => s.neighbours(xyz),
            Sampler::Circle(s) => s.neighbours(xyz),
        };
        cells.retain(|&c| c != nearest);
        cells.insert(0, nearest);

        let mut weighted: Vec<(usize, f64)> = cells
            .into_iter()
            .map(|c| (c, kernel(self.distance2(c, xyz))))
            .collect();
        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        if total > 0.0 && total.is_finite() {
            for (_, w) in &mut weighted {
                *w /= total;
            }
            Ok(weighted)
        } else {
            Ok(vec![(nearest, 1.0)])
        }
    }

    /// Unnormalised kernel weight of cell `index` at `xyz`.
    pub fn weight(&self, index: usize, xyz: &Vector3<f64>) -> Result<f64> {
        self.check_index(index)?;
        self.check(xyz)?;
        Ok(kernel(self.distance2(index, xyz)))
    }

    /// Centre of cell `index`.
    pub fn coord(&self, index: usize) -> Result<Vector3<f64>> {
        self.check_index(index)?;
        Ok(match self {
            Sampler::Single(s) => s.coord(index),
            Sampler::Grid(s) => s.coord(index),
            Sampler::Circle(s) => s.coord(index),
        })
    }

    fn distance2(&self, index: usize, xyz: &Vector3<f64>) -> f64 {
        match self {
            Sampler::Single(s) => s.distance2(index, xyz),
            Sampler::Grid(s) => s.distance2(index, xyz),
            Sampler::Circle(s) => s.distance2(index, xyz),
        }
    }
}
