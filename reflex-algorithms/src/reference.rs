//! Reference profile accumulation.
//!
//! Training adds unit-sum transformed profiles, scaled by sampler
//! weights, into one voxel grid per sampler cell. Every voxel a profile
//! reaches also gains that profile's weight. Accumulation is a plain sum,
//! so partial accumulators built on different workers can be merged in any
//! order. Normalisation happens once, in [`ReferenceAccumulator::finalize`].

use ndarray::{Array3, ArrayView3, Zip};
use reflex_core::{Error, Result};

/// Data quality of one finalized reference profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceQuality {
    /// At least one voxel is usable.
    Ok,
    /// No voxel has enough weight and signal.
    InsufficientData,
}

/// Mutable, mergeable sum of training profiles.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceAccumulator {
    grid_size: [usize; 3],
    sum: Vec<Array3<f64>>,
    voxel_weight: Vec<Array3<f64>>,
    weight: Vec<f64>,
    count: Vec<usize>,
}

impl ReferenceAccumulator {
    /// Empty accumulator for `num_cells` cells of `grid_size` voxels.
    #[must_use]
    pub fn new(num_cells: usize, grid_size: [usize; 3]) -> Self {
        Self {
            grid_size,
            sum: vec![Array3::zeros(grid_size); num_cells],
            voxel_weight: vec![Array3::zeros(grid_size); num_cells],
            weight: vec![0.0; num_cells],
            count: vec![0; num_cells],
        }
    }

    /// Number of sampler cells.
    #[must_use]
    pub fn num_cells(&self) -> usize {
        self.sum.len()
    }

    /// Voxels per profile along `(z, y, x)`.
    #[must_use]
    pub fn grid_size(&self) -> [usize; 3] {
        self.grid_size
    }

    /// Accumulated weight of `cell`.
    pub fn weight(&self, cell: usize) -> Result<f64> {
        self.check_cell(cell)?;
        Ok(self.weight[cell])
    }

    /// Accumulated weight of every voxel of `cell`.
    pub fn voxel_weight(&self, cell: usize) -> Result<&Array3<f64>> {
        self.check_cell(cell)?;
        Ok(&self.voxel_weight[cell])
    }

    /// Number of profiles added to `cell`.
    pub fn count(&self, cell: usize) -> Result<usize> {
        self.check_cell(cell)?;
        Ok(self.count[cell])
    }

    fn check_cell(&self, cell: usize) -> Result<()> {
        if cell < self.sum.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                index: cell,
                len: self.sum.len(),
            })
        }
    }

    /// Adds `profile`, normalised to unit sum, with weight `weight` to
    /// `cell`. Voxels where the profile is non-zero gain `weight`.
    /// Profiles with a non-positive total carry no shape and are rejected.
    pub fn add(&mut self, cell: usize, weight: f64, profile: &ArrayView3<'_, f64>) -> Result<()> {
        self.check_cell(cell)?;
        let (z, y, x) = profile.dim();
        if [z, y, x] != self.grid_size {
            return Err(Error::ShapeMismatch {
                expected: self.grid_size,
                found: [z, y, x],
            });
        }
        if !(weight >= 0.0 && weight.is_finite()) {
            return Err(Error::ConfigError(format!("invalid profile weight {weight}")));
        }
        let total = profile.sum();
        if !(total > 0.0 && total.is_finite()) {
            return Err(Error::InsufficientReference(cell));
        }
        let scale = weight / total;
        Zip::from(&mut self.sum[cell])
            .and(&mut self.voxel_weight[cell])
            .and(profile)
            .for_each(|s, w, &p| {
                if p.abs() > 0.0 {
                    *s += p * scale;
                    *w += weight;
                }
            });
        self.weight[cell] += weight;
        self.count[cell] += 1;
        Ok(())
    }

    /// Adds another accumulator's contents to this one.
    pub fn merge(&mut self, other: &ReferenceAccumulator) -> Result<()> {
        if other.grid_size != self.grid_size || other.sum.len() != self.sum.len() {
            return Err(Error::ConfigError(format!(
                "cannot merge accumulators of {} x {:?} and {} x {:?}",
                self.sum.len(),
                self.grid_size,
                other.sum.len(),
                other.grid_size
            )));
        }
        for (mine, theirs) in self.sum.iter_mut().zip(&other.sum) {
            *mine += theirs;
        }
        for (mine, theirs) in self.voxel_weight.iter_mut().zip(&other.voxel_weight) {
            *mine += theirs;
        }
        for (mine, theirs) in self.weight.iter_mut().zip(&other.weight) {
            *mine += theirs;
        }
        for (mine, theirs) in self.count.iter_mut().zip(&other.count) {
            *mine += theirs;
        }
        Ok(())
    }

    /// Normalises every cell.
    ///
    /// Each voxel sum is divided by the voxel's accumulated weight. A voxel
    /// is usable when that weight exceeds `min_weight` and its value is
    /// positive and at least `threshold` times the largest such value in
    /// the cell. Unusable voxels are set to zero and the rest rescaled to
    /// unit sum.
    #[must_use]
    pub fn finalize(self, min_weight: f64, threshold: f64) -> ReferenceProfiles {
        let num_cells = self.sum.len();
        let mut data = Vec::with_capacity(num_cells);
        let mut mask = Vec::with_capacity(num_cells);
        let mut quality = Vec::with_capacity(num_cells);

        for (mut profile, voxel_weight) in self.sum.into_iter().zip(&self.voxel_weight) {
            let mut usable = Array3::from_elem(profile.raw_dim(), false);
            Zip::from(&mut profile)
                .and(&mut usable)
                .and(voxel_weight)
                .for_each(|v, u, &w| {
                    if w > min_weight && w > 0.0 {
                        *v /= w;
                        *u = *v > 0.0;
                    } else {
                        *v = 0.0;
                    }
                });

            let max = profile.fold(0.0_f64, |a, &b| a.max(b));
            let cutoff = threshold * max;
            let mut total = 0.0;
            Zip::from(&mut profile).and(&mut usable).for_each(|v, u| {
                if *u && *v >= cutoff {
                    total += *v;
                } else {
                    *u = false;
                    *v = 0.0;
                }
            });
            if total > 0.0 {
                profile.mapv_inplace(|v| v / total);
                quality.push(ReferenceQuality::Ok);
            } else {
                quality.push(ReferenceQuality::InsufficientData);
            }
            data.push(profile);
            mask.push(usable);
        }

        ReferenceProfiles {
            grid_size: self.grid_size,
            data,
            mask,
            quality,
            voxel_weight: self.voxel_weight,
            weight: self.weight,
            count: self.count,
        }
    }
}

/// Finalized, read-only reference profiles.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceProfiles {
    grid_size: [usize; 3],
    data: Vec<Array3<f64>>,
    mask: Vec<Array3<bool>>,
    quality: Vec<ReferenceQuality>,
    voxel_weight: Vec<Array3<f64>>,
    weight: Vec<f64>,
    count: Vec<usize>,
}

impl ReferenceProfiles {
    /// Number of sampler cells.
    #[must_use]
    pub fn num_cells(&self) -> usize {
        self.data.len()
    }

    /// Voxels per profile along `(z, y, x)`.
    #[must_use]
    pub fn grid_size(&self) -> [usize; 3] {
        self.grid_size
    }

    fn check_cell(&self, cell: usize) -> Result<()> {
        if cell < self.data.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                index: cell,
                len: self.data.len(),
            })
        }
    }

    /// Unit-sum profile of `cell`; unusable voxels read as zero.
    pub fn profile(&self, cell: usize) -> Result<&Array3<f64>> {
        self.check_cell(cell)?;
        Ok(&self.data[cell])
    }

    /// Usable-voxel mask of `cell`.
    pub fn mask(&self, cell: usize) -> Result<&Array3<bool>> {
        self.check_cell(cell)?;
        Ok(&self.mask[cell])
    }

    /// Data quality of `cell`.
    pub fn quality(&self, cell: usize) -> Result<ReferenceQuality> {
        self.check_cell(cell)?;
        Ok(self.quality[cell])
    }

    /// Profile and mask of `cell`, or [`Error::InsufficientReference`].
    pub fn usable(&self, cell: usize) -> Result<(&Array3<f64>, &Array3<bool>)> {
        match self.quality(cell)? {
            ReferenceQuality::Ok => Ok((&self.data[cell], &self.mask[cell])),
            ReferenceQuality::InsufficientData => Err(Error::InsufficientReference(cell)),
        }
    }

    /// Training weight accumulated in `cell`.
    pub fn weight(&self, cell: usize) -> Result<f64> {
        self.check_cell(cell)?;
        Ok(self.weight[cell])
    }

    /// Training weight accumulated in each voxel of `cell`.
    pub fn voxel_weight(&self, cell: usize) -> Result<&Array3<f64>> {
        self.check_cell(cell)?;
        Ok(&self.voxel_weight[cell])
    }

    /// Number of training profiles added to `cell`.
    pub fn count(&self, cell: usize) -> Result<usize> {
        self.check_cell(cell)?;
        Ok(self.count[cell])
    }

    /// Number of cells with [`ReferenceQuality::Ok`].
    #[must_use]
    pub fn num_usable(&self) -> usize {
        self.quality
            .iter()
            .filter(|&&q| q == ReferenceQuality::Ok)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const GRID: [usize; 3] = [3, 3, 3];

    fn blob(centre: (f64, f64, f64), scale: f64) -> Array3<f64> {
        Array3::from_shape_fn(GRID, |(k, j, i)| {
            #[allow(clippy::cast_precision_loss)]
            let d2 = (k as f64 - centre.0).powi(2)
                + (j as f64 - centre.1).powi(2)
                + (i as f64 - centre.2).powi(2);
            scale * (-d2).exp()
        })
    }

    fn training_set() -> Vec<(usize, f64, Array3<f64>)> {
        vec![
            (0, 1.0, blob((1.0, 1.0, 1.0), 100.0)),
            (0, 0.5, blob((1.2, 0.9, 1.0), 10.0)),
            (1, 0.25, blob((1.0, 1.0, 0.8), 3.0)),
            (0, 0.75, blob((0.9, 1.1, 1.1), 42.0)),
            (1, 1.0, blob((1.1, 1.0, 1.0), 7.0)),
        ]
    }

    #[test]
    fn test_add_and_finalize() {
        let mut acc = ReferenceAccumulator::new(3, GRID);
        acc.add(0, 1.0, &blob((1.0, 1.0, 1.0), 50.0).view()).unwrap();
        assert_eq!(acc.count(0), Ok(1));
        assert_abs_diff_eq!(acc.weight(0).unwrap(), 1.0);
        assert!(acc.weight(3).is_err());
        assert!(acc.count(3).is_err());

        let refs = acc.finalize(0.0, 0.02);
        assert_eq!(refs.quality(0).unwrap(), ReferenceQuality::Ok);
        assert_abs_diff_eq!(refs.profile(0).unwrap().sum(), 1.0, epsilon = 1e-12);
        assert_eq!(refs.quality(1).unwrap(), ReferenceQuality::InsufficientData);
        assert!(refs.profile(1).unwrap().iter().all(|&v| v == 0.0));
        assert_eq!(refs.usable(2), Err(Error::InsufficientReference(2)));
        assert_eq!(refs.num_usable(), 1);
        assert_eq!(refs.count(0), Ok(1));
        assert_eq!(
            refs.weight(5),
            Err(Error::IndexOutOfRange { index: 5, len: 3 })
        );
    }

    #[test]
    fn test_threshold_masks_low_voxels() {
        let mut acc = ReferenceAccumulator::new(1, GRID);
        acc.add(0, 1.0, &blob((1.0, 1.0, 1.0), 1.0).view()).unwrap();
        let refs = acc.finalize(0.0, 0.1);
        let mask = refs.mask(0).unwrap();
        // Corners sit at exp(-3) of the peak, below 10%.
        assert!(!mask[[0, 0, 0]]);
        assert!(mask[[1, 1, 1]]);
        assert!(mask[[1, 1, 0]]);
        assert_abs_diff_eq!(refs.profile(0).unwrap()[[0, 0, 0]], 0.0);
    }

    #[test]
    fn test_min_weight() {
        let mut acc = ReferenceAccumulator::new(1, GRID);
        acc.add(0, 0.5, &blob((1.0, 1.0, 1.0), 1.0).view()).unwrap();
        let refs = acc.finalize(1.0, 0.0);
        assert_eq!(refs.quality(0).unwrap(), ReferenceQuality::InsufficientData);
        assert!(refs.mask(0).unwrap().iter().all(|&m| !m));
    }

    #[test]
    fn test_accumulation_order_independent() {
        let set = training_set();

        let mut forward = ReferenceAccumulator::new(2, GRID);
        for (cell, w, p) in &set {
            forward.add(*cell, *w, &p.view()).unwrap();
        }

        let mut reverse = ReferenceAccumulator::new(2, GRID);
        for (cell, w, p) in set.iter().rev() {
            reverse.add(*cell, *w, &p.view()).unwrap();
        }

        let mut worker_a = ReferenceAccumulator::new(2, GRID);
        let mut worker_b = ReferenceAccumulator::new(2, GRID);
        for (n, (cell, w, p)) in set.iter().enumerate() {
            let worker = if n % 2 == 0 { &mut worker_a } else { &mut worker_b };
            worker.add(*cell, *w, &p.view()).unwrap();
        }
        worker_b.merge(&worker_a).unwrap();

        let a = forward.finalize(0.0, 0.02);
        let b = reverse.finalize(0.0, 0.02);
        let c = worker_b.finalize(0.0, 0.02);
        for cell in 0..2 {
            let pa = a.profile(cell).unwrap();
            for (other, name) in [(&b, "reverse"), (&c, "merged")] {
                let po = other.profile(cell).unwrap();
                for (x, y) in pa.iter().zip(po.iter()) {
                    assert!((x - y).abs() < 1e-12, "{name} differs in cell {cell}");
                }
                assert_eq!(a.mask(cell).unwrap(), other.mask(cell).unwrap());
            }
        }
    }

    #[test]
    fn test_invalid_inputs() {
        let mut acc = ReferenceAccumulator::new(1, GRID);
        let profile = blob((1.0, 1.0, 1.0), 1.0);
        assert!(acc.add(1, 1.0, &profile.view()).is_err());
        assert!(acc.add(0, -1.0, &profile.view()).is_err());
        assert_eq!(
            acc.add(0, 1.0, &Array3::zeros(GRID).view()),
            Err(Error::InsufficientReference(0))
        );
        assert!(acc
            .add(0, 1.0, &Array3::ones((3, 3, 2)).view())
            .is_err());
        assert!(acc.merge(&ReferenceAccumulator::new(2, GRID)).is_err());
    }

    #[test]
    fn test_voxel_weight_decides_usability() {
        let mut acc = ReferenceAccumulator::new(1, GRID);
        let full = blob((1.0, 1.0, 1.0), 1.0);
        // Second profile only reaches the first frame of the grid.
        let mut partial = blob((1.0, 1.0, 1.0), 1.0);
        partial.slice_mut(ndarray::s![1.., .., ..]).fill(0.0);
        acc.add(0, 0.6, &full.view()).unwrap();
        acc.add(0, 0.6, &partial.view()).unwrap();

        let voxel_weight = acc.voxel_weight(0).unwrap();
        assert_abs_diff_eq!(voxel_weight[[0, 1, 1]], 1.2);
        assert_abs_diff_eq!(voxel_weight[[2, 1, 1]], 0.6);
        assert_abs_diff_eq!(acc.weight(0).unwrap(), 1.2);

        // The cell as a whole passes, but only the twice-covered frame does.
        let refs = acc.finalize(1.0, 0.0);
        assert_eq!(refs.quality(0), Ok(ReferenceQuality::Ok));
        let mask = refs.mask(0).unwrap();
        assert!(mask.slice(ndarray::s![0, .., ..]).iter().all(|&m| m));
        assert!(mask.slice(ndarray::s![1.., .., ..]).iter().all(|&m| !m));
        let profile = refs.profile(0).unwrap();
        assert_abs_diff_eq!(profile.sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(profile[[1, 1, 1]], 0.0);
    }

    #[test]
    fn test_merge_adds_voxel_weights() {
        let mut a = ReferenceAccumulator::new(1, GRID);
        let mut b = ReferenceAccumulator::new(1, GRID);
        a.add(0, 0.5, &blob((1.0, 1.0, 1.0), 2.0).view()).unwrap();
        b.add(0, 0.25, &blob((1.0, 1.0, 1.0), 3.0).view()).unwrap();
        a.merge(&b).unwrap();
        assert!(a.voxel_weight(0).unwrap().iter().all(|&w| (w - 0.75).abs() < 1e-12));
        assert_eq!(a.count(0), Ok(2));
    }
}
