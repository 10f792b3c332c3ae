//! Structure of Arrays (`SoA`) reflection table.
//!
//! `ReflectionTable` stores one row per reflection in parallel column
//! vectors. Algorithms read the geometry and flag columns and write the
//! result columns in place; they never add, remove or reorder rows.

use crate::error::{Error, Result};
use crate::intensity::{Intensity, FAILED_VARIANCE};
use crate::shoebox::{BoundingBox, Pixel, Shoebox};
use bitflags::bitflags;
use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

bitflags! {
    /// Per-reflection status bits.
    ///
    /// Stages set their own bit; flags are orthogonal so one reflection can
    /// be both a modelling reference and a fitted reflection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct ReflectionFlags: u64 {
        const PREDICTED = 1 << 0;
        const OBSERVED = 1 << 1;
        const INDEXED = 1 << 2;
        const USED_IN_REFINEMENT = 1 << 3;
        const STRONG = 1 << 5;
        const REFERENCE_SPOT = 1 << 6;
        /// Excluded from integration.
        const DONT_INTEGRATE = 1 << 7;
        /// Summation integration succeeded.
        const INTEGRATED_SUM = 1 << 8;
        /// Profile fitting succeeded.
        const INTEGRATED_PRF = 1 << 9;
        const OVERLOADED = 1 << 10;
        /// Background pixels were claimed by a neighbour.
        const OVERLAPPED_BG = 1 << 11;
        /// Foreground pixels were claimed by a neighbour.
        const OVERLAPPED_FG = 1 << 12;
        const IN_POWDER_RING = 1 << 13;
        /// Contributed to a reference profile.
        const USED_IN_MODELLING = 1 << 14;
        const BACKGROUND_FITTED = 1 << 15;
        const OVERLAP_CHECKED = 1 << 16;
        /// Mapped into the reciprocal-space profile grid.
        const TRANSFORMED = 1 << 17;
    }
}

/// Inputs describing one reflection.
#[derive(Debug, Clone)]
pub struct Reflection<T = f32> {
    /// Experiment the reflection belongs to.
    pub id: usize,
    pub shoebox: Shoebox<T>,
    pub flags: ReflectionFlags,
    /// Predicted diffracted beam vector.
    pub s1: Vector3<f64>,
    /// Predicted position `(x mm, y mm, phi rad)`.
    pub xyzcal_mm: Vector3<f64>,
    /// Predicted position `(x px, y px, frame)`.
    pub xyzcal_px: Vector3<f64>,
    pub partiality: f64,
}

impl<T> Reflection<T> {
    /// Creates a fully recorded, predicted reflection in experiment 0.
    pub fn new(
        shoebox: Shoebox<T>,
        s1: Vector3<f64>,
        xyzcal_mm: Vector3<f64>,
        xyzcal_px: Vector3<f64>,
    ) -> Self {
        Self {
            id: 0,
            shoebox,
            flags: ReflectionFlags::PREDICTED,
            s1,
            xyzcal_mm,
            xyzcal_px,
            partiality: 1.0,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ReflectionFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_partiality(mut self, partiality: f64) -> Self {
        self.partiality = partiality;
        self
    }
}

/// A table of reflections stored in Structure of Arrays (`SoA`) format.
#[derive(Debug, Clone, Default)]
pub struct ReflectionTable<T = f32> {
    /// Experiment index.
    pub id: Vec<usize>,
    /// Pixel windows; also carry `panel` and `bbox`.
    pub shoebox: Vec<Shoebox<T>>,
    pub flags: Vec<ReflectionFlags>,
    pub s1: Vec<Vector3<f64>>,
    pub xyzcal_mm: Vec<Vector3<f64>>,
    pub xyzcal_px: Vec<Vector3<f64>>,
    pub partiality: Vec<f64>,
    /// Mean squared error of the background fit.
    pub background_mse: Vec<f64>,
    /// Mean background under the peak.
    pub background_mean: Vec<f64>,
    pub intensity_sum_value: Vec<f64>,
    pub intensity_sum_variance: Vec<f64>,
    pub intensity_prf_value: Vec<f64>,
    pub intensity_prf_variance: Vec<f64>,
    /// Pearson correlation between reference and observed profile.
    pub profile_correlation: Vec<f64>,
}

impl<T: Pixel> ReflectionTable<T> {
    /// Creates a new empty table with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: Vec::with_capacity(capacity),
            shoebox: Vec::with_capacity(capacity),
            flags: Vec::with_capacity(capacity),
            s1: Vec::with_capacity(capacity),
            xyzcal_mm: Vec::with_capacity(capacity),
            xyzcal_px: Vec::with_capacity(capacity),
            partiality: Vec::with_capacity(capacity),
            background_mse: Vec::with_capacity(capacity),
            background_mean: Vec::with_capacity(capacity),
            intensity_sum_value: Vec::with_capacity(capacity),
            intensity_sum_variance: Vec::with_capacity(capacity),
            intensity_prf_value: Vec::with_capacity(capacity),
            intensity_prf_variance: Vec::with_capacity(capacity),
            profile_correlation: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of reflections in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shoebox.len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shoebox.is_empty()
    }

    /// Pushes a reflection; result columns start at their failure sentinels.
    pub fn push(&mut self, reflection: Reflection<T>) {
        self.id.push(reflection.id);
        self.shoebox.push(reflection.shoebox);
        self.flags.push(reflection.flags);
        self.s1.push(reflection.s1);
        self.xyzcal_mm.push(reflection.xyzcal_mm);
        self.xyzcal_px.push(reflection.xyzcal_px);
        self.partiality.push(reflection.partiality);
        self.background_mse.push(0.0);
        self.background_mean.push(0.0);
        self.intensity_sum_value.push(0.0);
        self.intensity_sum_variance.push(FAILED_VARIANCE);
        self.intensity_prf_value.push(0.0);
        self.intensity_prf_variance.push(FAILED_VARIANCE);
        self.profile_correlation.push(0.0);
    }

    /// True when every column has the same length.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let n = self.len();
        [
            self.id.len(),
            self.flags.len(),
            self.s1.len(),
            self.xyzcal_mm.len(),
            self.xyzcal_px.len(),
            self.partiality.len(),
            self.background_mse.len(),
            self.background_mean.len(),
            self.intensity_sum_value.len(),
            self.intensity_sum_variance.len(),
            self.intensity_prf_value.len(),
            self.intensity_prf_variance.len(),
            self.profile_correlation.len(),
        ]
        .iter()
        .all(|&len| len == n)
    }

    /// Fails with a configuration error unless [`Self::is_consistent`].
    pub fn check_consistent(&self) -> Result<()> {
        if self.is_consistent() {
            Ok(())
        } else {
            Err(Error::ConfigError(
                "reflection table columns differ in length".into(),
            ))
        }
    }

    fn shoebox_at(&self, index: usize) -> Result<&Shoebox<T>> {
        self.shoebox.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.shoebox.len(),
        })
    }

    fn column<V: Copy>(column: &[V], index: usize) -> Result<V> {
        column.get(index).copied().ok_or(Error::IndexOutOfRange {
            index,
            len: column.len(),
        })
    }

    /// Panel index of row `index`.
    pub fn panel(&self, index: usize) -> Result<usize> {
        Ok(self.shoebox_at(index)?.panel)
    }

    /// Bounding box of row `index`.
    pub fn bbox(&self, index: usize) -> Result<BoundingBox> {
        Ok(self.shoebox_at(index)?.bbox)
    }

    /// All bounding boxes in row order.
    #[must_use]
    pub fn bboxes(&self) -> Vec<BoundingBox> {
        self.shoebox.iter().map(|s| s.bbox).collect()
    }

    /// All panel indices in row order.
    #[must_use]
    pub fn panels(&self) -> Vec<usize> {
        self.shoebox.iter().map(|s| s.panel).collect()
    }

    /// Rows carrying every bit of `flags`.
    #[must_use]
    pub fn select(&self, flags: ReflectionFlags) -> Vec<usize> {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.contains(flags).then_some(i))
            .collect()
    }

    /// Number of rows carrying every bit of `flags`.
    #[must_use]
    pub fn count_flags(&self, flags: ReflectionFlags) -> usize {
        self.flags.iter().filter(|f| f.contains(flags)).count()
    }

    /// Summation result of row `index`.
    pub fn intensity_sum(&self, index: usize) -> Result<Intensity> {
        Ok(Intensity::new(
            Self::column(&self.intensity_sum_value, index)?,
            Self::column(&self.intensity_sum_variance, index)?,
        ))
    }

    /// Profile fitting result of row `index`.
    pub fn intensity_prf(&self, index: usize) -> Result<Intensity> {
        Ok(Intensity::new(
            Self::column(&self.intensity_prf_value, index)?,
            Self::column(&self.intensity_prf_variance, index)?,
        ))
    }
}
