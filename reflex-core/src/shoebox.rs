//! Shoebox pixel windows and their bounding boxes.
//!
//! A shoebox holds the `(z, y, x)` cuboid of pixels around one
//! reflection: observed counts, a per-pixel mask and the fitted
//! background. All three arrays share the bounding box extents.

use crate::error::{Error, Result};
use crate::mask::MaskCode;
use ndarray::{Array3, NdFloat, Zip};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Floating-point pixel storage.
///
/// Implemented for `f32` (the usual storage type) and `f64`. Numerical
/// work is carried out in `f64`.
pub trait Pixel: NdFloat + Default {
    /// Widens the value to `f64`.
    fn widen(self) -> f64;
    /// Narrows an `f64` back to the storage type.
    fn narrow(value: f64) -> Self;
}

impl Pixel for f32 {
    #[inline]
    fn widen(self) -> f64 {
        f64::from(self)
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn narrow(value: f64) -> Self {
        value as f32
    }
}

impl Pixel for f64 {
    #[inline]
    fn widen(self) -> f64 {
        self
    }

    #[inline]
    fn narrow(value: f64) -> Self {
        value
    }
}

/// Half-open pixel/frame box `[x0, x1) × [y0, y1) × [z0, z1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoundingBox {
    pub x0: i32,
    pub x1: i32,
    pub y0: i32,
    pub y1: i32,
    pub z0: i32,
    pub z1: i32,
}

impl BoundingBox {
    /// Creates a bounding box, rejecting empty or inverted extents.
    pub fn new(x0: i32, x1: i32, y0: i32, y1: i32, z0: i32, z1: i32) -> Result<Self> {
        let bbox = Self {
            x0,
            x1,
            y0,
            y1,
            z0,
            z1,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    /// Creates a bounding box from `[x0, x1, y0, y1, z0, z1]`.
    pub fn from_array(values: [i32; 6]) -> Result<Self> {
        Self::new(values[0], values[1], values[2], values[3], values[4], values[5])
    }

    /// Returns `[x0, x1, y0, y1, z0, z1]`.
    #[must_use]
    pub fn to_array(&self) -> [i32; 6] {
        [self.x0, self.x1, self.y0, self.y1, self.z0, self.z1]
    }

    /// Returns true when all three extents are positive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.x1 > self.x0 && self.y1 > self.y0 && self.z1 > self.z0
    }

    /// Fails with [`Error::InvalidBoundingBox`] unless [`Self::is_valid`].
    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidBoundingBox {
                x0: self.x0,
                x1: self.x1,
                y0: self.y0,
                y1: self.y1,
                z0: self.z0,
                z1: self.z1,
            })
        }
    }

    /// Array shape `[z, y, x]`; zero along any inverted axis.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn shape(&self) -> [usize; 3] {
        [
            (self.z1 - self.z0).max(0) as usize,
            (self.y1 - self.y0).max(0) as usize,
            (self.x1 - self.x0).max(0) as usize,
        ]
    }

    /// Number of pixels enclosed.
    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.shape().iter().product()
    }

    /// Lower bound on `axis` (0 = x, 1 = y, 2 = z).
    #[must_use]
    pub fn lower(&self, axis: usize) -> i32 {
        match axis {
            0 => self.x0,
            1 => self.y0,
            _ => self.z0,
        }
    }

    /// Upper (exclusive) bound on `axis` (0 = x, 1 = y, 2 = z).
    #[must_use]
    pub fn upper(&self, axis: usize) -> i32 {
        match axis {
            0 => self.x1,
            1 => self.y1,
            _ => self.z1,
        }
    }

    /// True when the half-open ranges overlap on every axis.
    #[must_use]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        (0..3).all(|axis| {
            self.lower(axis) < other.upper(axis) && other.lower(axis) < self.upper(axis)
        })
    }

    /// Common region of two boxes, if any.
    #[must_use]
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let bbox = BoundingBox {
            x0: self.x0.max(other.x0),
            x1: self.x1.min(other.x1),
            y0: self.y0.max(other.y0),
            y1: self.y1.min(other.y1),
            z0: self.z0.max(other.z0),
            z1: self.z1.min(other.z1),
        };
        bbox.is_valid().then_some(bbox)
    }

    /// True when the box lies inside an image of `(width, height)` pixels
    /// and the frame range `[scan_range.0, scan_range.1)`.
    #[must_use]
    pub fn is_within_image_volume(&self, image_size: (usize, usize), scan_range: (i32, i32)) -> bool {
        let (width, height) = image_size;
        self.x0 >= 0
            && self.y0 >= 0
            && usize::try_from(self.x1).is_ok_and(|x1| x1 <= width)
            && usize::try_from(self.y1).is_ok_and(|y1| y1 <= height)
            && self.z0 >= scan_range.0
            && self.z1 <= scan_range.1
    }
}

/// Pixel window around one reflection.
#[derive(Debug, Clone, PartialEq)]
pub struct Shoebox<T = f32> {
    /// Detector panel the box lives on.
    pub panel: usize,
    /// Extent in detector pixels and scan frames.
    pub bbox: BoundingBox,
    /// Observed counts, shape `[z, y, x]`.
    pub data: Array3<T>,
    /// Per-pixel mask codes.
    pub mask: Array3<MaskCode>,
    /// Fitted background surface.
    pub background: Array3<T>,
}

impl<T: Pixel> Shoebox<T> {
    /// Allocates zeroed arrays and an empty mask for `bbox`.
    pub fn new(panel: usize, bbox: BoundingBox) -> Result<Self> {
        bbox.validate()?;
        let shape = bbox.shape();
        Ok(Self {
            panel,
            bbox,
            data: Array3::zeros(shape),
            mask: Array3::from_elem(shape, MaskCode::empty()),
            background: Array3::zeros(shape),
        })
    }

    /// Builds a shoebox from existing arrays, checking their extents.
    pub fn from_parts(
        panel: usize,
        bbox: BoundingBox,
        data: Array3<T>,
        mask: Array3<MaskCode>,
        background: Array3<T>,
    ) -> Result<Self> {
        let sbox = Self {
            panel,
            bbox,
            data,
            mask,
            background,
        };
        sbox.check_consistent()?;
        Ok(sbox)
    }

    /// Array shape `[z, y, x]`.
    #[must_use]
    pub fn shape(&self) -> [usize; 3] {
        self.bbox.shape()
    }

    /// True when the bounding box is valid and all arrays match it.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.check_consistent().is_ok()
    }

    /// Fails unless the bounding box is valid and all arrays match it.
    pub fn check_consistent(&self) -> Result<()> {
        self.bbox.validate()?;
        let expected = self.bbox.shape();
        for (z, y, x) in [self.data.dim(), self.mask.dim(), self.background.dim()] {
            if [z, y, x] != expected {
                return Err(Error::ShapeMismatch {
                    expected,
                    found: [z, y, x],
                });
            }
        }
        Ok(())
    }

    /// Number of pixels carrying every bit of `code`.
    #[must_use]
    pub fn count_mask_values(&self, code: MaskCode) -> usize {
        self.mask.iter().filter(|m| m.has(code)).count()
    }

    /// Boolean view of the pixels carrying every bit of `code`.
    #[must_use]
    pub fn mask_matching(&self, code: MaskCode) -> Array3<bool> {
        self.mask.mapv(|m| m.has(code))
    }

    /// True when some foreground pixel is not valid.
    #[must_use]
    pub fn has_invalid_foreground(&self) -> bool {
        self.mask
            .iter()
            .any(|m| m.has(MaskCode::FOREGROUND) && !m.has(MaskCode::VALID))
    }

    /// See [`BoundingBox::is_within_image_volume`].
    #[must_use]
    pub fn is_bbox_within_image_volume(
        &self,
        image_size: (usize, usize),
        scan_range: (i32, i32),
    ) -> bool {
        self.bbox.is_within_image_volume(image_size, scan_range)
    }

    /// `data - background` in `f64`.
    #[must_use]
    pub fn data_minus_background(&self) -> Array3<f64> {
        let mut out = Array3::zeros(self.data.raw_dim());
        Zip::from(&mut out)
            .and(&self.data)
            .and(&self.background)
            .for_each(|o, &d, &b| *o = d.widen() - b.widen());
        out
    }

    /// Mean background level under the signal pixels.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_background(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        Zip::from(&self.background)
            .and(&self.mask)
            .for_each(|&b, &m| {
                if m.has(MaskCode::SIGNAL) {
                    sum += b.widen();
                    count += 1;
                }
            });
        (count > 0).then(|| sum / count as f64)
    }

    /// Sets every pixel's mask to `code`.
    pub fn fill_mask(&mut self, code: MaskCode) {
        self.mask.fill(code);
    }
}
