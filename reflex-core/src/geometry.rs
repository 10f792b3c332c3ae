//! Read-only experimental geometry.
//!
//! Lengths are in millimetres, angles in radians and reciprocal vectors in
//! inverse ångström. Detector pixel coordinates are `(x, y)` = `(fast, slow)`.

use crate::error::{Error, Result};
use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Incident beam.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Beam {
    /// Incident beam vector, length `1 / wavelength`.
    pub s0: Vector3<f64>,
}

impl Beam {
    /// Creates a beam from its wave vector.
    pub fn new(s0: Vector3<f64>) -> Result<Self> {
        if s0.norm() <= 0.0 {
            return Err(Error::degenerate("zero length beam vector"));
        }
        Ok(Self { s0 })
    }

    /// Beam along `-z` with the given wavelength.
    pub fn from_wavelength(wavelength: f64) -> Result<Self> {
        if wavelength <= 0.0 {
            return Err(Error::ConfigError(format!(
                "wavelength must be positive, got {wavelength}"
            )));
        }
        Self::new(Vector3::new(0.0, 0.0, -1.0 / wavelength))
    }

    #[must_use]
    pub fn wavelength(&self) -> f64 {
        1.0 / self.s0.norm()
    }
}

/// One flat detector module.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Panel {
    /// Lab position of the corner of pixel `(0, 0)`.
    pub origin: Vector3<f64>,
    /// Unit vector along increasing `x`.
    pub fast_axis: Vector3<f64>,
    /// Unit vector along increasing `y`.
    pub slow_axis: Vector3<f64>,
    /// Pixel pitch `(fast, slow)` in mm.
    pub pixel_size: (f64, f64),
    /// Image size `(width, height)` in pixels.
    pub image_size: (usize, usize),
}

impl Panel {
    /// Lab coordinate (mm) of the fractional pixel position `(x, y)`.
    #[must_use]
    pub fn pixel_to_lab(&self, x: f64, y: f64) -> Vector3<f64> {
        self.origin + self.fast_axis * (x * self.pixel_size.0) + self.slow_axis * (y * self.pixel_size.1)
    }

    /// Fractional pixel position where the ray along `s` meets the panel.
    pub fn ray_intersection_px(&self, s: &Vector3<f64>) -> Result<(f64, f64)> {
        let d = Matrix3::from_columns(&[self.fast_axis, self.slow_axis, self.origin]);
        let inv = d
            .try_inverse()
            .ok_or_else(|| Error::degenerate("panel frame is singular"))?;
        let v = inv * s;
        if v.z <= 0.0 {
            return Err(Error::degenerate("ray does not intersect panel"));
        }
        Ok((
            v.x / v.z / self.pixel_size.0,
            v.y / v.z / self.pixel_size.1,
        ))
    }

    /// Width and height in pixels.
    #[must_use]
    pub fn image_size(&self) -> (usize, usize) {
        self.image_size
    }
}

/// Collection of panels.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Detector {
    pub panels: Vec<Panel>,
}

impl Detector {
    #[must_use]
    pub fn new(panels: Vec<Panel>) -> Self {
        Self { panels }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.panels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }

    /// Returns panel `index` or [`Error::IndexOutOfRange`].
    pub fn panel(&self, index: usize) -> Result<&Panel> {
        self.panels.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.panels.len(),
        })
    }
}

/// Single-axis goniometer.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Goniometer {
    /// Unit rotation axis `m2`.
    pub rotation_axis: Vector3<f64>,
}

impl Goniometer {
    /// Creates a goniometer; the axis is normalised.
    pub fn new(rotation_axis: Vector3<f64>) -> Result<Self> {
        let rotation_axis = rotation_axis
            .try_normalize(f64::EPSILON)
            .ok_or_else(|| Error::degenerate("zero length rotation axis"))?;
        Ok(Self { rotation_axis })
    }
}

/// Rotation scan.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Scan {
    /// Half-open frame range `[first, last)`.
    pub array_range: (i32, i32),
    /// Rotation angle at the start of the first frame and width per frame.
    pub oscillation: (f64, f64),
}

impl Scan {
    pub fn new(array_range: (i32, i32), oscillation: (f64, f64)) -> Result<Self> {
        if array_range.1 <= array_range.0 {
            return Err(Error::ConfigError(format!(
                "empty scan range {array_range:?}"
            )));
        }
        if oscillation.1 <= 0.0 {
            return Err(Error::ConfigError(format!(
                "oscillation width must be positive, got {}",
                oscillation.1
            )));
        }
        Ok(Self {
            array_range,
            oscillation,
        })
    }

    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn num_images(&self) -> usize {
        (self.array_range.1 - self.array_range.0) as usize
    }

    /// Rotation angle at the fractional frame position `z`.
    #[must_use]
    pub fn angle_from_array_index(&self, z: f64) -> f64 {
        self.oscillation.0 + (z - f64::from(self.array_range.0)) * self.oscillation.1
    }

    /// Fractional frame position of rotation angle `phi`.
    #[must_use]
    pub fn array_index_from_angle(&self, phi: f64) -> f64 {
        f64::from(self.array_range.0) + (phi - self.oscillation.0) / self.oscillation.1
    }
}

/// Models describing one sweep.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Experiment {
    pub beam: Beam,
    pub detector: Detector,
    pub goniometer: Goniometer,
    pub scan: Scan,
}

impl Experiment {
    pub fn new(beam: Beam, detector: Detector, goniometer: Goniometer, scan: Scan) -> Result<Self> {
        if detector.is_empty() {
            return Err(Error::ConfigError("detector has no panels".into()));
        }
        Ok(Self {
            beam,
            detector,
            goniometer,
            scan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn panel() -> Panel {
        Panel {
            origin: Vector3::new(-20.0, 20.0, -100.0),
            fast_axis: Vector3::new(1.0, 0.0, 0.0),
            slow_axis: Vector3::new(0.0, -1.0, 0.0),
            pixel_size: (0.2, 0.2),
            image_size: (200, 200),
        }
    }

    #[test]
    fn test_pixel_to_lab() {
        let p = panel();
        let lab = p.pixel_to_lab(10.0, 5.0);
        assert_abs_diff_eq!(lab, Vector3::new(-18.0, 19.0, -100.0), epsilon = 1e-12);
    }

    #[test]
    fn test_ray_intersection_inverts_pixel_to_lab() {
        let p = panel();
        let lab = p.pixel_to_lab(42.25, 117.5);
        let (x, y) = p.ray_intersection_px(&(lab.normalize() * 3.0)).unwrap();
        assert_abs_diff_eq!(x, 42.25, epsilon = 1e-9);
        assert_abs_diff_eq!(y, 117.5, epsilon = 1e-9);

        assert!(p.ray_intersection_px(&(-lab)).is_err());
    }

    #[test]
    fn test_scan_angles() {
        let scan = Scan::new((1, 91), (0.0, 0.01)).unwrap();
        assert_eq!(scan.num_images(), 90);
        assert_abs_diff_eq!(scan.angle_from_array_index(11.0), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(scan.array_index_from_angle(0.1), 11.0, epsilon = 1e-9);
        assert!(Scan::new((5, 5), (0.0, 0.01)).is_err());
    }

    #[test]
    fn test_beam_and_goniometer() {
        let beam = Beam::from_wavelength(0.5).unwrap();
        assert_abs_diff_eq!(beam.wavelength(), 0.5, epsilon = 1e-12);
        assert!(Beam::new(Vector3::zeros()).is_err());

        let gonio = Goniometer::new(Vector3::new(2.0, 0.0, 0.0)).unwrap();
        assert_abs_diff_eq!(gonio.rotation_axis.norm(), 1.0, epsilon = 1e-12);
    }
}
