//! Local reciprocal-space coordinate system of a reflection.
//!
//! The basis is built from the rotation axis `m2`, the incident beam `s0`
//! and the diffracted beam `s1`:
//!
//! - `e1 = s1 × s0 / |s1 × s0|`, perpendicular to the scattering plane
//! - `e2 = s1 × e1 / |s1 × e1|`, in the scattering plane
//! - `e3 = (s1 + s0) / |s1 + s0|`, along the rotation direction of `p*`
//!
//! `zeta = m2 · e1` scales angular spread about the rotation axis into
//! spread along `e3`.

use nalgebra::Vector3;
use reflex_core::{Error, Result};

/// Relative tolerance on `|s1| == |s0|`.
const ELASTIC_TOLERANCE: f64 = 1e-6;

/// Per-reflection local basis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateSystem {
    m2: Vector3<f64>,
    s0: Vector3<f64>,
    s1: Vector3<f64>,
    phi: f64,
    p_star: Vector3<f64>,
    e1: Vector3<f64>,
    e2: Vector3<f64>,
    e3: Vector3<f64>,
    zeta: f64,
}

impl CoordinateSystem {
    /// Builds the basis for a reflection diffracting along `s1` at rotation
    /// angle `phi`.
    pub fn new(m2: Vector3<f64>, s0: Vector3<f64>, s1: Vector3<f64>, phi: f64) -> Result<Self> {
        let (n0, n1) = (s0.norm(), s1.norm());
        if n0 <= 0.0 || n1 <= 0.0 {
            return Err(Error::degenerate("zero length beam vector"));
        }
        if (n1 - n0).abs() > ELASTIC_TOLERANCE * n0 {
            return Err(Error::degenerate(format!(
                "|s1| = {n1} differs from |s0| = {n0}"
            )));
        }
        let e1 = s1
            .cross(&s0)
            .try_normalize(f64::EPSILON * n0 * n1)
            .ok_or_else(|| Error::degenerate("s1 is parallel to s0"))?;
        let e2 = s1
            .cross(&e1)
            .try_normalize(f64::EPSILON * n1)
            .ok_or_else(|| Error::degenerate("s1 is parallel to e1"))?;
        let e3 = (s1 + s0)
            .try_normalize(f64::EPSILON * n0)
            .ok_or_else(|| Error::degenerate("s1 is antiparallel to s0"))?;

        Ok(Self {
            m2,
            s0,
            s1,
            phi,
            p_star: s1 - s0,
            e1,
            e2,
            e3,
            zeta: m2.dot(&e1),
        })
    }

    /// Rotation axis.
    #[must_use]
    pub fn m2(&self) -> Vector3<f64> {
        self.m2
    }

    /// Incident beam vector.
    #[must_use]
    pub fn s0(&self) -> Vector3<f64> {
        self.s0
    }

    /// Diffracted beam vector.
    #[must_use]
    pub fn s1(&self) -> Vector3<f64> {
        self.s1
    }

    /// Rotation angle of the reflection.
    #[must_use]
    pub fn phi(&self) -> f64 {
        self.phi
    }

    /// Reciprocal lattice vector `s1 - s0`.
    #[must_use]
    pub fn p_star(&self) -> Vector3<f64> {
        self.p_star
    }

    /// Axis normal to the scattering plane.
    #[must_use]
    pub fn e1(&self) -> Vector3<f64> {
        self.e1
    }

    /// In-plane axis normal to `s1`.
    #[must_use]
    pub fn e2(&self) -> Vector3<f64> {
        self.e2
    }

    /// Axis along `s1 + s0`.
    #[must_use]
    pub fn e3(&self) -> Vector3<f64> {
        self.e3
    }

    /// `m2 · e1`.
    #[must_use]
    pub fn zeta(&self) -> f64 {
        self.zeta
    }

    /// Inverse Lorentz factor `|m2 · (s1 × s0)| / (|s1| |s0|)`.
    #[must_use]
    pub fn lorentz_inv(&self) -> f64 {
        self.m2.dot(&self.s1.cross(&self.s0)).abs() / (self.s1.norm() * self.s0.norm())
    }

    /// Extra path through the Ewald sphere per unit mosaic spread, `1/|zeta|`.
    pub fn path_length_increase(&self) -> Result<f64> {
        if self.zeta == 0.0 {
            return Err(Error::degenerate("zeta is zero"));
        }
        Ok(1.0 / self.zeta.abs())
    }

    /// `(c1, c2)` coordinates of another diffracted beam direction.
    #[must_use]
    pub fn from_beam_vector(&self, s_dash: &Vector3<f64>) -> (f64, f64) {
        let n1 = self.s1.norm();
        let scaled = s_dash.normalize() * n1 - self.s1;
        (self.e1.dot(&scaled) / n1, self.e2.dot(&scaled) / n1)
    }

    /// `c3` coordinate of rotation angle `phi_dash`, first order in the
    /// angular offset.
    #[must_use]
    pub fn from_rotation_angle(&self, phi_dash: f64) -> f64 {
        self.zeta * (phi_dash - self.phi)
    }

    /// Rotation angle whose `c3` coordinate is `c3`.
    pub fn to_rotation_angle(&self, c3: f64) -> Result<f64> {
        if self.zeta == 0.0 {
            return Err(Error::degenerate("zeta is zero"));
        }
        Ok(self.phi + c3 / self.zeta)
    }
}

/// `zeta = m2 · (s1 × s0) / |s1 × s0|` without building the full basis.
pub fn zeta_factor(m2: &Vector3<f64>, s0: &Vector3<f64>, s1: &Vector3<f64>) -> Result<f64> {
    let e1 = s1
        .cross(s0)
        .try_normalize(f64::EPSILON)
        .ok_or_else(|| Error::degenerate("s1 is parallel to s0"))?;
    Ok(m2.dot(&e1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn geometry() -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
        let m2 = Vector3::new(1.0, 0.0, 0.0);
        let s0 = Vector3::new(0.0, 0.0, -1.0);
        let s1 = Vector3::new(0.1, 0.3, -1.0).normalize();
        (m2, s0, s1)
    }

    #[test]
    fn test_basis_is_orthonormal() {
        let (m2, s0, s1) = geometry();
        let cs = CoordinateSystem::new(m2, s0, s1, 0.5).unwrap();

        assert_abs_diff_eq!(cs.e1().norm(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cs.e2().norm(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cs.e3().norm(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cs.e1().dot(&cs.e2()), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cs.e1().dot(&s1), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cs.e2().dot(&s1), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cs.p_star(), s1 - s0, epsilon = 1e-12);
        assert_relative_eq!(cs.zeta(), m2.dot(&cs.e1()));
        assert_relative_eq!(cs.zeta(), zeta_factor(&m2, &s0, &s1).unwrap());
    }

    #[test]
    fn test_beam_vector_coordinates() {
        let (m2, s0, s1) = geometry();
        let cs = CoordinateSystem::new(m2, s0, s1, 0.0).unwrap();
        let (c1, c2) = cs.from_beam_vector(&s1);
        assert_abs_diff_eq!(c1, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c2, 0.0, epsilon = 1e-12);

        let tilted = s1 + cs.e1() * 1e-3;
        let (c1, c2) = cs.from_beam_vector(&tilted);
        assert_relative_eq!(c1, 1e-3, max_relative = 1e-3);
        assert!(c2.abs() < 1e-5);
    }

    #[test]
    fn test_rotation_angle_round_trip() {
        let (m2, s0, s1) = geometry();
        let cs = CoordinateSystem::new(m2, s0, s1, 0.25).unwrap();
        let c3 = cs.from_rotation_angle(0.26);
        assert_relative_eq!(cs.to_rotation_angle(c3).unwrap(), 0.26, max_relative = 1e-12);
        assert!(cs.lorentz_inv() > 0.0);
        assert_relative_eq!(cs.path_length_increase().unwrap(), 1.0 / cs.zeta().abs());
    }

    #[test]
    fn test_degenerate_geometry() {
        let (m2, s0, _) = geometry();
        assert!(CoordinateSystem::new(m2, s0, s0, 0.0).is_err());
        assert!(CoordinateSystem::new(m2, s0, Vector3::new(0.0, 0.5, -0.5), 0.0).is_err());
        assert!(CoordinateSystem::new(m2, Vector3::zeros(), s0, 0.0).is_err());
    }

    #[test]
    fn test_zero_zeta() {
        let m2 = Vector3::new(0.0, 1.0, 0.0);
        let s0 = Vector3::new(0.0, 0.0, -1.0);
        let s1 = Vector3::new(0.0, 0.3, -1.0).normalize();
        let cs = CoordinateSystem::new(m2, s0, s1, 0.0).unwrap();
        assert_abs_diff_eq!(cs.zeta(), 0.0, epsilon = 1e-12);
    }
}
