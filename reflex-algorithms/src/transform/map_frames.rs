//! Frame to profile-voxel fractions along `e3`.
//!
//! The reflecting range is modelled as a Gaussian in rotation angle with
//! width `sigma_m / |zeta|`. For each image frame the fraction of the
//! frame's share of that Gaussian falling inside each `e3` voxel is
//! computed once per reflection.
#![allow(clippy::cast_precision_loss)]

use ndarray::Array2;
use reflex_core::{Error, Result};
use statrs::function::erf::erf;
use std::f64::consts::SQRT_2;

/// Maps frames of a scan onto the `e3` axis of the profile grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapFramesForward {
    start_frame: i32,
    starting_angle: f64,
    oscillation: f64,
    sigma_m: f64,
    grid_half: usize,
    step: f64,
}

impl MapFramesForward {
    /// `starting_angle` is the rotation angle at the start of `start_frame`;
    /// `step` is the `e3` voxel size.
    pub fn new(
        start_frame: i32,
        starting_angle: f64,
        oscillation: f64,
        sigma_m: f64,
        grid_half: usize,
        step: f64,
    ) -> Result<Self> {
        if oscillation <= 0.0 || sigma_m <= 0.0 || step <= 0.0 {
            return Err(Error::ConfigError(format!(
                "oscillation ({oscillation}), sigma_m ({sigma_m}) and step ({step}) must be positive"
            )));
        }
        Ok(Self {
            start_frame,
            starting_angle,
            oscillation,
            sigma_m,
            grid_half,
            step,
        })
    }

    /// Number of voxels along `e3`.
    #[must_use]
    pub fn grid_extent(&self) -> usize {
        2 * self.grid_half + 1
    }

    /// Fractions for frames `[frames.0, frames.1)` of a reflection at
    /// rotation angle `phi`; shape `(frames, voxels)`.
    pub fn map(&self, frames: (i32, i32), phi: f64, zeta: f64) -> Result<Array2<f64>> {
        if frames.1 <= frames.0 {
            return Err(Error::degenerate(format!("empty frame range {frames:?}")));
        }
        if zeta == 0.0 {
            return Err(Error::degenerate("zeta is zero"));
        }

        let nframes = usize::try_from(frames.1 - frames.0)
            .map_err(|_| Error::degenerate("frame range overflow"))?;
        let nvoxels = self.grid_extent();
        let centre = self.grid_half as f64 + 0.5;
        let sigr2 = 1.0 / (SQRT_2 * self.sigma_m / zeta.abs());

        let mut fraction = Array2::zeros((nframes, nvoxels));
        for (row, frame) in (frames.0..frames.1).enumerate() {
            let aj = self.starting_angle
                + f64::from(frame - self.start_frame) * self.oscillation
                - phi;
            let bj = aj + self.oscillation;
            let gamma = erf(bj * sigr2) - erf(aj * sigr2);
            if gamma <= 0.0 {
                continue;
            }

            for v in 0..nvoxels {
                let mut av = (v as f64 - centre) * self.step / zeta;
                let mut bv = (v as f64 + 1.0 - centre) * self.step / zeta;
                if av > bv {
                    std::mem::swap(&mut av, &mut bv);
                }
                let lo = aj.max(av);
                let hi = bj.min(bv);
                if lo < hi {
                    fraction[[row, v]] = (erf(hi * sigr2) - erf(lo * sigr2)) / gamma;
                }
            }
        }
        Ok(fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn mapper() -> MapFramesForward {
        // Window of ±3σ over 5 voxels.
        let sigma_m = 0.01;
        MapFramesForward::new(0, 0.0, 0.002, sigma_m, 2, sigma_m * 3.0 / 2.5).unwrap()
    }

    #[test]
    fn test_frames_inside_window_sum_to_one() {
        let map = mapper();
        let phi = 0.101;
        let fractions = map.map((45, 56), phi, 0.8).unwrap();
        assert_eq!(fractions.dim(), (11, 5));
        for row in fractions.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
            assert!(row.iter().all(|&f| f >= 0.0));
        }
    }

    #[test]
    fn test_distant_frames_contribute_nothing() {
        let map = mapper();
        let fractions = map.map((0, 2), 1.0, 0.8).unwrap();
        assert!(fractions.iter().all(|&f| f == 0.0));
    }

    #[test]
    fn test_zeta_sign_mirrors_voxels() {
        let map = mapper();
        let pos = map.map((49, 52), 0.1013, 0.6).unwrap();
        let neg = map.map((49, 52), 0.1013, -0.6).unwrap();
        for r in 0..3 {
            for v in 0..5 {
                assert_abs_diff_eq!(pos[[r, v]], neg[[r, 4 - v]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_degenerate_inputs() {
        let map = mapper();
        assert!(map.map((3, 3), 0.0, 0.5).is_err());
        assert!(map.map((0, 3), 0.0, 0.0).is_err());
        assert!(MapFramesForward::new(0, 0.0, 0.0, 0.01, 2, 0.01).is_err());
    }
}
