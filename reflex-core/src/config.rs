//! Profile modelling configuration.

use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How the detector and scan are divided into reference-profile cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GridMethod {
    /// One cell per block of frames, covering the whole detector.
    Single,
    /// 3×3 regular grid on the detector per block of frames.
    #[default]
    RegularGrid,
    /// Centre disc plus 8 angular sectors per block of frames.
    CircularGrid,
}

/// Parameters for reference profile modelling and profile fitting.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProfileConfig {
    /// Beam divergence (radians).
    pub sigma_b: f64,
    /// Mosaicity (radians).
    pub sigma_m: f64,
    /// Profile extent in standard deviations.
    pub n_sigma: f64,
    /// Half-width `g` of the profile grid; the grid is `(2g+1)^3`.
    pub grid_size: usize,
    /// Number of frame blocks the scan is divided into.
    pub num_scan_points: usize,
    pub grid_method: GridMethod,
    /// Fraction of the profile maximum below which voxels are unusable.
    pub threshold: f64,
    /// Cell weight a reference must exceed to be usable.
    pub min_weight: f64,
    /// Partiality a reflection must exceed to train references.
    pub min_partiality: f64,
    /// Convergence tolerance of the profile fit.
    pub fit_eps: f64,
    /// Iteration budget of the profile fit.
    pub fit_max_iter: usize,
    /// Treat an exhausted iteration budget as a failed fit.
    pub strict_convergence: bool,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            sigma_b: 0.02_f64.to_radians(),
            sigma_m: 0.04_f64.to_radians(),
            n_sigma: 3.0,
            grid_size: 5,
            num_scan_points: 1,
            grid_method: GridMethod::RegularGrid,
            threshold: 0.02,
            min_weight: 0.0,
            min_partiality: 0.99,
            fit_eps: 1e-3,
            fit_max_iter: 100,
            strict_convergence: true,
        }
    }
}

impl ProfileConfig {
    /// Default configuration with the given beam divergence and mosaicity.
    #[must_use]
    pub fn new(sigma_b: f64, sigma_m: f64) -> Self {
        Self {
            sigma_b,
            sigma_m,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_n_sigma(mut self, n_sigma: f64) -> Self {
        self.n_sigma = n_sigma;
        self
    }

    #[must_use]
    pub fn with_grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }

    #[must_use]
    pub fn with_num_scan_points(mut self, num_scan_points: usize) -> Self {
        self.num_scan_points = num_scan_points;
        self
    }

    #[must_use]
    pub fn with_grid_method(mut self, grid_method: GridMethod) -> Self {
        self.grid_method = grid_method;
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_min_weight(mut self, min_weight: f64) -> Self {
        self.min_weight = min_weight;
        self
    }

    #[must_use]
    pub fn with_min_partiality(mut self, min_partiality: f64) -> Self {
        self.min_partiality = min_partiality;
        self
    }

    /// Sets the fit tolerance and iteration budget.
    #[must_use]
    pub fn with_fit_limits(mut self, eps: f64, max_iter: usize) -> Self {
        self.fit_eps = eps;
        self.fit_max_iter = max_iter;
        self
    }

    #[must_use]
    pub fn with_strict_convergence(mut self, strict: bool) -> Self {
        self.strict_convergence = strict;
        self
    }

    /// Checks every parameter is in range.
    pub fn validate(&self) -> Result<()> {
        if !(self.sigma_b > 0.0 && self.sigma_m > 0.0 && self.n_sigma > 0.0) {
            return Err(Error::ConfigError(format!(
                "sigma_b, sigma_m and n_sigma must be positive (got {}, {}, {})",
                self.sigma_b, self.sigma_m, self.n_sigma
            )));
        }
        if self.num_scan_points == 0 {
            return Err(Error::ConfigError("num_scan_points must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(Error::ConfigError(format!(
                "threshold must be in [0, 1), got {}",
                self.threshold
            )));
        }
        if self.fit_eps <= 0.0 || self.fit_max_iter == 0 {
            return Err(Error::ConfigError(
                "fit tolerance and iteration budget must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Profile grid extent along each axis.
    #[must_use]
    pub fn grid_extent(&self) -> usize {
        2 * self.grid_size + 1
    }
}
