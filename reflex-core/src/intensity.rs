//! Intensity estimates.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Variance written for reflections that could not be integrated.
pub const FAILED_VARIANCE: f64 = -1.0;

/// An intensity estimate and its variance.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Intensity {
    pub value: f64,
    pub variance: f64,
}

impl Default for Intensity {
    fn default() -> Self {
        Self::failed()
    }
}

impl Intensity {
    #[must_use]
    pub fn new(value: f64, variance: f64) -> Self {
        Self { value, variance }
    }

    /// The sentinel recorded for a failed integration.
    #[must_use]
    pub fn failed() -> Self {
        Self {
            value: 0.0,
            variance: FAILED_VARIANCE,
        }
    }

    /// True unless this is the failure sentinel.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.variance >= 0.0
    }

    /// Signal to noise ratio, or `None` when the variance is not positive.
    #[must_use]
    pub fn i_over_sigma(&self) -> Option<f64> {
        (self.variance > 0.0).then(|| self.value / self.variance.sqrt())
    }
}
