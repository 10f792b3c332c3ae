//! Error types for reflex-core.

use thiserror::Error;

/// Result type alias for reflex operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while processing a single reflection or a batch.
///
/// The variants fall into two classes. Precondition violations
/// (shape mismatches, invalid boxes, degenerate geometry, bad
/// configuration) mean the inputs were malformed. Data-quality failures
/// mean the inputs were well formed but the pixels do not support the
/// requested estimate. Batch drivers treat both as a per-reflection
/// failure; see [`Error::is_data_quality`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Bounding box with a non-positive extent on some axis.
    #[error("invalid bounding box: ({x0}, {x1}, {y0}, {y1}, {z0}, {z1})")]
    InvalidBoundingBox {
        x0: i32,
        x1: i32,
        y0: i32,
        y1: i32,
        z0: i32,
        z1: i32,
    },

    /// Array extents disagree.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        found: [usize; 3],
    },

    /// Geometry that cannot define the requested quantity.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Query outside the domain a sampler or panel covers.
    #[error("position ({x}, {y}, {z}) outside sampling domain")]
    OutOfDomain { x: f64, y: f64, z: f64 },

    /// Index outside a table or list.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// No pixels were available to fit the background.
    #[error("no usable background pixels")]
    NoBackgroundPixels,

    /// No pixels were available to integrate.
    #[error("no usable foreground pixels")]
    NoForegroundPixels,

    /// Background model system could not be solved.
    #[error("background model is singular")]
    SingularBackground,

    /// Shoebox extends past the image or scan.
    #[error("bounding box outside image volume")]
    BoundingBoxOutsideImage,

    /// Foreground pixels flagged as invalid.
    #[error("foreground contains invalid pixels")]
    InvalidForegroundPixels,

    /// Reference profile has no usable data for the requested cell.
    #[error("reference profile {0} has insufficient data")]
    InsufficientReference(usize),

    /// Correlation denominator vanished.
    #[error("zero variance in profile correlation")]
    ZeroVariance,

    /// Iterative fit reached its budget without meeting the tolerance.
    #[error("profile fit did not converge after {iterations} iterations (error {error})")]
    NotConverged { iterations: usize, error: f64 },
}

impl Error {
    /// Returns true for failures caused by the pixel data rather than by
    /// malformed inputs.
    #[must_use]
    pub fn is_data_quality(&self) -> bool {
        matches!(
            self,
            Error::NoBackgroundPixels
                | Error::NoForegroundPixels
                | Error::SingularBackground
                | Error::BoundingBoxOutsideImage
                | Error::InvalidForegroundPixels
                | Error::InsufficientReference(_)
                | Error::ZeroVariance
                | Error::NotConverged { .. }
        )
    }

    /// Shorthand for [`Error::DegenerateGeometry`].
    pub fn degenerate(message: impl Into<String>) -> Self {
        Error::DegenerateGeometry(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::NoBackgroundPixels.is_data_quality());
        assert!(Error::NotConverged {
            iterations: 100,
            error: 0.5
        }
        .is_data_quality());
        assert!(!Error::ConfigError("bad".into()).is_data_quality());
        assert!(!Error::ShapeMismatch {
            expected: [1, 2, 3],
            found: [3, 2, 1]
        }
        .is_data_quality());
    }

    #[test]
    fn test_error_display() {
        let err = Error::IndexOutOfRange { index: 5, len: 3 };
        assert_eq!(err.to_string(), "index 5 out of range for length 3");
    }
}
