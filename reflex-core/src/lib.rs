//! reflex-core: Core types for shoebox integration.
//!
//! This crate provides the data structures shared by the integration
//! algorithms: shoeboxes and their mask codes, read-only experiment
//! geometry, the reflection table, the overlap adjacency graph and the
//! profile modelling configuration.
//!

pub mod adjacency;
pub mod config;
pub mod error;
pub mod geometry;
pub mod intensity;
pub mod mask;
pub mod reflection;
pub mod shoebox;

pub use adjacency::AdjacencyList;
pub use config::{GridMethod, ProfileConfig};
pub use error::{Error, Result};
pub use geometry::{Beam, Detector, Experiment, Goniometer, Panel, Scan};
pub use intensity::{Intensity, FAILED_VARIANCE};
pub use mask::MaskCode;
pub use reflection::{Reflection, ReflectionFlags, ReflectionTable};
pub use shoebox::{BoundingBox, Pixel, Shoebox};
