//! reflex-algorithms: Integration algorithms for shoebox data.
//!
//! This crate provides the stages of the integration pipeline:
//! - **Background** - robust constant, planar and linear background models
//! - **Transform** - detector pixels into the reflection's reciprocal-space grid
//! - **Reference profiles** - spatially sampled, mergeable accumulation
//! - **Profile fitting** - iteratively re-weighted least squares
//! - **Overlaps** - sort-and-sweep box collisions and pixel ownership
//! - **Summation** - background-subtracted sums
//!
#![warn(missing_docs)]

pub mod background;
pub mod coordinate_system;
mod fitting;
mod masking;
mod modeller;
mod overlap;
mod processing;
mod reference;
pub mod sampler;
pub mod spatial;
mod summation;
pub mod transform;

pub use background::{
    BackgroundBatch, BackgroundConfig, BackgroundCreator, BackgroundModel, BackgroundSurface,
    OutlierRejector,
};
pub use coordinate_system::{zeta_factor, CoordinateSystem};
pub use fitting::{fit_profile, ProfileFit};
pub use masking::{mask_neighbours, mask_overlapping, MaskedPixels};
pub use modeller::ProfileModeller;
pub use overlap::{find_overlapping, find_overlapping_multi_panel, OverlapFinder};
pub use processing::{IntegrationParams, IntegrationReport, Integrator};
pub use reference::{ReferenceAccumulator, ReferenceProfiles, ReferenceQuality};
pub use sampler::{CircleSampler, GridSampler, Sampler, SingleSampler};
pub use spatial::detect_collisions3d;
pub use summation::{integrate_sum, integrate_sum_table};
pub use transform::{MapFramesForward, TransformForward, TransformSpec};

// Re-export core types used throughout the pipeline
pub use reflex_core::{Error, ProfileConfig, Result};
