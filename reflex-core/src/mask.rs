//! Per-pixel mask codes.

use bitflags::bitflags;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

bitflags! {
    /// Bit flags attached to every shoebox pixel.
    ///
    /// Flags are not mutually exclusive. A pixel takes part in background
    /// fitting when it carries [`MaskCode::BACKGROUND_CANDIDATE`] and in
    /// signal integration when it carries [`MaskCode::SIGNAL`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct MaskCode: u32 {
        /// Pixel holds a trusted measurement.
        const VALID = 1 << 0;
        /// Pixel belongs to the background region.
        const BACKGROUND = 1 << 1;
        /// Pixel belongs to the peak region.
        const FOREGROUND = 1 << 2;
        /// Pixel was part of a strong spot found by spot finding.
        const STRONG = 1 << 3;
        /// Pixel was kept by outlier rejection and used in the background fit.
        const BACKGROUND_USED = 1 << 4;
        /// Pixel value is above the detector's trusted range.
        const OVERLOADED = 1 << 5;
        /// Foreground pixel claimed by a neighbouring reflection.
        const OVERLAPPED_FOREGROUND = 1 << 6;
        /// Background pixel claimed by a neighbouring reflection.
        const OVERLAPPED_BACKGROUND = 1 << 7;
        /// Pixel lies in a powder ring.
        const IN_POWDER_RING = 1 << 8;

        /// Pixels eligible for background fitting.
        const BACKGROUND_CANDIDATE = Self::VALID.bits() | Self::BACKGROUND.bits();
        /// Pixels eligible for signal integration.
        const SIGNAL = Self::VALID.bits() | Self::FOREGROUND.bits();
        /// Pixels fed to the background model after rejection.
        const BACKGROUND_FIT = Self::VALID.bits() | Self::BACKGROUND_USED.bits();
    }
}

impl MaskCode {
    /// Returns true when every bit of `code` is set.
    #[inline]
    #[must_use]
    pub fn has(self, code: MaskCode) -> bool {
        self.contains(code)
    }
}
