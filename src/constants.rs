//! Global constants for kmscommit
//!
//! Consolidates timing and DRM uapi values to eliminate magic numbers
//! throughout the codebase.

// ============================================================================
// Timing Constants
// ============================================================================

/// Ceiling for any single completion fence wait in milliseconds
pub const DEFAULT_FENCE_TIMEOUT_MS: u64 = 500;

/// Smallest fence timeout accepted from the config file
pub const MIN_FENCE_TIMEOUT_MS: u64 = 16;

/// Largest fence timeout accepted from the config file
pub const MAX_FENCE_TIMEOUT_MS: u64 = 10_000;

/// Demo flip interval in milliseconds (~60Hz)
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

/// Demo frame count
pub const DEFAULT_DEMO_FRAMES: u32 = 120;

// ============================================================================
// DRM uapi values (include/uapi/drm/drm_mode.h)
// ============================================================================

/// `DRM_MODE_DPMS_ON`
pub const DRM_MODE_DPMS_ON: u64 = 0;

/// Default DRM device node pattern
///
/// A trailing `%` stands for card0, card1, ... up to the first missing node.
pub const DEFAULT_DRM_DEVICE: &str = "/dev/dri/card%";
