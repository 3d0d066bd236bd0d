//! kmscommit: fence-gated atomic KMS commits
//!
//! The [`kms`] module holds the hardware-agnostic commit engine; [`drm`]
//! binds it to a Linux DRM device.

pub mod config;
pub mod constants;
pub mod drm;
pub mod kms;
