//! DRM/KMS device access

pub mod backend;
pub mod device;
pub mod display;
#[cfg(target_os = "linux")]
pub mod hotplug;

pub use backend::DrmBackend;
pub use device::{connector_name, is_internal_connector, Device};
pub use display::{preferred_mode, DumbFramebuffer};
#[cfg(target_os = "linux")]
pub use hotplug::{ConnectorChanges, ConnectorSnapshot, HotplugMonitor};
