//! `KmsBackend` on a real DRM device
//!
//! Translates the engine's property writes into `AtomicModeReq` and owns
//! kernel blob lifetimes.

use std::os::unix::io::{FromRawFd, OwnedFd};
use std::sync::Arc;

use drm::control::atomic::AtomicModeReq;
use drm::control::{connector, property, AtomicCommitFlags, Device as ControlDevice};
use log::{debug, warn};

use super::device::Device;
use crate::kms::{
    AtomicRequest, ColorMatrix, CommitError, CompletionFence, DisplayMode, KmsBackend,
    PropertyBlob,
};

/// `struct drm_mode_modeinfo` (include/uapi/drm/drm_mode.h)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawModeInfo {
    clock: u32,
    hdisplay: u16,
    hsync_start: u16,
    hsync_end: u16,
    htotal: u16,
    hskew: u16,
    vdisplay: u16,
    vsync_start: u16,
    vsync_end: u16,
    vtotal: u16,
    vscan: u16,
    vrefresh: u32,
    flags: u32,
    type_: u32,
    name: [libc::c_char; 32],
}

impl From<&DisplayMode> for RawModeInfo {
    fn from(mode: &DisplayMode) -> Self {
        let mut name = [0 as libc::c_char; 32];
        // Always leave a terminating NUL
        for (dst, src) in name.iter_mut().zip(mode.name.bytes().take(31)) {
            *dst = src as libc::c_char;
        }
        Self {
            clock: mode.clock,
            hdisplay: mode.hdisplay,
            hsync_start: mode.hsync_start,
            hsync_end: mode.hsync_end,
            htotal: mode.htotal,
            hskew: mode.hskew,
            vdisplay: mode.vdisplay,
            vsync_start: mode.vsync_start,
            vsync_end: mode.vsync_end,
            vtotal: mode.vtotal,
            vscan: mode.vscan,
            vrefresh: mode.vrefresh,
            flags: mode.flags,
            type_: mode.mode_type,
            name,
        }
    }
}

/// Atomic modesetting backend for one DRM device
pub struct DrmBackend {
    device: Arc<Device>,
}

impl DrmBackend {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    fn create_blob<T>(&self, data: &T, what: &str) -> Result<PropertyBlob, CommitError> {
        let value = self
            .device
            .create_property_blob(data)
            .map_err(|e| CommitError::invalid(format!("failed to create {} blob: {}", what, e)))?;
        let id: property::RawValue = value.into();
        if id == 0 {
            return Err(CommitError::invalid(format!("kernel returned no {} blob", what)));
        }
        debug!("Created {} blob {}", what, id);

        let device = self.device.clone();
        let what = what.to_string();
        Ok(PropertyBlob::new(id, move |id| {
            if let Err(e) = device.destroy_property_blob(id) {
                warn!("Failed to destroy {} blob {}: {}", what, id, e);
            }
        }))
    }
}

impl KmsBackend for DrmBackend {
    fn create_mode_blob(&self, mode: &DisplayMode) -> Result<PropertyBlob, CommitError> {
        self.create_blob(&RawModeInfo::from(mode), "mode")
    }

    fn create_ctm_blob(&self, ctm: &ColorMatrix) -> Result<PropertyBlob, CommitError> {
        self.create_blob(&ctm.coefficients, "CTM")
    }

    fn atomic_commit(
        &self,
        request: &AtomicRequest,
        flags: AtomicCommitFlags,
    ) -> Result<Option<CompletionFence>, CommitError> {
        let mut req = AtomicModeReq::new();
        for w in request.writes() {
            req.add_raw_property(w.object, w.property, w.value);
        }

        // The kernel writes the sync_file fd through this pointer on success
        let mut out_fence: libc::c_int = -1;
        if let Some((crtc, prop)) = request.out_fence() {
            let ptr = &mut out_fence as *mut libc::c_int as u64;
            req.add_raw_property(crtc.into(), prop, ptr);
        }

        self.device
            .atomic_commit(flags, req)
            .map_err(CommitError::Submission)?;

        if out_fence < 0 {
            return Ok(None);
        }
        // SAFETY: a non-negative value is a fresh fd owned by us
        let fd = unsafe { OwnedFd::from_raw_fd(out_fence) };
        Ok(Some(CompletionFence::new(fd)))
    }

    fn set_connector_property(
        &self,
        connector: connector::Handle,
        property: property::Handle,
        value: property::RawValue,
    ) -> Result<(), CommitError> {
        self.device
            .set_property(connector, property, value)
            .map_err(CommitError::Submission)
    }
}
