//! DRM display management
//!
//! Mode selection and CPU-filled scan-out buffers

use anyhow::{anyhow, Context, Result};
use drm::buffer::DrmFourcc;
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{connector, framebuffer, Device as ControlDevice, Mode, ModeTypeFlags};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;

use super::device::Device;
use crate::kms::{DisplayMode, Framebuffer};

impl From<&Mode> for DisplayMode {
    fn from(mode: &Mode) -> Self {
        let (hdisplay, vdisplay) = mode.size();
        let (hsync_start, hsync_end, htotal) = mode.hsync();
        let (vsync_start, vsync_end, vtotal) = mode.vsync();
        DisplayMode {
            name: mode.name().to_string_lossy().into_owned(),
            clock: mode.clock(),
            hdisplay,
            hsync_start,
            hsync_end,
            htotal,
            hskew: mode.hskew(),
            vdisplay,
            vsync_start,
            vsync_end,
            vtotal,
            vscan: mode.vscan(),
            vrefresh: mode.vrefresh(),
            flags: mode.flags().bits(),
            mode_type: mode.mode_type().bits(),
        }
    }
}

/// Pick the connector's preferred mode, falling back to the first listed
pub fn preferred_mode(info: &connector::Info) -> Result<DisplayMode> {
    let modes = info.modes();
    let mode = modes
        .iter()
        .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
        .or_else(|| modes.first())
        .ok_or_else(|| anyhow!("No available display modes"))?;

    let (width, height) = mode.size();
    info!(
        "Display mode: {}x{} @ {}Hz",
        width,
        height,
        mode.vrefresh()
    );
    Ok(DisplayMode::from(mode))
}

/// Dumb (CPU-mapped) buffer registered as a DRM framebuffer
///
/// The kernel framebuffer and its backing buffer are removed on drop.
pub struct DumbFramebuffer {
    device: Arc<Device>,
    fb: framebuffer::Handle,
    buffer: Option<DumbBuffer>,
    width: u32,
    height: u32,
}

impl DumbFramebuffer {
    /// Allocate an XRGB8888 buffer filled with `color`
    pub fn new(device: Arc<Device>, width: u32, height: u32, color: u32) -> Result<Self> {
        let mut buffer = device
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, 32)
            .with_context(|| format!("Failed to create {}x{} dumb buffer", width, height))?;

        {
            let mut mapping = device
                .map_dumb_buffer(&mut buffer)
                .context("Failed to map dumb buffer")?;
            let bytes = color.to_ne_bytes();
            for px in mapping.as_mut().chunks_exact_mut(4) {
                px.copy_from_slice(&bytes);
            }
        }

        let fb = match device.add_framebuffer(&buffer, 24, 32) {
            Ok(fb) => fb,
            Err(e) => {
                let _ = device.destroy_dumb_buffer(buffer);
                return Err(e).context("Failed to add framebuffer");
            }
        };

        debug!(
            "Framebuffer created: id={}, {}x{}, color={:#08x}",
            u32::from(fb),
            width,
            height,
            color
        );

        Ok(Self {
            device,
            fb,
            buffer: Some(buffer),
            width,
            height,
        })
    }
}

impl Framebuffer for DumbFramebuffer {
    fn handle(&self) -> framebuffer::Handle {
        self.fb
    }
}

impl fmt::Debug for DumbFramebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbFramebuffer")
            .field("fb", &self.fb)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Drop for DumbFramebuffer {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_framebuffer(self.fb) {
            warn!("Failed to remove framebuffer {:?}: {}", self.fb, e);
        }
        if let Some(buffer) = self.buffer.take() {
            if let Err(e) = self.device.destroy_dumb_buffer(buffer) {
                warn!("Failed to destroy dumb buffer: {}", e);
            }
        }
        debug!("Framebuffer {} released", u32::from(self.fb));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore]
    fn test_dumb_framebuffer_on_card0() {
        let device = Arc::new(Device::open("/dev/dri/card0").unwrap());
        let fb = DumbFramebuffer::new(device, 64, 32, 0x00ff_0000).unwrap();
        assert_ne!(u32::from(fb.handle()), 0);
        assert!(format!("{:?}", fb).contains("width: 64"));
    }
}
