//! DRM device management
//!
//! Opens DRM device (/dev/dri/card*), enables atomic modesetting and
//! enumerates available connectors, CRTCs, encoders and planes.
//!
//! Property ids are resolved by name once per object and handed to the
//! commit engine as a [`Pipeline`].

use anyhow::{anyhow, Context, Result};
use drm::control::{
    connector, crtc, encoder, property, Device as ControlDevice, ResourceHandle, ResourceHandles,
};
use drm::{ClientCapability, Device as BasicDevice};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::Arc;

use crate::kms::{Connector, Crtc, DrmProperty, Pipeline, Plane, PlaneKind, PlaneProperties};

/// DRM device wrapper
pub struct Device {
    file: File,
    resources: ResourceHandles,
}

// Trait implementations required by drm crate
impl AsFd for Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl BasicDevice for Device {}
impl ControlDevice for Device {}

impl Device {
    /// Open DRM device
    ///
    /// # Arguments
    /// * `path` - Device path (e.g., "/dev/dri/card0")
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening DRM device: {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Cannot open DRM device {}", path.display()))?;

        Self::from_file(file)
    }

    /// Wrap an already opened device node
    pub fn from_file(file: File) -> Result<Self> {
        // Create temporary device wrapper to set caps and get resources
        struct TempDevice<'a>(&'a File);
        impl AsFd for TempDevice<'_> {
            fn as_fd(&self) -> BorrowedFd<'_> {
                self.0.as_fd()
            }
        }
        impl BasicDevice for TempDevice<'_> {}
        impl ControlDevice for TempDevice<'_> {}

        let temp = TempDevice(&file);

        // Primary and cursor planes are only listed with universal planes on
        temp.set_client_capability(ClientCapability::UniversalPlanes, true)
            .context("Driver does not support universal planes")?;
        temp.set_client_capability(ClientCapability::Atomic, true)
            .context("Driver does not support atomic modesetting")?;

        let resources = temp
            .resource_handles()
            .context("Failed to get DRM resources")?;

        info!(
            "DRM resources: connectors={}, crtcs={}, encoders={}, framebuffers={}",
            resources.connectors().len(),
            resources.crtcs().len(),
            resources.encoders().len(),
            resources.framebuffers().len()
        );

        Ok(Self { file, resources })
    }

    /// Get connector info
    pub fn get_connector(&self, handle: connector::Handle) -> Result<connector::Info> {
        ControlDevice::get_connector(self, handle, false)
            .with_context(|| format!("Failed to get connector {:?} info", handle))
    }

    /// Get encoder info
    pub fn get_encoder(&self, handle: encoder::Handle) -> Result<encoder::Info> {
        ControlDevice::get_encoder(self, handle)
            .with_context(|| format!("Failed to get encoder {:?} info", handle))
    }

    /// Find preferred connected connector based on priority
    ///
    /// When prefer_external is true, external connectors (HDMI, DP, DVI, VGA)
    /// are prioritized over internal (eDP, LVDS).
    ///
    /// Priority order: HDMI > DisplayPort > DVI > VGA > eDP > LVDS > others
    pub fn find_preferred_connector(
        &self,
        prefer_external: bool,
    ) -> Result<(connector::Handle, connector::Info)> {
        let mut connectors = self.get_connected_connectors();
        if connectors.is_empty() {
            return Err(anyhow!("No connected connector found"));
        }

        // Sort by priority (lower is better); stable, so ties keep kernel order
        connectors.sort_by_key(|(_, info)| connector_priority(info.interface(), prefer_external));

        let (handle, info) = connectors.swap_remove(0);
        info!("Selected connector: {:?} ({:?})", handle, info.interface());
        Ok((handle, info))
    }

    /// Get all connected connectors with their info
    ///
    /// The connector list is re-read, as DP MST hubs add and remove
    /// connector objects at runtime.
    pub fn get_connected_connectors(&self) -> Vec<(connector::Handle, connector::Info)> {
        let handles = match self.resource_handles() {
            Ok(resources) => resources.connectors().to_vec(),
            Err(e) => {
                warn!("Failed to refresh DRM resources: {}", e);
                self.resources.connectors().to_vec()
            }
        };

        let mut result = Vec::new();
        for handle in handles {
            match self.get_connector(handle) {
                Ok(info) if info.state() == connector::State::Connected => {
                    result.push((handle, info))
                }
                Ok(_) => {}
                Err(e) => warn!("{:#}", e),
            }
        }
        result
    }

    /// Find CRTC for connector, skipping CRTCs in `taken`
    pub fn find_crtc_for_connector(
        &self,
        connector: &connector::Info,
        taken: &[crtc::Handle],
    ) -> Result<crtc::Handle> {
        // First check current encoder
        if let Some(encoder_handle) = connector.current_encoder() {
            let encoder = self.get_encoder(encoder_handle)?;
            if let Some(crtc_handle) = encoder.crtc() {
                if !taken.contains(&crtc_handle) {
                    return Ok(crtc_handle);
                }
            }
        }

        // Find available encoder and CRTC
        for &encoder_handle in connector.encoders() {
            let encoder = self.get_encoder(encoder_handle)?;

            // Check CRTCs supported by encoder
            let possible = encoder.possible_crtcs();
            let filtered = self.resources.filter_crtcs(possible);

            if let Some(crtc_handle) = filtered.into_iter().find(|c| !taken.contains(c)) {
                return Ok(crtc_handle);
            }
        }

        Err(anyhow!("No CRTC found for connector"))
    }

    /// Read every property of `object` with its name and enum entries
    fn property_table<H: ResourceHandle>(&self, object: H) -> Result<Vec<DrmProperty>> {
        let raw: u32 = object.into();
        let props = self
            .get_properties(object)
            .with_context(|| format!("Failed to get properties of object {}", raw))?;
        let (ids, _values) = props.as_props_and_values();

        let mut table = Vec::with_capacity(ids.len());
        for &id in ids {
            let info = match self.get_property(id) {
                Ok(info) => info,
                Err(e) => {
                    debug!("Skipping property {:?}: {}", id, e);
                    continue;
                }
            };
            let Ok(name) = info.name().to_str() else {
                continue;
            };
            let mut prop = DrmProperty::new(name, id);
            if let property::ValueType::Enum(values) = info.value_type() {
                let (_, entries) = values.values();
                let enums = entries
                    .iter()
                    .filter_map(|e| Some((e.name().to_str().ok()?.to_string(), e.value())))
                    .collect();
                prop = prop.with_enums(enums);
            }
            table.push(prop);
        }
        Ok(table)
    }

    /// Value of a named property, read directly from the kernel
    fn property_value<H: ResourceHandle>(&self, object: H, name: &str) -> Option<u64> {
        let props = self.get_properties(object).ok()?;
        let (ids, values) = props.as_props_and_values();
        ids.iter().zip(values.iter()).find_map(|(&id, &value)| {
            let info = self.get_property(id).ok()?;
            (info.name().to_str().ok()? == name).then_some(value)
        })
    }

    /// Planes the given CRTC may scan out from
    fn planes_for_crtc(&self, crtc: crtc::Handle) -> Result<Vec<Arc<Plane>>> {
        let handles = self.plane_handles().context("Failed to list planes")?;

        let mut planes = Vec::new();
        for handle in handles {
            let info = match self.get_plane(handle) {
                Ok(info) => info,
                Err(e) => {
                    debug!("Failed to get plane {:?}: {}", handle, e);
                    continue;
                }
            };
            if !self
                .resources
                .filter_crtcs(info.possible_crtcs())
                .contains(&crtc)
            {
                continue;
            }

            let table = self.property_table(handle)?;
            let kind = match self.property_value(handle, "type") {
                Some(DRM_PLANE_TYPE_PRIMARY) => PlaneKind::Primary,
                Some(DRM_PLANE_TYPE_CURSOR) => PlaneKind::Cursor,
                _ => PlaneKind::Overlay,
            };
            let props = PlaneProperties {
                crtc_id: lookup(&table, "CRTC_ID"),
                fb_id: lookup(&table, "FB_ID"),
                crtc_x: lookup(&table, "CRTC_X"),
                crtc_y: lookup(&table, "CRTC_Y"),
                crtc_w: lookup(&table, "CRTC_W"),
                crtc_h: lookup(&table, "CRTC_H"),
                src_x: lookup(&table, "SRC_X"),
                src_y: lookup(&table, "SRC_Y"),
                src_w: lookup(&table, "SRC_W"),
                src_h: lookup(&table, "SRC_H"),
                zpos: lookup(&table, "zpos"),
                rotation: lookup(&table, "rotation"),
                alpha: lookup(&table, "alpha"),
                blend_mode: lookup(&table, "pixel blend mode"),
            };
            debug!("Plane {:?}: {:?}", handle, kind);
            planes.push(Arc::new(Plane {
                handle,
                kind,
                props,
            }));
        }

        // Primary first so it is the natural bottom of a composition
        planes.sort_by_key(|p| p.kind != PlaneKind::Primary);
        Ok(planes)
    }

    /// Resolve the objects and properties driving one connector
    pub fn build_pipeline(
        &self,
        handle: connector::Handle,
        info: &connector::Info,
        taken: &[crtc::Handle],
    ) -> Result<Pipeline> {
        let crtc_handle = self.find_crtc_for_connector(info, taken)?;

        let conn_props = self.property_table(handle)?;
        let connector = Connector {
            handle,
            name: connector_name(info),
            internal: is_internal_connector(info.interface()),
            crtc_id: lookup(&conn_props, "CRTC_ID"),
            dpms: lookup(&conn_props, "DPMS"),
        };

        let crtc_props = self.property_table(crtc_handle)?;
        let crtc = Crtc {
            handle: crtc_handle,
            active: lookup(&crtc_props, "ACTIVE"),
            mode_id: lookup(&crtc_props, "MODE_ID"),
            ctm: lookup(&crtc_props, "CTM"),
            out_fence_ptr: lookup(&crtc_props, "OUT_FENCE_PTR"),
        };
        if !crtc.out_fence_ptr.is_present() {
            return Err(anyhow!("CRTC {:?} has no OUT_FENCE_PTR", crtc_handle));
        }

        let planes = self.planes_for_crtc(crtc_handle)?;
        if planes.is_empty() {
            return Err(anyhow!("No plane can scan out on CRTC {:?}", crtc_handle));
        }

        let pipeline = Pipeline {
            connector,
            crtc,
            planes,
        };
        info!("Pipeline: {:?}", pipeline);
        Ok(pipeline)
    }

    /// One pipeline per connected connector, each on its own CRTC
    ///
    /// Connectors are visited in preference order, so with a shortage of
    /// CRTCs the preferred display still gets one.
    pub fn discover_pipelines(&self, prefer_external: bool) -> Vec<Pipeline> {
        let mut connected = self.get_connected_connectors();
        connected.sort_by_key(|(_, info)| connector_priority(info.interface(), prefer_external));

        let mut taken = Vec::new();
        let mut pipelines = Vec::new();
        for (handle, info) in connected {
            match self.build_pipeline(handle, &info, &taken) {
                Ok(pipeline) => {
                    taken.push(pipeline.crtc.handle);
                    pipelines.push(pipeline);
                }
                Err(e) => warn!("Skipping connector {}: {:#}", connector_name(&info), e),
            }
        }
        pipelines
    }

    /// Drop DRM master privileges
    pub fn drop_master(&self) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), drm_ioctl::DRM_IOCTL_DROP_MASTER) };
        if ret < 0 {
            return Err(anyhow!(
                "DROP_MASTER failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        info!("DRM master dropped");
        Ok(())
    }

    /// Acquire DRM master privileges (needed for any atomic commit)
    pub fn set_master(&self) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), drm_ioctl::DRM_IOCTL_SET_MASTER) };
        if ret < 0 {
            return Err(anyhow!(
                "SET_MASTER failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        info!("DRM master acquired");
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Release DRM master privileges
        unsafe {
            libc::ioctl(self.file.as_raw_fd(), drm_ioctl::DRM_IOCTL_DROP_MASTER);
        }
    }
}

// DRM ioctl constants
mod drm_ioctl {
    // Linux: include/uapi/drm/drm.h
    // _IO('d', 0x1e) = SET_MASTER, _IO('d', 0x1f) = DROP_MASTER
    const DRM_IOCTL_BASE: u64 = 0x64;
    pub const DRM_IOCTL_SET_MASTER: libc::c_ulong =
        nix::request_code_none!(DRM_IOCTL_BASE, 0x1e) as libc::c_ulong;
    pub const DRM_IOCTL_DROP_MASTER: libc::c_ulong =
        nix::request_code_none!(DRM_IOCTL_BASE, 0x1f) as libc::c_ulong;
}

// Plane "type" enum values (include/uapi/drm/drm_mode.h)
const DRM_PLANE_TYPE_PRIMARY: u64 = 1;
const DRM_PLANE_TYPE_CURSOR: u64 = 2;

fn lookup(table: &[DrmProperty], name: &str) -> DrmProperty {
    table
        .iter()
        .find(|p| p.name() == name)
        .cloned()
        .unwrap_or_else(|| DrmProperty::missing(name))
}

/// Kernel-style connector name, e.g. "HDMI-A-1"
pub fn connector_name(info: &connector::Info) -> String {
    format!(
        "{}-{}",
        interface_name(info.interface()),
        info.interface_id()
    )
}

fn interface_name(interface: connector::Interface) -> &'static str {
    use connector::Interface;

    match interface {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        Interface::Writeback => "Writeback",
        _ => "Unknown",
    }
}

fn connector_priority(interface: connector::Interface, prefer_external: bool) -> i32 {
    use connector::Interface;

    if prefer_external {
        // External monitors first
        match interface {
            Interface::HDMIA | Interface::HDMIB => 10,
            Interface::DisplayPort => 20,
            Interface::DVID | Interface::DVII | Interface::DVIA => 30,
            Interface::VGA => 40,
            // Internal displays last
            Interface::EmbeddedDisplayPort => 100, // eDP (laptop internal)
            Interface::LVDS => 110,
            Interface::DSI => 120,
            // Other/unknown
            _ => 50,
        }
    } else {
        // First connected wins (no preference)
        0
    }
}

/// Check if connector is internal (laptop built-in display)
pub fn is_internal_connector(interface: connector::Interface) -> bool {
    use connector::Interface;
    matches!(
        interface,
        Interface::EmbeddedDisplayPort | Interface::LVDS | Interface::DSI
    )
}
