//! Pipeline objects and their atomic properties
//!
//! Property ids are discovered elsewhere (see `drm::device`) and handed in
//! here already resolved. A property the hardware does not expose is kept as
//! `None`; writing it rejects the whole transaction.

use std::fmt;
use std::sync::Arc;

use drm::control::{connector, crtc, plane, property, ResourceHandle};
use log::trace;

use super::error::CommitError;
use super::request::{BlendMode, LayerData, Rotation, SourceCrop};
use super::transaction::AtomicRequest;

/// A named KMS property that may be absent on this hardware
#[derive(Debug, Clone, Default)]
pub struct DrmProperty {
    name: String,
    id: Option<property::Handle>,
    enums: Vec<(String, u64)>,
}

impl DrmProperty {
    pub fn new(name: impl Into<String>, id: property::Handle) -> Self {
        Self {
            name: name.into(),
            id: Some(id),
            enums: Vec::new(),
        }
    }

    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            enums: Vec::new(),
        }
    }

    /// Attach enum name/value pairs (e.g. "pixel blend mode")
    pub fn with_enums(mut self, enums: Vec<(String, u64)>) -> Self {
        self.enums = enums;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<property::Handle> {
        self.id
    }

    pub fn is_present(&self) -> bool {
        self.id.is_some()
    }

    pub fn enum_value(&self, name: &str) -> Option<u64> {
        self.enums.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// Add a write of this property to `req`
    pub fn atomic_set<H: ResourceHandle>(
        &self,
        req: &mut AtomicRequest,
        object: H,
        value: u64,
    ) -> Result<(), CommitError> {
        let id = self.id.ok_or_else(|| {
            CommitError::invalid(format!("property {} is not supported", self.name))
        })?;
        req.add(object, id, value);
        Ok(())
    }
}

/// Connector end of the pipeline
#[derive(Debug, Clone)]
pub struct Connector {
    pub handle: connector::Handle,
    pub name: String,
    /// Built-in panel (eDP/LVDS/DSI)
    pub internal: bool,
    pub crtc_id: DrmProperty,
    pub dpms: DrmProperty,
}

/// CRTC driving the connector
#[derive(Debug, Clone)]
pub struct Crtc {
    pub handle: crtc::Handle,
    pub active: DrmProperty,
    pub mode_id: DrmProperty,
    pub ctm: DrmProperty,
    pub out_fence_ptr: DrmProperty,
}

/// Properties a scan-out plane may expose
#[derive(Debug, Clone, Default)]
pub struct PlaneProperties {
    pub crtc_id: DrmProperty,
    pub fb_id: DrmProperty,
    pub crtc_x: DrmProperty,
    pub crtc_y: DrmProperty,
    pub crtc_w: DrmProperty,
    pub crtc_h: DrmProperty,
    pub src_x: DrmProperty,
    pub src_y: DrmProperty,
    pub src_w: DrmProperty,
    pub src_h: DrmProperty,
    pub zpos: DrmProperty,
    pub rotation: DrmProperty,
    pub alpha: DrmProperty,
    pub blend_mode: DrmProperty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    Primary,
    Overlay,
    Cursor,
}

/// Hardware scan-out plane
#[derive(Debug, Clone)]
pub struct Plane {
    pub handle: plane::Handle,
    pub kind: PlaneKind,
    pub props: PlaneProperties,
}

impl PartialEq for Plane {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Plane {}

impl Plane {
    /// Program this plane to scan out `layer` on `crtc` at `zpos`.
    ///
    /// The bottom-most plane has nothing beneath it to blend with, so its
    /// blend mode is forced to "None" when the plane supports blending.
    pub fn atomic_set_state(
        &self,
        req: &mut AtomicRequest,
        layer: &LayerData,
        zpos: u32,
        crtc: crtc::Handle,
        most_bottom: bool,
    ) -> Result<(), CommitError> {
        let p = &self.props;
        let h = self.handle;
        let frame = &layer.display_frame;
        let crop = &layer.source_crop;

        trace!(
            "Plane {:?}: fb={:?} zpos={} frame={:?} bottom={}",
            h,
            layer.framebuffer.handle(),
            zpos,
            frame,
            most_bottom
        );

        p.crtc_id.atomic_set(req, h, u32::from(crtc) as u64)?;
        p.fb_id
            .atomic_set(req, h, u32::from(layer.framebuffer.handle()) as u64)?;
        p.crtc_x.atomic_set(req, h, frame.x as i64 as u64)?;
        p.crtc_y.atomic_set(req, h, frame.y as i64 as u64)?;
        p.crtc_w.atomic_set(req, h, frame.w as u64)?;
        p.crtc_h.atomic_set(req, h, frame.h as u64)?;
        p.src_x.atomic_set(req, h, SourceCrop::to_fixed(crop.x))?;
        p.src_y.atomic_set(req, h, SourceCrop::to_fixed(crop.y))?;
        p.src_w.atomic_set(req, h, SourceCrop::to_fixed(crop.w))?;
        p.src_h.atomic_set(req, h, SourceCrop::to_fixed(crop.h))?;

        if p.zpos.is_present() {
            p.zpos.atomic_set(req, h, zpos as u64)?;
        }

        if p.rotation.is_present() {
            p.rotation.atomic_set(req, h, layer.rotation.bits())?;
        } else if layer.rotation != Rotation::ROTATE_0 {
            return Err(CommitError::invalid(format!(
                "plane {:?} cannot rotate ({:?})",
                h, layer.rotation
            )));
        }

        if p.alpha.is_present() {
            p.alpha.atomic_set(req, h, layer.alpha as u64)?;
        }

        if p.blend_mode.is_present() {
            let wanted = if most_bottom {
                BlendMode::None
            } else {
                layer.blend
            };
            let value = p.blend_mode.enum_value(wanted.kernel_name()).ok_or_else(|| {
                CommitError::invalid(format!(
                    "plane {:?} does not support blend mode {}",
                    h,
                    wanted.kernel_name()
                ))
            })?;
            p.blend_mode.atomic_set(req, h, value)?;
        }

        Ok(())
    }

    /// Detach this plane from any CRTC
    pub fn atomic_disable(&self, req: &mut AtomicRequest) -> Result<(), CommitError> {
        self.props.crtc_id.atomic_set(req, self.handle, 0)?;
        self.props.fb_id.atomic_set(req, self.handle, 0)?;
        Ok(())
    }
}

/// The (connector, CRTC) pair a manager is bound to, plus its usable planes
#[derive(Clone)]
pub struct Pipeline {
    pub connector: Connector,
    pub crtc: Crtc,
    pub planes: Vec<Arc<Plane>>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.connector.name
    }

    pub fn primary_plane(&self) -> Option<&Arc<Plane>> {
        self.planes.iter().find(|p| p.kind == PlaneKind::Primary)
    }

    pub fn overlay_planes(&self) -> impl Iterator<Item = &Arc<Plane>> {
        self.planes.iter().filter(|p| p.kind == PlaneKind::Overlay)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("connector", &self.connector.name)
            .field("crtc", &self.crtc.handle)
            .field("planes", &self.planes.len())
            .finish()
    }
}
