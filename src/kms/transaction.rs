//! Atomic transaction builder
//!
//! Collects typed property writes for one all-or-nothing submission. The
//! backend turns it into a kernel `AtomicModeReq` at commit time; keeping our
//! own list lets the commit engine and tests inspect exactly what was written.

use drm::control::{crtc, property, RawResourceHandle, ResourceHandle};

use super::error::CommitError;

/// Initial write capacity (activation, routing, mode, ctm, and a few planes)
const INITIAL_WRITES: usize = 32;

/// One property write inside a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyWrite {
    pub object: RawResourceHandle,
    pub property: property::Handle,
    pub value: property::RawValue,
}

/// A pending atomic transaction
#[derive(Debug, Clone, Default)]
pub struct AtomicRequest {
    writes: Vec<PropertyWrite>,
    out_fence: Option<(crtc::Handle, property::Handle)>,
}

impl AtomicRequest {
    /// Allocate an empty request
    pub fn try_new() -> Result<Self, CommitError> {
        let mut writes = Vec::new();
        writes
            .try_reserve(INITIAL_WRITES)
            .map_err(|_| CommitError::OutOfMemory)?;
        Ok(Self {
            writes,
            out_fence: None,
        })
    }

    /// Append a raw property write
    pub fn add<H: ResourceHandle>(
        &mut self,
        object: H,
        property: property::Handle,
        value: property::RawValue,
    ) {
        self.writes.push(PropertyWrite {
            object: object.into(),
            property,
            value,
        });
    }

    /// Ask the kernel for an out-fence through the CRTC's `OUT_FENCE_PTR`.
    ///
    /// The pointer value itself is only known at submission time.
    pub fn request_out_fence(&mut self, crtc: crtc::Handle, property: property::Handle) {
        self.out_fence = Some((crtc, property));
    }

    pub fn out_fence(&self) -> Option<(crtc::Handle, property::Handle)> {
        self.out_fence
    }

    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Value written to `property` of `object`, last write wins
    pub fn value_of<H: ResourceHandle>(
        &self,
        object: H,
        property: property::Handle,
    ) -> Option<property::RawValue> {
        let object: RawResourceHandle = object.into();
        self.writes
            .iter()
            .rev()
            .find(|w| w.object == object && w.property == property)
            .map(|w| w.value)
    }

    /// Whether any write targets `object`
    pub fn touches<H: ResourceHandle>(&self, object: H) -> bool {
        let object: RawResourceHandle = object.into();
        self.writes.iter().any(|w| w.object == object)
    }
}
