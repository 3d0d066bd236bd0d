//! Frame state: everything the hardware holds a reference to for one
//! applied configuration
//!
//! Dropping a `FrameState` releases its blobs and framebuffer references, so
//! it must only be dropped once the hardware has stopped reading them.

use std::fmt;
use std::sync::Arc;

use drm::control::{framebuffer, plane};

use super::object::Plane;

/// A registered scan-out buffer
///
/// Implementations remove the kernel framebuffer when the last reference is
/// dropped.
pub trait Framebuffer: Send + Sync + fmt::Debug {
    fn handle(&self) -> framebuffer::Handle;
}

/// Owned property blob (mode or CTM); destroyed on drop
pub struct PropertyBlob {
    id: u64,
    release: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl PropertyBlob {
    pub fn new(id: u64, release: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for PropertyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropertyBlob").field(&self.id).finish()
    }
}

impl Drop for PropertyBlob {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.id);
        }
    }
}

/// One plane scanning out one framebuffer
#[derive(Debug, Clone)]
pub struct PlaneBinding {
    pub plane: Arc<Plane>,
    pub framebuffer: Arc<dyn Framebuffer>,
    pub zpos: u32,
}

/// Resources referenced by one applied configuration
#[derive(Debug, Default)]
pub struct FrameState {
    pub active: bool,
    /// `None` when the mode was not touched by this commit
    pub mode_blob: Option<PropertyBlob>,
    pub ctm_blob: Option<PropertyBlob>,
    pub bindings: Vec<PlaneBinding>,
}

impl FrameState {
    /// Working copy for the next commit.
    ///
    /// Plane bindings carry over because the planes keep scanning out their
    /// buffers until told otherwise; blobs do not, the hardware already holds
    /// the previous ones.
    pub fn derive(&self) -> Self {
        Self {
            active: self.active,
            mode_blob: None,
            ctm_blob: None,
            bindings: self.bindings.clone(),
        }
    }

    pub fn bound_planes(&self) -> impl Iterator<Item = &Arc<Plane>> {
        self.bindings.iter().map(|b| &b.plane)
    }

    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            active: self.active,
            mode_blob: self.mode_blob.as_ref().map(PropertyBlob::id),
            ctm_blob: self.ctm_blob.as_ref().map(PropertyBlob::id),
            planes: self
                .bindings
                .iter()
                .map(|b| (b.plane.handle, b.framebuffer.handle(), b.zpos))
                .collect(),
        }
    }
}

/// Plain copy of a `FrameState` for inspection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameSummary {
    pub active: bool,
    pub mode_blob: Option<u64>,
    pub ctm_blob: Option<u64>,
    pub planes: Vec<(plane::Handle, framebuffer::Handle, u32)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::testing::{fake_framebuffer, fake_pipeline};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_blob_released_once_on_drop() {
        let released = Arc::new(AtomicU64::new(0));
        let r = released.clone();
        let blob = PropertyBlob::new(42, move |id| {
            r.fetch_add(id, Ordering::SeqCst);
        });
        assert_eq!(blob.id(), 42);
        drop(blob);
        assert_eq!(released.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_derive_keeps_bindings_drops_blobs() {
        let pipe = fake_pipeline(1);
        let (fb, drops) = fake_framebuffer(10);
        let state = FrameState {
            active: true,
            mode_blob: Some(PropertyBlob::new(1, |_| {})),
            ctm_blob: None,
            bindings: vec![PlaneBinding {
                plane: pipe.planes[0].clone(),
                framebuffer: fb,
                zpos: 0,
            }],
        };

        let working = state.derive();
        assert!(working.active);
        assert!(working.mode_blob.is_none());
        assert_eq!(working.bindings.len(), 1);

        // The framebuffer lives as long as either state references it
        drop(state);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(working);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_summary() {
        let pipe = fake_pipeline(1);
        let (fb, _) = fake_framebuffer(10);
        let state = FrameState {
            active: true,
            mode_blob: Some(PropertyBlob::new(5, |_| {})),
            ctm_blob: None,
            bindings: vec![PlaneBinding {
                plane: pipe.planes[0].clone(),
                framebuffer: fb.clone(),
                zpos: 2,
            }],
        };
        let summary = state.summary();
        assert!(summary.active);
        assert_eq!(summary.mode_blob, Some(5));
        assert_eq!(summary.planes, vec![(pipe.planes[0].handle, fb.handle(), 2)]);
    }
}
