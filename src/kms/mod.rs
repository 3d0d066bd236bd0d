//! Fence-gated atomic commit core
//!
//! Everything here is hardware-agnostic: the display subsystem is reached
//! only through [`KmsBackend`].

pub mod backend;
pub mod error;
pub mod fence;
pub mod manager;
pub mod object;
pub mod request;
pub mod resource;
pub mod state;
#[cfg(test)]
pub(crate) mod testing;
pub mod transaction;

pub use backend::KmsBackend;
pub use error::{CommitError, FenceError};
pub use fence::CompletionFence;
pub use manager::{AtomicStateManager, FrameCounters, ManagerOptions};
pub use object::{Connector, Crtc, DrmProperty, Pipeline, Plane, PlaneKind, PlaneProperties};
pub use request::{
    BlendMode, ColorMatrix, CommitRequest, CompositionPlan, DisplayFrame, DisplayMode, LayerData,
    PlaneJoining, Rotation, SourceCrop,
};
pub use resource::{MainLock, PipelineChanges, ResourceManager};
pub use state::{FrameState, FrameSummary, Framebuffer, PlaneBinding, PropertyBlob};
pub use transaction::{AtomicRequest, PropertyWrite};
