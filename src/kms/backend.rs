//! Display subsystem capability interface
//!
//! The commit engine only talks to hardware through this trait. Production
//! uses `crate::drm::DrmBackend`; tests use a recording fake.

use drm::control::{connector, property, AtomicCommitFlags};

use super::error::CommitError;
use super::fence::CompletionFence;
use super::request::{ColorMatrix, DisplayMode};
use super::state::PropertyBlob;
use super::transaction::AtomicRequest;

pub trait KmsBackend: Send + Sync {
    /// Register a mode blob. Rejection maps to `CommitError::InvalidArgument`.
    fn create_mode_blob(&self, mode: &DisplayMode) -> Result<PropertyBlob, CommitError>;

    /// Register a CTM blob. Rejection maps to `CommitError::InvalidArgument`.
    fn create_ctm_blob(&self, ctm: &ColorMatrix) -> Result<PropertyBlob, CommitError>;

    /// Submit `request` with `flags`.
    ///
    /// Returns the out-fence when one was requested and the kernel produced
    /// it. Errors are `CommitError::Submission` carrying the kernel's code.
    fn atomic_commit(
        &self,
        request: &AtomicRequest,
        flags: AtomicCommitFlags,
    ) -> Result<Option<CompletionFence>, CommitError>;

    /// Direct (non-atomic) connector property write
    fn set_connector_property(
        &self,
        connector: connector::Handle,
        property: property::Handle,
        value: property::RawValue,
    ) -> Result<(), CommitError>;
}
