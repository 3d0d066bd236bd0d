//! Test doubles: a recording backend, fake pipeline and framebuffers

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use drm::control::{connector, crtc, framebuffer, from_u32, plane, property, AtomicCommitFlags};
use nix::fcntl::OFlag;
use nix::unistd::{pipe2, write};

use super::backend::KmsBackend;
use super::error::CommitError;
use super::fence::CompletionFence;
use super::object::{Connector, Crtc, DrmProperty, Pipeline, Plane, PlaneKind, PlaneProperties};
use super::request::{ColorMatrix, DisplayMode};
use super::state::{Framebuffer, PropertyBlob};
use super::transaction::AtomicRequest;

#[derive(Debug)]
pub struct FakeFramebuffer {
    handle: framebuffer::Handle,
    drops: Arc<AtomicUsize>,
}

impl Framebuffer for FakeFramebuffer {
    fn handle(&self) -> framebuffer::Handle {
        self.handle
    }
}

impl Drop for FakeFramebuffer {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Framebuffer plus a counter bumped when it is finally released
pub fn fake_framebuffer(id: u32) -> (Arc<dyn Framebuffer>, Arc<AtomicUsize>) {
    let drops = Arc::new(AtomicUsize::new(0));
    let fb = FakeFramebuffer {
        handle: from_u32(id).unwrap(),
        drops: drops.clone(),
    };
    (Arc::new(fb), drops)
}

fn prop(name: &str, id: u32) -> DrmProperty {
    DrmProperty::new(name, from_u32(id).unwrap())
}

/// Pipeline with connector 20, CRTC 30 and `planes` planes (40, 41, ...),
/// the first one primary. Every property gets a distinct id.
pub fn fake_pipeline(planes: usize) -> Pipeline {
    let connector = Connector {
        handle: from_u32::<connector::Handle>(20).unwrap(),
        name: "HDMI-A-1".to_string(),
        internal: false,
        crtc_id: prop("CRTC_ID", 100),
        dpms: prop("DPMS", 101),
    };
    let crtc = Crtc {
        handle: from_u32::<crtc::Handle>(30).unwrap(),
        active: prop("ACTIVE", 110),
        mode_id: prop("MODE_ID", 111),
        ctm: prop("CTM", 112),
        out_fence_ptr: prop("OUT_FENCE_PTR", 113),
    };
    let planes = (0..planes)
        .map(|i| {
            let base = 200 + (i as u32) * 20;
            Arc::new(Plane {
                handle: from_u32::<plane::Handle>(40 + i as u32).unwrap(),
                kind: if i == 0 {
                    PlaneKind::Primary
                } else {
                    PlaneKind::Overlay
                },
                props: PlaneProperties {
                    crtc_id: prop("CRTC_ID", base),
                    fb_id: prop("FB_ID", base + 1),
                    crtc_x: prop("CRTC_X", base + 2),
                    crtc_y: prop("CRTC_Y", base + 3),
                    crtc_w: prop("CRTC_W", base + 4),
                    crtc_h: prop("CRTC_H", base + 5),
                    src_x: prop("SRC_X", base + 6),
                    src_y: prop("SRC_Y", base + 7),
                    src_w: prop("SRC_W", base + 8),
                    src_h: prop("SRC_H", base + 9),
                    zpos: prop("zpos", base + 10),
                    rotation: prop("rotation", base + 11),
                    alpha: prop("alpha", base + 12),
                    blend_mode: prop("pixel blend mode", base + 13).with_enums(vec![
                        ("None".to_string(), 0),
                        ("Pre-multiplied".to_string(), 1),
                        ("Coverage".to_string(), 2),
                    ]),
                },
            })
        })
        .collect();
    Pipeline {
        connector,
        crtc,
        planes,
    }
}

pub fn test_mode() -> DisplayMode {
    DisplayMode {
        name: "1920x1080".to_string(),
        clock: 148_500,
        hdisplay: 1920,
        hsync_start: 2008,
        hsync_end: 2052,
        htotal: 2200,
        vdisplay: 1080,
        vsync_start: 1084,
        vsync_end: 1089,
        vtotal: 1125,
        vrefresh: 60,
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCommit {
    pub request: AtomicRequest,
    pub flags: AtomicCommitFlags,
}

impl RecordedCommit {
    pub fn is_test_only(&self) -> bool {
        self.flags.contains(AtomicCommitFlags::TEST_ONLY)
    }

    pub fn is_nonblocking(&self) -> bool {
        self.flags.contains(AtomicCommitFlags::NONBLOCK)
    }
}

/// When the fences handed out by the fake signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    /// Already signaled when returned
    Signaled,
    /// Signaled only by `FakeBackend::signal_fences`
    Manual,
}

#[derive(Default)]
struct Inner {
    commits: Vec<RecordedCommit>,
    fail_commits: VecDeque<i32>,
    reject_blobs: bool,
    next_blob: u64,
    released_blobs: Vec<u64>,
    fence_senders: Vec<OwnedFd>,
    connector_writes: Vec<(connector::Handle, property::Handle, u64)>,
}

pub struct FakeBackend {
    inner: Arc<Mutex<Inner>>,
    fence_mode: FenceMode,
}

impl FakeBackend {
    pub fn new(fence_mode: FenceMode) -> Arc<Self> {
        let inner = Inner {
            next_blob: 1000,
            ..Default::default()
        };
        Arc::new(Self {
            inner: Arc::new(Mutex::new(inner)),
            fence_mode,
        })
    }

    /// Make the next submissions fail with these errno values, in order
    pub fn fail_next_commits(&self, errnos: &[i32]) {
        self.inner.lock().unwrap().fail_commits.extend(errnos);
    }

    pub fn reject_blobs(&self, reject: bool) {
        self.inner.lock().unwrap().reject_blobs = reject;
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.inner.lock().unwrap().commits.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.inner.lock().unwrap().commits.len()
    }

    pub fn last_commit(&self) -> Option<RecordedCommit> {
        self.inner.lock().unwrap().commits.last().cloned()
    }

    pub fn released_blobs(&self) -> Vec<u64> {
        self.inner.lock().unwrap().released_blobs.clone()
    }

    pub fn connector_writes(&self) -> Vec<(connector::Handle, property::Handle, u64)> {
        self.inner.lock().unwrap().connector_writes.clone()
    }

    /// Signal every fence handed out so far
    pub fn signal_fences(&self) {
        let senders: Vec<OwnedFd> = self.inner.lock().unwrap().fence_senders.drain(..).collect();
        for tx in senders {
            signal_pipe(&tx);
        }
    }

    fn make_blob(&self) -> Result<PropertyBlob, CommitError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reject_blobs {
            return Err(CommitError::invalid("blob rejected"));
        }
        let id = inner.next_blob;
        inner.next_blob += 1;
        let shared = self.inner.clone();
        Ok(PropertyBlob::new(id, move |id| {
            shared.lock().unwrap().released_blobs.push(id);
        }))
    }
}

fn signal_pipe(tx: &OwnedFd) {
    write(tx.as_raw_fd(), &[1u8]).expect("pipe write failed");
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC).expect("pipe2 failed");
    unsafe { (OwnedFd::from_raw_fd(rx), OwnedFd::from_raw_fd(tx)) }
}

impl KmsBackend for FakeBackend {
    fn create_mode_blob(&self, _mode: &DisplayMode) -> Result<PropertyBlob, CommitError> {
        self.make_blob()
    }

    fn create_ctm_blob(&self, _ctm: &ColorMatrix) -> Result<PropertyBlob, CommitError> {
        self.make_blob()
    }

    fn atomic_commit(
        &self,
        request: &AtomicRequest,
        flags: AtomicCommitFlags,
    ) -> Result<Option<CompletionFence>, CommitError> {
        let mut inner = self.inner.lock().unwrap();
        inner.commits.push(RecordedCommit {
            request: request.clone(),
            flags,
        });

        if let Some(errno) = inner.fail_commits.pop_front() {
            return Err(CommitError::Submission(io::Error::from_raw_os_error(errno)));
        }

        if flags.contains(AtomicCommitFlags::TEST_ONLY) || request.out_fence().is_none() {
            return Ok(None);
        }

        let (rx, tx) = pipe();
        match self.fence_mode {
            FenceMode::Signaled => signal_pipe(&tx),
            FenceMode::Manual => inner.fence_senders.push(tx),
        }
        Ok(Some(CompletionFence::new(rx)))
    }

    fn set_connector_property(
        &self,
        connector: connector::Handle,
        property: property::Handle,
        value: property::RawValue,
    ) -> Result<(), CommitError> {
        self.inner
            .lock()
            .unwrap()
            .connector_writes
            .push((connector, property, value));
        Ok(())
    }
}
