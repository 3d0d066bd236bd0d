//! Atomic state manager
//!
//! Owns the active and staged frame states of one pipeline, builds and submits
//! atomic transactions, and retires staged state once its completion fence
//! signals. A dedicated worker thread performs the retirement in the
//! background; the commit path does it itself when it gets there first.
//!
//! Lock order is always `MainLock` (pipeline-wide) before the manager's own
//! state lock. Neither lock is held across a fence wait.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use drm::control::AtomicCommitFlags;
use log::{debug, error, info, trace, warn};

use super::backend::KmsBackend;
use super::error::CommitError;
use super::fence::CompletionFence;
use super::object::{Pipeline, Plane};
use super::request::CommitRequest;
use super::resource::MainLock;
use super::state::{FrameState, FrameSummary, PlaneBinding};
use super::transaction::AtomicRequest;
use crate::constants::{DEFAULT_FENCE_TIMEOUT_MS, DRM_MODE_DPMS_ON};

/// Poll interval of the worker while another thread holds the main lock
const MAIN_LOCK_RETRY: Duration = Duration::from_millis(1);

/// Tunables for one manager
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Upper bound on any single fence wait
    pub fence_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            fence_timeout: Duration::from_millis(DEFAULT_FENCE_TIMEOUT_MS),
        }
    }
}

/// Commit generation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounters {
    pub staged: u64,
    pub tracked: u64,
}

impl FrameCounters {
    /// Number of staged frames awaiting retirement (0 or 1)
    pub fn pending(&self) -> u64 {
        self.staged - self.tracked
    }
}

/// State shared between the commit path and the worker
#[derive(Debug, Default)]
struct FrameStates {
    active: FrameState,
    staged: Option<FrameState>,
    last_present_fence: Option<CompletionFence>,
    frames_staged: u64,
    frames_tracked: u64,
    exit_thread: bool,
}

impl FrameStates {
    /// Most recent state submitted to hardware
    fn latest(&self) -> &FrameState {
        self.staged.as_ref().unwrap_or(&self.active)
    }

    /// Promote the staged state to active, releasing the previous active one.
    ///
    /// No-op when nothing is staged, so the worker and the commit path may
    /// race on it. Returns whether a retirement happened.
    fn retire_prior_frame(&mut self) -> bool {
        if self.frames_staged == self.frames_tracked {
            return false;
        }
        debug_assert_eq!(self.frames_staged - self.frames_tracked, 1);
        debug_assert!(self.last_present_fence.is_some());

        let Some(staged) = self.staged.take() else {
            warn!(
                "Staged counter ahead ({} > {}) without a staged frame",
                self.frames_staged, self.frames_tracked
            );
            self.frames_tracked = self.frames_staged;
            return false;
        };

        self.frames_tracked += 1;
        let previous = mem::replace(&mut self.active, staged);
        self.last_present_fence = None;
        drop(previous);
        trace!("Retired frame generation {}", self.frames_tracked);
        true
    }
}

struct Shared {
    pipeline: Pipeline,
    backend: Arc<dyn KmsBackend>,
    main_lock: MainLock,
    options: ManagerOptions,
    states: Mutex<FrameStates>,
    staged_cv: Condvar,
    /// Serializes commit attempts on this pipeline
    commit_lock: Mutex<()>,
}

impl Shared {
    fn lock_states(&self) -> MutexGuard<'_, FrameStates> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_fence(&self, fence: &CompletionFence, what: &str) {
        if let Err(e) = fence.wait(self.options.fence_timeout) {
            error!(
                "{}: fence wait (fd={}) on {} failed: {}",
                what,
                fence.as_raw_fd(),
                self.pipeline.name(),
                e
            );
        }
    }

    /// Retire under both locks, global first
    fn retire_locked(&self) -> bool {
        let _main = self.main_lock.lock();
        let mut states = self.lock_states();
        states.retire_prior_frame()
    }

    /// Main lock for the worker, or `None` once shutdown was requested.
    ///
    /// The last owner may drop the manager while holding the main lock, and
    /// that drop joins the worker, so the worker never blocks on it.
    fn worker_main_lock(&self) -> Option<MutexGuard<'_, ()>> {
        loop {
            if self.lock_states().exit_thread {
                return None;
            }
            if let Some(guard) = self.main_lock.try_lock() {
                return Some(guard);
            }
            thread::sleep(MAIN_LOCK_RETRY);
        }
    }
}

/// Fence-gated commit manager for one pipeline
pub struct AtomicStateManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl AtomicStateManager {
    /// Bind a manager to `pipeline` and start its retirement worker
    pub fn create(
        pipeline: Pipeline,
        backend: Arc<dyn KmsBackend>,
        main_lock: MainLock,
        options: ManagerOptions,
    ) -> std::io::Result<Self> {
        let name = pipeline.name().to_string();
        let shared = Arc::new(Shared {
            pipeline,
            backend,
            main_lock,
            options,
            states: Mutex::new(FrameStates::default()),
            staged_cv: Condvar::new(),
            commit_lock: Mutex::new(()),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(format!("kms-retire-{}", name))
            .spawn(move || retirement_worker(worker_shared))?;

        info!(
            "Atomic state manager created for {} (fence timeout {} ms)",
            name,
            options.fence_timeout.as_millis()
        );

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.shared.pipeline
    }

    pub fn frame_counters(&self) -> FrameCounters {
        let states = self.shared.lock_states();
        FrameCounters {
            staged: states.frames_staged,
            tracked: states.frames_tracked,
        }
    }

    pub fn active_state(&self) -> FrameSummary {
        self.shared.lock_states().active.summary()
    }

    pub fn staged_state(&self) -> Option<FrameSummary> {
        self.shared.lock_states().staged.as_ref().map(FrameState::summary)
    }

    /// Fence of the outstanding non-blocking commit, if any
    pub fn pending_fence(&self) -> Option<CompletionFence> {
        self.shared.lock_states().last_present_fence.clone()
    }

    /// Apply `request` to the hardware.
    ///
    /// Returns the out-fence of a real submission, `None` for test-only
    /// requests and for requests that turned out to change nothing. On error
    /// nothing has been applied and no state was mutated.
    ///
    /// When the output is inactive, activation is forced into the request
    /// whatever else it asks for: nothing else can be applied to a dark
    /// CRTC, and callers rely on any commit powering the output up.
    pub fn commit_frame(
        &self,
        mut request: CommitRequest,
    ) -> Result<Option<CompletionFence>, CommitError> {
        let shared = &*self.shared;
        let _serial = shared
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (currently_active, mut new_state) = {
            let states = shared.lock_states();
            let latest = states.latest();
            (latest.active, latest.derive())
        };

        if request.active == Some(currently_active) {
            // Don't set the same state twice
            request.active = None;
        }

        if !request.has_inputs() {
            return Ok(None);
        }

        if !currently_active {
            request.active = Some(true);
        }

        let pipe = &shared.pipeline;
        let crtc = &pipe.crtc;
        let connector = &pipe.connector;

        let mut req = AtomicRequest::try_new().map_err(|e| {
            error!("Failed to allocate atomic request for {}", pipe.name());
            e
        })?;

        let out_fence_prop = crtc
            .out_fence_ptr
            .id()
            .ok_or_else(|| CommitError::invalid("CRTC has no OUT_FENCE_PTR"))?;
        req.request_out_fence(crtc.handle, out_fence_prop);

        let mut nonblock = true;

        if let Some(active) = request.active {
            nonblock = false;
            new_state.active = active;
            crtc.active.atomic_set(&mut req, crtc.handle, active as u64)?;
            connector
                .crtc_id
                .atomic_set(&mut req, connector.handle, u32::from(crtc.handle) as u64)?;
        }

        if let Some(mode) = &request.display_mode {
            nonblock = false;
            let blob = shared.backend.create_mode_blob(mode).map_err(|e| {
                error!("Failed to create mode blob: {}", e);
                e
            })?;
            crtc.mode_id.atomic_set(&mut req, crtc.handle, blob.id())?;
            new_state.mode_blob = Some(blob);
        }

        if let Some(ctm) = &request.color_matrix {
            if crtc.ctm.is_present() {
                let blob = shared.backend.create_ctm_blob(ctm).map_err(|e| {
                    error!("Failed to create CTM blob: {}", e);
                    e
                })?;
                crtc.ctm.atomic_set(&mut req, crtc.handle, blob.id())?;
                new_state.ctm_blob = Some(blob);
            } else {
                debug!("{}: CTM not supported, color matrix ignored", pipe.name());
            }
        }

        if let Some(plan) = &request.composition {
            let mut unused_planes: Vec<Arc<Plane>> = new_state.bound_planes().cloned().collect();
            new_state.bindings.clear();

            let mut most_bottom = true;
            for joining in &plan.entries {
                new_state.bindings.push(PlaneBinding {
                    plane: joining.plane.clone(),
                    framebuffer: joining.layer.framebuffer.clone(),
                    zpos: joining.z_pos,
                });
                // Plane is re-used
                unused_planes.retain(|p| p.handle != joining.plane.handle);

                joining.plane.atomic_set_state(
                    &mut req,
                    &joining.layer,
                    joining.z_pos,
                    crtc.handle,
                    most_bottom,
                )?;
                most_bottom = false;
            }

            for plane in &unused_planes {
                plane.atomic_disable(&mut req)?;
            }
        }

        let mut flags = AtomicCommitFlags::ALLOW_MODESET;

        if request.test_only {
            return shared
                .backend
                .atomic_commit(&req, flags | AtomicCommitFlags::TEST_ONLY)
                .map(|_| None);
        }

        let prior_fence = shared.lock_states().last_present_fence.clone();
        if let Some(fence) = prior_fence {
            shared.wait_fence(&fence, "WaitPriorFramePresented");
            shared.retire_locked();
        }

        if nonblock {
            flags |= AtomicCommitFlags::NONBLOCK;
        }

        let out_fence = shared.backend.atomic_commit(&req, flags).map_err(|e| {
            error!("Failed to commit pipeline {}: {}", pipe.name(), e);
            e
        })?;

        if nonblock {
            if let Some(fence) = out_fence.clone() {
                {
                    let mut states = shared.lock_states();
                    states.last_present_fence = Some(fence);
                    states.staged = Some(new_state);
                    states.frames_staged += 1;
                }
                shared.staged_cv.notify_all();
                return Ok(out_fence);
            }
            warn!(
                "{}: non-blocking commit returned no out-fence, treating as applied",
                pipe.name()
            );
        }

        let previous = {
            let _main = shared.main_lock.lock();
            let mut states = shared.lock_states();
            mem::replace(&mut states.active, new_state)
        };
        drop(previous);

        Ok(out_fence)
    }

    /// `commit_frame`, blanking the composition when a real commit fails.
    ///
    /// Disabling every plane lets the kernel signal the release fences of
    /// the previous composition so their consumers don't hang. The original
    /// error is returned whatever happens to the blanking commit.
    pub fn execute_atomic_commit(
        &self,
        request: CommitRequest,
    ) -> Result<Option<CompletionFence>, CommitError> {
        let test_only = request.test_only;
        let result = self.commit_frame(request);

        if let Err(err) = &result {
            if !test_only {
                error!("Composite failed for pipeline {}: {}", self.pipeline().name(), err);
                if let Err(e) = self.commit_frame(CommitRequest::blank()) {
                    error!(
                        "Failed to clean-up active composition for pipeline {}: {}",
                        self.pipeline().name(),
                        e
                    );
                }
            }
        }

        result
    }

    /// Force the connector on through the legacy DPMS property.
    ///
    /// Bypasses the atomic state entirely.
    pub fn activate_using_legacy_path(&self) -> Result<(), CommitError> {
        let connector = &self.shared.pipeline.connector;
        let dpms = connector
            .dpms
            .id()
            .ok_or_else(|| CommitError::invalid("connector has no DPMS property"))?;
        self.shared
            .backend
            .set_connector_property(connector.handle, dpms, DRM_MODE_DPMS_ON)
    }
}

impl Drop for AtomicStateManager {
    fn drop(&mut self) {
        {
            let mut states = self.shared.lock_states();
            states.exit_thread = true;
        }
        self.shared.staged_cv.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Retirement worker for {} panicked", self.shared.pipeline.name());
            }
        }
    }
}

fn retirement_worker(shared: Arc<Shared>) {
    let mut tracking_at_the_moment: u64 = 0;

    loop {
        let present_fence = {
            let mut states = shared.lock_states();
            while !states.exit_thread && states.frames_staged <= tracking_at_the_moment {
                states = shared
                    .staged_cv
                    .wait(states)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            if states.exit_thread || Arc::strong_count(&shared) == 1 {
                break;
            }

            tracking_at_the_moment = states.frames_staged;

            match states.last_present_fence.clone() {
                Some(fence) => fence,
                None => continue,
            }
        };

        shared.wait_fence(&present_fence, "AsyncWaitForBuffersSwap");

        {
            let Some(_main) = shared.worker_main_lock() else {
                break;
            };
            let mut states = shared.lock_states();
            if states.exit_thread {
                break;
            }

            // The commit path may have retired it already
            if tracking_at_the_moment > states.frames_tracked {
                states.retire_prior_frame();
            }
        }
    }

    info!("Retirement worker for {} exiting", shared.pipeline.name());
}
