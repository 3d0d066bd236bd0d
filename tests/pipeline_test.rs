//! End-to-end commit flow through the public API
//!
//! `ModelKms` applies every submitted write to an in-memory property table,
//! so the tests can check what the "hardware" scans out after a sequence of
//! commits, and which blobs are still alive.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drm::control::{
    connector, crtc, framebuffer, from_u32, plane, property, AtomicCommitFlags,
};
use kmscommit::kms::{
    AtomicRequest, ColorMatrix, CommitError, CommitRequest, CompletionFence, CompositionPlan,
    Connector, Crtc, DisplayMode, DrmProperty, Framebuffer, KmsBackend, LayerData, ManagerOptions,
    Pipeline, Plane, PlaneKind, PlaneProperties, PropertyBlob, ResourceManager,
};
use nix::fcntl::OFlag;
use nix::unistd::{pipe2, write};

#[derive(Default)]
struct Model {
    props: HashMap<(u32, u32), u64>,
    live_blobs: BTreeSet<u64>,
    next_blob: u64,
    reject_next: Option<i32>,
}

struct ModelKms {
    model: Arc<Mutex<Model>>,
}

impl ModelKms {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            model: Arc::new(Mutex::new(Model {
                next_blob: 500,
                ..Default::default()
            })),
        })
    }

    fn value<H: Into<u32>>(&self, object: H, prop: u32) -> Option<u64> {
        self.model
            .lock()
            .unwrap()
            .props
            .get(&(object.into(), prop))
            .copied()
    }

    fn live_blobs(&self) -> Vec<u64> {
        self.model.lock().unwrap().live_blobs.iter().copied().collect()
    }

    fn blob(&self) -> Result<PropertyBlob, CommitError> {
        let mut m = self.model.lock().unwrap();
        m.next_blob += 1;
        let id = m.next_blob;
        m.live_blobs.insert(id);
        let model = self.model.clone();
        Ok(PropertyBlob::new(id, move |id| {
            model.lock().unwrap().live_blobs.remove(&id);
        }))
    }
}

fn signaled_fence() -> CompletionFence {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
    let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(rx), OwnedFd::from_raw_fd(tx)) };
    write(tx.as_raw_fd(), &[1u8]).unwrap();
    CompletionFence::new(rx)
}

impl KmsBackend for ModelKms {
    fn create_mode_blob(&self, _mode: &DisplayMode) -> Result<PropertyBlob, CommitError> {
        self.blob()
    }

    fn create_ctm_blob(&self, _ctm: &ColorMatrix) -> Result<PropertyBlob, CommitError> {
        self.blob()
    }

    fn atomic_commit(
        &self,
        request: &AtomicRequest,
        flags: AtomicCommitFlags,
    ) -> Result<Option<CompletionFence>, CommitError> {
        let mut m = self.model.lock().unwrap();
        if let Some(errno) = m.reject_next.take() {
            return Err(CommitError::Submission(io::Error::from_raw_os_error(errno)));
        }
        if flags.contains(AtomicCommitFlags::TEST_ONLY) {
            return Ok(None);
        }
        for w in request.writes() {
            let object: u32 = w.object.get();
            m.props.insert((object, u32::from(w.property)), w.value);
        }
        Ok(request.out_fence().map(|_| signaled_fence()))
    }

    fn set_connector_property(
        &self,
        connector: connector::Handle,
        property: property::Handle,
        value: property::RawValue,
    ) -> Result<(), CommitError> {
        self.model
            .lock()
            .unwrap()
            .props
            .insert((connector.into(), property.into()), value);
        Ok(())
    }
}

#[derive(Debug)]
struct StaticFb(framebuffer::Handle);

impl Framebuffer for StaticFb {
    fn handle(&self) -> framebuffer::Handle {
        self.0
    }
}

fn fb(id: u32) -> Arc<dyn Framebuffer> {
    Arc::new(StaticFb(from_u32(id).unwrap()))
}

fn prop(name: &str, id: u32) -> DrmProperty {
    DrmProperty::new(name, from_u32(id).unwrap())
}

// Property ids
const CRTC_ACTIVE: u32 = 1;
const CRTC_MODE_ID: u32 = 2;
const PLANE_CRTC_ID: u32 = 10;
const PLANE_FB_ID: u32 = 11;

fn pipeline(connector_id: u32, crtc_id: u32, plane_ids: &[u32]) -> Pipeline {
    Pipeline {
        connector: Connector {
            handle: from_u32::<connector::Handle>(connector_id).unwrap(),
            name: format!("DP-{}", connector_id),
            internal: false,
            crtc_id: prop("CRTC_ID", 3),
            dpms: prop("DPMS", 4),
        },
        crtc: Crtc {
            handle: from_u32::<crtc::Handle>(crtc_id).unwrap(),
            active: prop("ACTIVE", CRTC_ACTIVE),
            mode_id: prop("MODE_ID", CRTC_MODE_ID),
            ctm: DrmProperty::missing("CTM"),
            out_fence_ptr: prop("OUT_FENCE_PTR", 5),
        },
        planes: plane_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                Arc::new(Plane {
                    handle: from_u32::<plane::Handle>(id).unwrap(),
                    kind: if i == 0 {
                        PlaneKind::Primary
                    } else {
                        PlaneKind::Overlay
                    },
                    props: PlaneProperties {
                        crtc_id: prop("CRTC_ID", PLANE_CRTC_ID),
                        fb_id: prop("FB_ID", PLANE_FB_ID),
                        crtc_x: prop("CRTC_X", 12),
                        crtc_y: prop("CRTC_Y", 13),
                        crtc_w: prop("CRTC_W", 14),
                        crtc_h: prop("CRTC_H", 15),
                        src_x: prop("SRC_X", 16),
                        src_y: prop("SRC_Y", 17),
                        src_w: prop("SRC_W", 18),
                        src_h: prop("SRC_H", 19),
                        ..Default::default()
                    },
                })
            })
            .collect(),
    }
}

fn mode() -> DisplayMode {
    DisplayMode {
        name: "1280x720".to_string(),
        clock: 74_250,
        hdisplay: 1280,
        vdisplay: 720,
        vrefresh: 60,
        ..Default::default()
    }
}

fn layer_on(p: &Pipeline, planes: &[usize], fb_id: u32) -> CompositionPlan {
    let mut plan = CompositionPlan::new();
    for (z, &i) in planes.iter().enumerate() {
        plan.push(
            p.planes[i].clone(),
            LayerData::fullscreen(fb(fb_id + z as u32), 1280, 720),
            z as u32,
        );
    }
    plan
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn modeset_flip_and_blank() {
    let kms = ModelKms::new();
    let rm = ResourceManager::new(kms.clone(), ManagerOptions::default());
    let p = pipeline(70, 80, &[90, 91]);
    let mgr = rm.attach(p.clone()).unwrap();

    mgr.execute_atomic_commit(CommitRequest {
        active: Some(true),
        display_mode: Some(mode()),
        composition: Some(layer_on(&p, &[0, 1], 1000)),
        ..Default::default()
    })
    .unwrap();

    assert_eq!(kms.value(p.crtc.handle, CRTC_ACTIVE), Some(1));
    let mode_blob = kms.value(p.crtc.handle, CRTC_MODE_ID).unwrap();
    assert_eq!(kms.live_blobs(), vec![mode_blob]);
    assert_eq!(kms.value(p.planes[1].handle, PLANE_FB_ID), Some(1001));

    // Flip onto the primary only: the overlay must be switched off
    for frame in 0..5 {
        mgr.execute_atomic_commit(CommitRequest {
            composition: Some(layer_on(&p, &[0], 2000 + frame)),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            kms.value(p.planes[0].handle, PLANE_FB_ID),
            Some(2000 + frame as u64)
        );
    }
    assert_eq!(kms.value(p.planes[1].handle, PLANE_FB_ID), Some(0));
    assert_eq!(kms.value(p.planes[1].handle, PLANE_CRTC_ID), Some(0));

    assert!(wait_until(|| mgr.frame_counters().pending() == 0));
    assert_eq!(mgr.frame_counters().staged, 5);

    // Mode blobs are not carried into later frames
    assert!(kms.live_blobs().is_empty());

    mgr.commit_frame(CommitRequest {
        active: Some(false),
        ..CommitRequest::blank()
    })
    .unwrap();
    assert_eq!(kms.value(p.crtc.handle, CRTC_ACTIVE), Some(0));
    assert_eq!(kms.value(p.planes[0].handle, PLANE_FB_ID), Some(0));
    assert!(!mgr.active_state().active);
}

#[test]
fn rejected_frame_blanks_and_keeps_error() {
    let kms = ModelKms::new();
    let rm = ResourceManager::new(kms.clone(), ManagerOptions::default());
    let p = pipeline(70, 80, &[90]);
    let mgr = rm.attach(p.clone()).unwrap();

    mgr.execute_atomic_commit(CommitRequest {
        active: Some(true),
        composition: Some(layer_on(&p, &[0], 3000)),
        ..Default::default()
    })
    .unwrap();
    assert!(wait_until(|| mgr.frame_counters().pending() == 0));

    kms.model.lock().unwrap().reject_next = Some(libc::EBUSY);
    let err = mgr
        .execute_atomic_commit(CommitRequest {
            composition: Some(layer_on(&p, &[0], 4000)),
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err.errno(), -libc::EBUSY);

    // The clean-up commit went through and turned the plane off
    assert_eq!(kms.value(p.planes[0].handle, PLANE_FB_ID), Some(0));
}

#[test]
fn test_only_leaves_hardware_alone() {
    let kms = ModelKms::new();
    let rm = ResourceManager::new(kms.clone(), ManagerOptions::default());
    let p = pipeline(70, 80, &[90]);
    let mgr = rm.attach(p.clone()).unwrap();

    let fence = mgr
        .commit_frame(CommitRequest {
            active: Some(true),
            display_mode: Some(mode()),
            composition: Some(layer_on(&p, &[0], 5000)),
            test_only: true,
            ..Default::default()
        })
        .unwrap();
    assert!(fence.is_none());
    assert_eq!(kms.value(p.crtc.handle, CRTC_ACTIVE), None);
    assert_eq!(mgr.frame_counters().staged, 0);
    // The dry run's mode blob is released with its state
    assert!(kms.live_blobs().is_empty());
}

#[test]
fn pipelines_are_independent() {
    let kms = ModelKms::new();
    let rm = ResourceManager::new(kms.clone(), ManagerOptions::default());
    let a = pipeline(70, 80, &[90]);
    let b = pipeline(71, 81, &[92]);
    let changes = rm.update_pipelines(vec![a.clone(), b.clone()]);
    assert_eq!(changes.attached.len(), 2);

    let ma = rm.get(a.connector.handle).unwrap();
    let mb = rm.get(b.connector.handle).unwrap();
    ma.commit_frame(CommitRequest {
        active: Some(true),
        composition: Some(layer_on(&a, &[0], 6000)),
        ..Default::default()
    })
    .unwrap();

    assert_eq!(kms.value(a.crtc.handle, CRTC_ACTIVE), Some(1));
    assert_eq!(kms.value(b.crtc.handle, CRTC_ACTIVE), None);
    assert!(!mb.active_state().active);

    drop(ma);
    drop(mb);
    let changes = rm.update_pipelines(vec![b]);
    assert_eq!(changes.detached, vec![a.connector.handle]);
    assert_eq!(rm.pipelines().len(), 1);
}
