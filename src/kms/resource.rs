//! Device-wide resources: the pipeline-wide lock and attached pipelines

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use drm::control::connector;
use log::{info, warn};

use super::backend::KmsBackend;
use super::manager::{AtomicStateManager, ManagerOptions};
use super::object::Pipeline;

/// Lock shared by every pipeline of a device.
///
/// Guards resource release that may touch objects other pipelines also
/// reference. Always taken before any manager's own lock, never after.
#[derive(Clone, Default)]
pub struct MainLock(Arc<Mutex<()>>);

impl MainLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock only if nobody holds it
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match self.0.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Result of reconciling attached pipelines with connected ones
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PipelineChanges {
    pub attached: Vec<connector::Handle>,
    pub detached: Vec<connector::Handle>,
}

impl PipelineChanges {
    pub fn has_changes(&self) -> bool {
        !self.attached.is_empty() || !self.detached.is_empty()
    }
}

/// Owns one manager per connected pipeline of a device
pub struct ResourceManager {
    main_lock: MainLock,
    backend: Arc<dyn KmsBackend>,
    options: ManagerOptions,
    attached: Mutex<Vec<Arc<AtomicStateManager>>>,
}

impl ResourceManager {
    pub fn new(backend: Arc<dyn KmsBackend>, options: ManagerOptions) -> Self {
        Self {
            main_lock: MainLock::new(),
            backend,
            options,
            attached: Mutex::new(Vec::new()),
        }
    }

    fn lock_attached(&self) -> MutexGuard<'_, Vec<Arc<AtomicStateManager>>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attached managers, internal panels first so they take the primary slot
    pub fn pipelines(&self) -> Vec<Arc<AtomicStateManager>> {
        let attached = self.lock_attached();
        let internal = attached.iter().filter(|m| m.pipeline().connector.internal);
        let external = attached.iter().filter(|m| !m.pipeline().connector.internal);
        internal.chain(external).cloned().collect()
    }

    pub fn get(&self, connector: connector::Handle) -> Option<Arc<AtomicStateManager>> {
        self.lock_attached()
            .iter()
            .find(|m| m.pipeline().connector.handle == connector)
            .cloned()
    }

    /// Bind a manager to `pipeline`, or return the one already bound to its
    /// connector
    pub fn attach(&self, pipeline: Pipeline) -> std::io::Result<Arc<AtomicStateManager>> {
        let _main = self.main_lock.lock();
        let mut attached = self.lock_attached();

        if let Some(existing) = attached
            .iter()
            .find(|m| m.pipeline().connector.handle == pipeline.connector.handle)
        {
            return Ok(existing.clone());
        }

        info!("Attaching connector {}", pipeline.name());
        let manager = Arc::new(AtomicStateManager::create(
            pipeline,
            self.backend.clone(),
            self.main_lock.clone(),
            self.options,
        )?);
        attached.push(manager.clone());
        Ok(manager)
    }

    /// Unbind the manager of `connector`.
    ///
    /// The manager joins its worker when the last reference goes away.
    pub fn detach(&self, connector: connector::Handle) -> bool {
        let removed = {
            let _main = self.main_lock.lock();
            let mut attached = self.lock_attached();
            let pos = attached
                .iter()
                .position(|m| m.pipeline().connector.handle == connector);
            pos.map(|i| attached.remove(i))
        };

        match removed {
            Some(manager) => {
                info!("Detaching connector {}", manager.pipeline().name());
                drop(manager);
                true
            }
            None => false,
        }
    }

    /// Attach newly connected pipelines and detach those that disappeared
    pub fn update_pipelines(&self, connected: Vec<Pipeline>) -> PipelineChanges {
        let mut changes = PipelineChanges::default();

        let stale: Vec<connector::Handle> = self
            .lock_attached()
            .iter()
            .map(|m| m.pipeline().connector.handle)
            .filter(|h| !connected.iter().any(|p| p.connector.handle == *h))
            .collect();
        for handle in stale {
            if self.detach(handle) {
                changes.detached.push(handle);
            }
        }

        let (internal, external): (Vec<Pipeline>, Vec<Pipeline>) =
            connected.into_iter().partition(|p| p.connector.internal);
        for pipeline in internal.into_iter().chain(external) {
            let handle = pipeline.connector.handle;
            if self.get(handle).is_some() {
                continue;
            }
            match self.attach(pipeline) {
                Ok(_) => changes.attached.push(handle),
                Err(e) => warn!("Failed to attach pipeline {:?}: {}", handle, e),
            }
        }

        changes
    }

    pub fn detach_all(&self) {
        let all: Vec<Arc<AtomicStateManager>> = {
            let _main = self.main_lock.lock();
            self.lock_attached().drain(..).collect()
        };
        if !all.is_empty() {
            info!("Detaching {} pipeline(s)", all.len());
        }
        drop(all);
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.detach_all();
    }
}
