//! DRM hotplug detection
//!
//! Watches udev for DRM connector changes (monitor plug/unplug) and diffs
//! connector snapshots, so the caller only rescans pipelines when something
//! actually changed.

use anyhow::{Context, Result};
use log::{debug, info, warn};

use drm::control::{connector, Device as ControlDevice};

use super::device::connector_name;

/// Hotplug event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A connector state changed (connect/disconnect/mode change)
    ConnectorChanged,
}

/// udev-based hotplug monitor for the DRM subsystem
pub struct HotplugMonitor {
    socket: udev::MonitorSocket,
}

impl HotplugMonitor {
    pub fn new() -> Result<Self> {
        let socket = udev::MonitorBuilder::new()
            .context("Failed to create udev monitor builder")?
            .match_subsystem("drm")
            .context("Failed to match drm subsystem")?
            .listen()
            .context("Failed to start udev monitor")?;

        info!("DRM hotplug monitor initialized");
        Ok(Self { socket })
    }

    /// Drain pending udev events (non-blocking)
    ///
    /// Several queued events collapse into one `ConnectorChanged`.
    pub fn poll(&mut self) -> Option<HotplugEvent> {
        let mut result = None;
        for event in self.socket.iter() {
            let is_change = event.action().map(|a| a == "change").unwrap_or(false);
            let is_hotplug = event
                .property_value("HOTPLUG")
                .map(|v| v == "1")
                .unwrap_or(false);
            if is_change && is_hotplug {
                debug!("DRM hotplug event: {:?}", event.devpath().to_string_lossy());
                result = Some(HotplugEvent::ConnectorChanged);
            }
        }
        result
    }
}

/// Snapshot of connector state for comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSnapshot {
    pub handle: connector::Handle,
    pub name: String,
    pub connected: bool,
    pub mode_count: usize,
}

impl ConnectorSnapshot {
    pub fn from_info(handle: connector::Handle, info: &connector::Info) -> Self {
        Self {
            handle,
            name: connector_name(info),
            connected: info.state() == connector::State::Connected,
            mode_count: info.modes().len(),
        }
    }
}

/// Take a snapshot of all connector states
pub fn snapshot_connectors(device: &impl ControlDevice) -> Result<Vec<ConnectorSnapshot>> {
    let resources = device
        .resource_handles()
        .context("Failed to get DRM resources")?;

    let mut snapshots = Vec::new();
    for &handle in resources.connectors() {
        match device.get_connector(handle, false) {
            Ok(info) => snapshots.push(ConnectorSnapshot::from_info(handle, &info)),
            Err(e) => debug!("Failed to get connector {:?}: {}", handle, e),
        }
    }

    Ok(snapshots)
}

/// Detect changes between two connector snapshots
pub fn detect_changes(old: &[ConnectorSnapshot], new: &[ConnectorSnapshot]) -> ConnectorChanges {
    let mut changes = ConnectorChanges::default();

    for new_conn in new {
        match old.iter().find(|c| c.handle == new_conn.handle) {
            Some(old_conn) => {
                if !old_conn.connected && new_conn.connected {
                    changes.connected.push(new_conn.clone());
                } else if old_conn.connected && !new_conn.connected {
                    changes.disconnected.push(old_conn.clone());
                } else if new_conn.connected && old_conn.mode_count != new_conn.mode_count {
                    changes.mode_changed.push(new_conn.handle);
                }
            }
            // New connector appeared (DP MST, USB DisplayLink)
            None if new_conn.connected => changes.connected.push(new_conn.clone()),
            None => {}
        }
    }

    // Connector objects that went away
    for old_conn in old {
        if old_conn.connected && !new.iter().any(|c| c.handle == old_conn.handle) {
            changes.disconnected.push(old_conn.clone());
        }
    }

    changes
}

/// Summary of connector state changes
#[derive(Debug, Default)]
pub struct ConnectorChanges {
    pub connected: Vec<ConnectorSnapshot>,
    pub disconnected: Vec<ConnectorSnapshot>,
    /// Connectors whose mode list changed
    pub mode_changed: Vec<connector::Handle>,
}

impl ConnectorChanges {
    pub fn has_changes(&self) -> bool {
        !self.connected.is_empty() || !self.disconnected.is_empty() || !self.mode_changed.is_empty()
    }

    pub fn log(&self) {
        for snap in &self.connected {
            info!("Monitor connected: {}", snap.name);
        }
        for snap in &self.disconnected {
            warn!("Monitor disconnected: {}", snap.name);
        }
        for handle in &self.mode_changed {
            info!("Monitor mode changed: {:?}", handle);
        }
    }
}
