//! kmscommit - fence-gated atomic KMS commits
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Demo flip loop (this file)        │
//! │     udev hotplug → pipeline rescans      │
//! ├──────────────────────────────────────────┤
//! │  ResourceManager  →  AtomicStateManager  │
//! │                          ↓               │
//! │                     KmsBackend           │
//! │                          ↓               │
//! │              DRM/KMS Output              │
//! └──────────────────────────────────────────┘
//! ```

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kmscommit::config::Config;
#[cfg(target_os = "linux")]
use kmscommit::drm::hotplug::{detect_changes, snapshot_connectors};
#[cfg(target_os = "linux")]
use kmscommit::drm::{ConnectorSnapshot, HotplugMonitor};
use kmscommit::drm::{preferred_mode, Device, DrmBackend, DumbFramebuffer};
use kmscommit::kms::{
    AtomicStateManager, CommitRequest, CompositionPlan, Framebuffer, LayerData, ResourceManager,
};

/// Colors alternated by the flip loop (XRGB8888)
const FRAME_COLORS: [u32; 2] = [0x0020_4080, 0x0080_4020];

// ============================================================================
// Signal handling
// ============================================================================

/// Global flag for shutdown requested via signal (SIGTERM/SIGINT/SIGHUP)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Set up signal handlers for graceful shutdown (call once at startup)
///
/// The display is blanked on the way out, so the loop must not be killed
/// mid-frame.
fn setup_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGHUP,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
    }
}

extern "C" fn shutdown_signal_handler(_signo: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

// ============================================================================
// Devices
// ============================================================================

/// One opened DRM node and the pipelines attached on it
struct Card {
    path: PathBuf,
    device: Arc<Device>,
    resources: ResourceManager,
}

impl Card {
    fn open(path: PathBuf, cfg: &Config) -> Result<Self> {
        let device = Arc::new(Device::open(&path)?);
        if let Err(e) = device.set_master() {
            // First opener is master already; anything else fails at commit time
            warn!("{}: {:#}", path.display(), e);
        }
        let backend = Arc::new(DrmBackend::new(device.clone()));
        let resources = ResourceManager::new(backend, cfg.commit.manager_options());
        Ok(Self {
            path,
            device,
            resources,
        })
    }

    /// Attach and detach pipelines to match connected connectors
    fn rescan(&self, prefer_external: bool) {
        let changes = self
            .resources
            .update_pipelines(self.device.discover_pipelines(prefer_external));
        if changes.has_changes() {
            info!(
                "{}: {} pipeline(s) attached, {} detached",
                self.path.display(),
                changes.attached.len(),
                changes.detached.len()
            );
        }
    }

    /// Detach every pipeline and give up DRM master
    fn shutdown(&self) {
        self.resources.detach_all();
        if let Err(e) = self.device.drop_master() {
            warn!("{}: {:#}", self.path.display(), e);
        }
    }
}

/// Open every configured device node; nodes that fail to open are skipped
fn open_cards(cfg: &Config) -> Result<Vec<Card>> {
    let mut cards = Vec::new();
    for path in cfg.device.device_paths() {
        match Card::open(path, cfg) {
            Ok(card) => cards.push(card),
            Err(e) => warn!("{:#}", e),
        }
    }
    if cards.is_empty() {
        bail!("No DRM device could be opened ({})", cfg.device.path);
    }
    Ok(cards)
}

/// Preferred connector of the first device that has one attached
fn select_pipeline(
    cards: &[Card],
    prefer_external: bool,
) -> Option<(usize, Arc<AtomicStateManager>)> {
    cards.iter().enumerate().find_map(|(idx, card)| {
        let preferred = card
            .device
            .find_preferred_connector(prefer_external)
            .ok()
            .and_then(|(connector, _)| card.resources.get(connector));
        preferred
            .or_else(|| card.resources.pipelines().into_iter().next())
            .map(|manager| (idx, manager))
    })
}

// ============================================================================
// Hotplug
// ============================================================================

/// Rescans pipelines when udev reports a connector change
#[cfg(target_os = "linux")]
struct HotplugWatch {
    monitor: HotplugMonitor,
    /// Last connector snapshot, per card
    snapshots: Vec<Vec<ConnectorSnapshot>>,
}

#[cfg(target_os = "linux")]
impl HotplugWatch {
    fn new(cards: &[Card]) -> Option<Self> {
        let monitor = match HotplugMonitor::new() {
            Ok(m) => m,
            Err(e) => {
                info!("Hotplug monitor unavailable: {:#}", e);
                return None;
            }
        };
        let snapshots = cards
            .iter()
            .map(|card| snapshot_connectors(&*card.device).unwrap_or_default())
            .collect();
        Some(Self { monitor, snapshots })
    }

    fn process(&mut self, cards: &[Card], prefer_external: bool) {
        if self.monitor.poll().is_none() {
            return;
        }
        for (card, last) in cards.iter().zip(self.snapshots.iter_mut()) {
            let current = match snapshot_connectors(&*card.device) {
                Ok(current) => current,
                Err(e) => {
                    warn!("{}: {:#}", card.path.display(), e);
                    continue;
                }
            };
            let changes = detect_changes(last, &current);
            *last = current;
            if changes.has_changes() {
                changes.log();
                card.rescan(prefer_external);
            }
        }
    }
}

// ============================================================================
// Command line
// ============================================================================

fn print_help() {
    println!(
        r#"kmscommit {} - fence-gated atomic KMS commit demo

USAGE:
    kmscommit [OPTIONS]

OPTIONS:
    -h, --help              Print this help message
    -V, --version           Print version information
    -d, --device PATH       DRM device node, or pattern ending in % (default: /dev/dri/card%)
    -n, --frames N          Number of page flips before blanking
    -t, --test-only         Validate the modeset without applying it
    --dpms                  Force the connector on via legacy DPMS first
    --init-config           Generate the default config file
    -f, --force             Overwrite an existing config file

EXAMPLES:
    sudo kmscommit                    Flip two colors on the preferred display
    sudo kmscommit -n 600             Run for ~10 seconds at 60Hz
    sudo kmscommit --test-only        Check the modeset only
    RUST_LOG=debug kmscommit          Log every commit

CONFIG FILE:
    ~/.config/kmscommit/config.toml (or $KMSCOMMIT_CONFIG)
"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// Value of `--name VALUE` or `--name=VALUE`
fn arg_value<'a>(args: &'a [String], long: &str, short: &str) -> Option<&'a str> {
    let prefix = format!("{}=", long);
    args.iter().enumerate().find_map(|(i, a)| {
        if let Some(v) = a.strip_prefix(&prefix) {
            Some(v)
        } else if a == long || a == short {
            args.get(i + 1).map(String::as_str)
        } else {
            None
        }
    })
}

fn has_flag(args: &[String], long: &str, short: Option<&str>) -> bool {
    args.iter()
        .any(|a| a == long || short.map_or(false, |s| a == s))
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // Check command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --help
    if has_flag(&args, "--help", Some("-h")) {
        print_help();
        return Ok(());
    }

    // --version
    if has_flag(&args, "--version", Some("-V")) {
        println!("kmscommit {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if has_flag(&args, "--init-config", None) {
        let force = has_flag(&args, "--force", Some("-f"));
        let path = Config::write_default(force)?;
        println!("Config file generated: {}", path.display());
        return Ok(());
    }

    let mut cfg = Config::load();
    if let Some(path) = arg_value(&args, "--device", "-d") {
        cfg.device.path = path.to_string();
    }
    if let Some(frames) = arg_value(&args, "--frames", "-n") {
        cfg.demo.frames = frames
            .parse()
            .with_context(|| format!("Invalid frame count: {}", frames))?;
    }
    let test_only = has_flag(&args, "--test-only", Some("-t"));
    let force_dpms = has_flag(&args, "--dpms", None);

    info!("kmscommit starting...");
    setup_signal_handlers();

    let cards = open_cards(&cfg)?;
    for card in &cards {
        card.rescan(cfg.device.prefer_external);
    }

    let result = match select_pipeline(&cards, cfg.device.prefer_external) {
        Some((idx, manager)) => {
            let result = run(&cards, idx, &manager, &cfg, test_only, force_dpms);
            drop(manager);
            result
        }
        None => Err(anyhow!("No usable display pipeline on {}", cfg.device.path)),
    };

    for card in &cards {
        card.shutdown();
    }
    result
}

fn run(
    cards: &[Card],
    idx: usize,
    manager: &AtomicStateManager,
    cfg: &Config,
    test_only: bool,
    force_dpms: bool,
) -> Result<()> {
    let card = &cards[idx];
    let device = &card.device;
    let pipeline = manager.pipeline();
    let info = device.get_connector(pipeline.connector.handle)?;
    let mode = preferred_mode(&info)?;
    let (width, height) = mode.size();
    let (width, height) = (width as u32, height as u32);

    let primary = pipeline
        .primary_plane()
        .cloned()
        .ok_or_else(|| anyhow!("{} has no primary plane", pipeline.name()))?;

    if force_dpms {
        manager
            .activate_using_legacy_path()
            .with_context(|| format!("DPMS on failed for {}", pipeline.name()))?;
        info!("{}: DPMS on", pipeline.name());
    }

    let framebuffers: Vec<Arc<dyn Framebuffer>> = FRAME_COLORS
        .iter()
        .map(|&color| {
            DumbFramebuffer::new(device.clone(), width, height, color)
                .map(|fb| Arc::new(fb) as Arc<dyn Framebuffer>)
        })
        .collect::<Result<_>>()?;

    let plan_for = |frame: usize| {
        let fb = framebuffers[frame % framebuffers.len()].clone();
        let mut plan = CompositionPlan::new();
        plan.push(primary.clone(), LayerData::fullscreen(fb, width, height), 0);
        plan
    };

    let modeset = CommitRequest {
        active: Some(true),
        display_mode: Some(mode.clone()),
        composition: Some(plan_for(0)),
        test_only,
        ..Default::default()
    };

    if test_only {
        manager
            .commit_frame(modeset)
            .with_context(|| format!("Test commit rejected for {}", pipeline.name()))?;
        println!(
            "[OK] {} on {} accepts {}x{}@{} on plane {:?}",
            pipeline.name(),
            card.path.display(),
            width,
            height,
            mode.vrefresh,
            primary.handle
        );
        return Ok(());
    }

    manager
        .execute_atomic_commit(modeset)
        .with_context(|| format!("Modeset failed for {}", pipeline.name()))?;
    info!(
        "{}: {}x{}@{} active",
        pipeline.name(),
        width,
        height,
        mode.vrefresh
    );

    // Initialize DRM hotplug monitor (Linux only)
    #[cfg(target_os = "linux")]
    let mut hotplug = HotplugWatch::new(cards);

    let interval = Duration::from_millis(cfg.demo.frame_interval_ms);
    let mut unplugged = false;
    for frame in 1..=cfg.demo.frames as usize {
        if shutdown_requested() {
            info!("Shutdown requested");
            break;
        }

        #[cfg(target_os = "linux")]
        if let Some(watch) = hotplug.as_mut() {
            watch.process(cards, cfg.device.prefer_external);
        }
        if card.resources.get(pipeline.connector.handle).is_none() {
            warn!("{} was disconnected", pipeline.name());
            unplugged = true;
            break;
        }

        let request = CommitRequest {
            composition: Some(plan_for(frame)),
            ..Default::default()
        };
        if let Err(e) = manager.execute_atomic_commit(request) {
            warn!("Frame {} failed: {}", frame, e);
            break;
        }
        std::thread::sleep(interval);
    }

    let counters = manager.frame_counters();
    info!(
        "{}: {} frames staged, {} retired",
        pipeline.name(),
        counters.staged,
        counters.tracked
    );

    if unplugged {
        return Ok(());
    }

    // Planes off and CRTC down; framebuffers are released once retired
    manager
        .commit_frame(CommitRequest {
            active: Some(false),
            ..CommitRequest::blank()
        })
        .with_context(|| format!("Failed to blank {}", pipeline.name()))?;

    Ok(())
}
