//! Commit request value types
//!
//! A `CommitRequest` describes the delta a caller wants applied. Every field is
//! optional; "no value" leaves that aspect of the hardware untouched.

use std::sync::Arc;

use bitflags::bitflags;

use super::object::Plane;
use super::state::Framebuffer;

/// Display timing descriptor (layout-compatible with `drm_mode_modeinfo`
/// once converted by the backend)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayMode {
    pub name: String,
    /// Pixel clock in kHz
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
}

impl DisplayMode {
    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }
}

/// 3x3 color transform matrix in S31.32 sign-magnitude (`drm_color_ctm`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorMatrix {
    pub coefficients: [u64; 9],
}

impl ColorMatrix {
    pub const IDENTITY: ColorMatrix = ColorMatrix {
        coefficients: [
            1 << 32, 0, 0, //
            0, 1 << 32, 0, //
            0, 0, 1 << 32,
        ],
    };

    /// Build from row-major floating point coefficients
    pub fn from_f64(m: [f64; 9]) -> Self {
        let mut coefficients = [0u64; 9];
        for (out, v) in coefficients.iter_mut().zip(m.iter()) {
            let magnitude = (v.abs() * (1u64 << 32) as f64).round() as u64 & !(1u64 << 63);
            *out = if *v < 0.0 {
                magnitude | (1u64 << 63)
            } else {
                magnitude
            };
        }
        Self { coefficients }
    }
}

/// Source crop in buffer pixels (fractional)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SourceCrop {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl SourceCrop {
    /// Convert a coordinate to 16.16 fixed point
    pub fn to_fixed(v: f32) -> u64 {
        (v.max(0.0) as f64 * 65536.0).round() as u64
    }
}

/// Destination rectangle on the CRTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayFrame {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

bitflags! {
    /// Plane rotation/reflection bits (`DRM_MODE_ROTATE_*`, `DRM_MODE_REFLECT_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rotation: u64 {
        const ROTATE_0 = 1 << 0;
        const ROTATE_90 = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X = 1 << 4;
        const REFLECT_Y = 1 << 5;
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::ROTATE_0
    }
}

/// Pixel blend mode, named as the kernel enumerates it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    None,
    #[default]
    PreMultiplied,
    Coverage,
}

impl BlendMode {
    pub fn kernel_name(self) -> &'static str {
        match self {
            BlendMode::None => "None",
            BlendMode::PreMultiplied => "Pre-multiplied",
            BlendMode::Coverage => "Coverage",
        }
    }
}

/// One composited layer as handed over by the planner
#[derive(Debug, Clone)]
pub struct LayerData {
    pub framebuffer: Arc<dyn Framebuffer>,
    pub source_crop: SourceCrop,
    pub display_frame: DisplayFrame,
    pub rotation: Rotation,
    /// Plane alpha, 0..=0xffff
    pub alpha: u16,
    pub blend: BlendMode,
}

impl LayerData {
    /// Full-size, unscaled layer at the origin
    pub fn fullscreen(framebuffer: Arc<dyn Framebuffer>, width: u32, height: u32) -> Self {
        Self {
            framebuffer,
            source_crop: SourceCrop {
                x: 0.0,
                y: 0.0,
                w: width as f32,
                h: height as f32,
            },
            display_frame: DisplayFrame {
                x: 0,
                y: 0,
                w: width,
                h: height,
            },
            rotation: Rotation::ROTATE_0,
            alpha: 0xffff,
            blend: BlendMode::PreMultiplied,
        }
    }
}

/// A plane paired with the layer it should scan out
#[derive(Debug, Clone)]
pub struct PlaneJoining {
    pub plane: Arc<Plane>,
    pub layer: LayerData,
    pub z_pos: u32,
}

/// Full replacement set of plane assignments, bottom-most first
#[derive(Debug, Clone, Default)]
pub struct CompositionPlan {
    pub entries: Vec<PlaneJoining>,
}

impl CompositionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, plane: Arc<Plane>, layer: LayerData, z_pos: u32) {
        self.entries.push(PlaneJoining { plane, layer, z_pos });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Desired change set for one commit attempt
#[derive(Debug, Clone, Default)]
pub struct CommitRequest {
    pub active: Option<bool>,
    pub display_mode: Option<DisplayMode>,
    pub color_matrix: Option<ColorMatrix>,
    pub composition: Option<CompositionPlan>,
    /// Validate only, never apply
    pub test_only: bool,
}

impl CommitRequest {
    /// Whether any hardware-affecting field is set
    pub fn has_inputs(&self) -> bool {
        self.active.is_some()
            || self.display_mode.is_some()
            || self.color_matrix.is_some()
            || self.composition.is_some()
    }

    /// Request disabling every plane of the current composition
    pub fn blank() -> Self {
        Self {
            composition: Some(CompositionPlan::default()),
            ..Self::default()
        }
    }
}
