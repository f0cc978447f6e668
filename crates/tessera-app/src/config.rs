// SPDX-License-Identifier: CEPL-1.0
//! `tessera.toml` plus command-line overrides.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use tessera_math::glam::Vec3;
use tessera_math::Camera;
use tessera_render::WireframeTopology;
use tessera_render_vk::{VkOptions, VkVsyncMode};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file
    #[arg(long, default_value = "tessera.toml")]
    pub config: PathBuf,

    /// Frames recorded ahead of the GPU (2 or 3)
    #[arg(long)]
    pub frames_in_flight: Option<usize>,

    /// Present immediately instead of waiting for vblank
    #[arg(long)]
    pub no_vsync: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

impl From<VsyncMode> for VkVsyncMode {
    fn from(mode: VsyncMode) -> Self {
        match mode {
            VsyncMode::Fifo => VkVsyncMode::Fifo,
            VsyncMode::Mailbox => VkVsyncMode::Mailbox,
        }
    }
}

/// What the app does while the window is unfocused.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnfocusedPolicy {
    /// Keep rendering as if focused.
    Full,
    /// Cap redraws at `unfocused_fps`.
    #[default]
    Throttle,
    Pause,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    #[default]
    LineList,
    LineStrip,
}

impl From<Topology> for WireframeTopology {
    fn from(t: Topology) -> Self {
        match t {
            Topology::LineList => WireframeTopology::LineList,
            Topology::LineStrip => WireframeTopology::LineStrip,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
    pub frames_in_flight: usize,
    pub unfocused: UnfocusedPolicy,
    pub unfocused_fps: u32,
    /// 0 leaves the frame rate uncapped.
    pub fps_when_vsync_off: u32,
    pub wireframe_topology: Topology,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync: true,
            vsync_mode: VsyncMode::Mailbox,
            frames_in_flight: 2,
            unfocused: UnfocusedPolicy::Throttle,
            unfocused_fps: 30,
            fps_when_vsync_off: 0,
            wireframe_topology: Topology::LineList,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct CameraCfg {
    pub position: [f32; 3],
    pub x_rotation: f32,
    pub y_rotation: f32,
    pub near: f32,
    pub far: f32,
    pub fov_y_degrees: f32,
    /// Units per second.
    pub speed: f32,
    /// Degrees per pixel of mouse motion.
    pub sensitivity: f32,
}

impl Default for CameraCfg {
    fn default() -> Self {
        let cam = Camera::default();
        CameraCfg {
            position: cam.position.to_array(),
            x_rotation: cam.x_rotation,
            y_rotation: cam.y_rotation,
            near: cam.near,
            far: cam.far,
            fov_y_degrees: cam.fov_y_degrees,
            speed: 8.0,
            sensitivity: 0.1,
        }
    }
}

impl CameraCfg {
    pub fn camera(&self) -> Camera {
        Camera {
            position: Vec3::from_array(self.position),
            x_rotation: self.x_rotation,
            y_rotation: self.y_rotation,
            near: self.near,
            far: self.far,
            fov_y_degrees: self.fov_y_degrees,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct OverlayCfg {
    pub bounds: [f32; 3],
}

impl Default for OverlayCfg {
    fn default() -> Self {
        OverlayCfg {
            bounds: [100.0, 100.0, 100.0],
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct AppCfg {
    pub render: RenderCfg,
    pub camera: CameraCfg,
    pub overlay: OverlayCfg,
}

impl AppCfg {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reads `path`. A missing or malformed file yields the defaults.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => match Self::parse(&text) {
                Ok(cfg) => {
                    info!(path = %path.display(), "config loaded");
                    cfg
                }
                Err(e) => {
                    warn!(path = %path.display(), "ignoring malformed config: {e}");
                    Self::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), "cannot read config: {e}");
                Self::default()
            }
        }
    }

    /// Command-line flags win over the file.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(n) = args.frames_in_flight {
            self.render.frames_in_flight = n;
        }
        if args.no_vsync {
            self.render.vsync = false;
        }
    }

    pub fn vk_options(&self) -> VkOptions {
        VkOptions {
            frames_in_flight: self.render.frames_in_flight,
            vsync: self.render.vsync,
            vsync_mode: self.render.vsync_mode.into(),
            wireframe_topology: self.render.wireframe_topology.into(),
            clear_color: self.render.clear_color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = AppCfg::parse("").unwrap();
        assert_eq!(cfg, AppCfg::default());
        assert_eq!(cfg.render.unfocused, UnfocusedPolicy::Throttle);
        assert_eq!(cfg.overlay.bounds, [100.0; 3]);
        assert_eq!(cfg.camera.camera(), Camera::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = AppCfg::parse(
            r#"
            [render]
            vsync_mode = "fifo"
            unfocused = "pause"
            wireframe_topology = "line_strip"

            [camera]
            position = [1.0, 2.0, 3.0]
            fov_y_degrees = 70.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.vsync_mode, VsyncMode::Fifo);
        assert_eq!(cfg.render.unfocused, UnfocusedPolicy::Pause);
        assert!(cfg.render.vsync);
        assert_eq!(cfg.render.frames_in_flight, 2);
        assert_eq!(cfg.camera.camera().position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(cfg.camera.fov_y_degrees, 70.0);
        assert_eq!(cfg.camera.near, Camera::default().near);

        let opts = cfg.vk_options();
        assert_eq!(opts.vsync_mode, VkVsyncMode::Fifo);
        assert_eq!(opts.wireframe_topology, WireframeTopology::LineStrip);
    }

    #[test]
    fn unknown_enum_values_are_errors() {
        assert!(AppCfg::parse("[render]\nunfocused = \"sometimes\"").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = AppCfg::load(Path::new("/definitely/not/here/tessera.toml"));
        assert_eq!(cfg, AppCfg::default());
    }

    #[test]
    fn flags_override_the_file() {
        let mut cfg = AppCfg::parse("[render]\nframes_in_flight = 2\nvsync = true").unwrap();
        let args = Args::parse_from(["tessera", "--frames-in-flight", "3", "--no-vsync"]);
        cfg.apply_args(&args);
        assert_eq!(cfg.render.frames_in_flight, 3);
        assert!(!cfg.render.vsync);
        assert_eq!(args.config, PathBuf::from("tessera.toml"));
    }
}
