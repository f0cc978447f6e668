// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;
mod demo;

use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tessera_core::init_tracing;
use tessera_render::{FrameStatus, RenderSize, Renderer};
use tessera_render_vk::VkRenderer;
use tracing::{error, info, warn};

use tessera_platform::winit::{
    application::ApplicationHandler,
    event::{DeviceEvent, DeviceId, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{CursorGrabMode, Window, WindowId},
};
use tessera_platform::{InputState, KeyCode};

use config::{AppCfg, Args, UnfocusedPolicy};

struct App {
    cfg: AppCfg,
    // dropped before the window it renders into
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    input: InputState,
    render_size: RenderSize,

    exiting: bool,
    paused: bool,
    frames: u32,
    last_fps_instant: Instant,
    last_update: Instant,
    next_frame_deadline: Option<Instant>,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        let now = Instant::now();
        App {
            cfg,
            renderer: None,
            window: None,
            input: InputState::new(),
            render_size: RenderSize { width: 1, height: 1 },
            exiting: false,
            paused: false,
            frames: 0,
            last_fps_instant: now,
            last_update: now,
            next_frame_deadline: None,
        }
    }

    fn init_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop.create_window(Window::default_attributes().with_title("tessera"))?;
        let size = window.inner_size();
        self.render_size = RenderSize {
            width: size.width.max(1),
            height: size.height.max(1),
        };

        let mut renderer =
            VkRenderer::with_options(&window, &window, self.render_size, self.cfg.vk_options())?;
        *renderer.camera_mut() = self.cfg.camera.camera();
        demo::populate(&mut renderer, self.cfg.overlay.bounds)?;
        grab_cursor(&window, true);

        info!(
            vsync = self.cfg.render.vsync,
            frames_in_flight = renderer.frames_in_flight(),
            "renderer up"
        );
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    /// Moves the camera by the input gathered since the last frame.
    fn update_camera(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f32();
        self.last_update = now;

        let Some(renderer) = &mut self.renderer else {
            return;
        };
        let (dx, dy) = self.input.take_mouse_delta();
        let movement = self.input.movement();
        let cam = renderer.camera_mut();
        if self.input.is_focused() && (dx != 0.0 || dy != 0.0) {
            let s = self.cfg.camera.sensitivity;
            cam.rotate(dx as f32 * s, -(dy as f32) * s);
        }
        if !movement.is_idle() {
            let step = self.cfg.camera.speed * dt;
            let mut flat = cam.forward();
            flat.y = 0.0;
            let flat = flat.normalize_or_zero();
            cam.position += (flat * movement.forward + cam.right() * movement.right) * step;
            cam.position.y += movement.up * step;
        }
        self.input.end_frame();
    }

    fn redraw(&mut self) {
        self.update_camera();
        let Some(renderer) = &mut self.renderer else {
            return;
        };
        match renderer.render_frame() {
            Ok(FrameStatus::Presented { .. }) | Ok(FrameStatus::PresentedAndRecreated { .. }) => {
                self.frames = self.frames.saturating_add(1);
            }
            Ok(FrameStatus::Skipped) => {}
            Err(e) => error!("render error: {e}"),
        }
    }

    /// Target redraw rate for this iteration; 0 means no cap.
    fn target_fps(&self) -> u32 {
        let render = &self.cfg.render;
        if !self.input.is_focused() && render.unfocused == UnfocusedPolicy::Throttle {
            return render.unfocused_fps;
        }
        if render.vsync {
            0
        } else {
            render.fps_when_vsync_off
        }
    }

    fn request_redraw(&self) {
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }
}

fn grab_cursor(window: &Window, grab: bool) {
    let res = if grab {
        window
            .set_cursor_grab(CursorGrabMode::Confined)
            .or_else(|_| window.set_cursor_grab(CursorGrabMode::Locked))
    } else {
        window.set_cursor_grab(CursorGrabMode::None)
    };
    if let Err(e) = res {
        warn!("cursor grab ({grab}) failed: {e}");
    }
    window.set_cursor_visible(!grab);
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init_window(event_loop) {
                error!("startup failed: {e:#}");
                self.shutdown(event_loop);
                return;
            }
        }
        event_loop.set_control_flow(if self.cfg.render.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        self.paused = self.render_size.is_zero();
        info!(paused = self.paused, "resumed");
        if !self.paused {
            self.request_redraw();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }
        self.input.handle_window_event(&event);

        match event {
            WindowEvent::CloseRequested => {
                info!("close requested");
                self.shutdown(event_loop);
            }

            WindowEvent::KeyboardInput { .. } if self.input.was_pressed(KeyCode::Escape) => {
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                self.paused = self.render_size.is_zero();
                info!(
                    width = self.render_size.width,
                    height = self.render_size.height,
                    paused = self.paused,
                    "resized"
                );
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(self.render_size) {
                        warn!("resize failed: {e}");
                    }
                }
                if !self.paused {
                    self.request_redraw();
                }
            }

            WindowEvent::Occluded(occluded) => {
                self.paused = occluded || self.render_size.is_zero();
                info!(occluded, paused = self.paused, "occlusion changed");
            }

            WindowEvent::Focused(focused) => {
                info!(focused, "focus changed");
                if let Some(w) = &self.window {
                    grab_cursor(w, focused);
                }
                self.next_frame_deadline = None;
                if focused {
                    self.last_update = Instant::now();
                    self.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                self.redraw();
            }

            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _device_id: DeviceId, event: DeviceEvent) {
        self.input.handle_device_event(&event);
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        let paused_by_focus = !self.input.is_focused() && self.cfg.render.unfocused == UnfocusedPolicy::Pause;
        if self.paused || paused_by_focus {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        let target_fps = self.target_fps();
        if target_fps == 0 {
            // vsync blocks in present; otherwise keep drawing flat out
            event_loop.set_control_flow(if self.cfg.render.vsync {
                ControlFlow::Wait
            } else {
                ControlFlow::Poll
            });
            self.request_redraw();
        } else {
            let now = Instant::now();
            let frame_dt = Duration::from_nanos(1_000_000_000 / u64::from(target_fps));
            match self.next_frame_deadline {
                Some(deadline) if now < deadline => {
                    event_loop.set_control_flow(ControlFlow::WaitUntil(deadline));
                }
                _ => {
                    let next = now + frame_dt;
                    self.next_frame_deadline = Some(next);
                    event_loop.set_control_flow(ControlFlow::WaitUntil(next));
                    self.request_redraw();
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            let pending = self.renderer.as_ref().map_or(0, |r| r.pending_destructions());
            info!(fps = self.frames, pending_destructions = pending, "frame rate");
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = AppCfg::load(&args.config);
    cfg.apply_args(&args);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}
