// SPDX-License-Identifier: CEPL-1.0
//! Keyboard and mouse state for fly-camera controls.

use std::collections::HashSet;

use tracing::debug;
use winit::event::{DeviceEvent, ElementState, KeyEvent, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// Per-axis movement intent in the range -1..=1.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Movement {
    pub forward: f32,
    pub right: f32,
    pub up: f32,
}

impl Movement {
    pub fn is_idle(&self) -> bool {
        self.forward == 0.0 && self.right == 0.0 && self.up == 0.0
    }
}

#[derive(Debug, Default)]
pub struct InputState {
    held: HashSet<KeyCode>,
    just_pressed: HashSet<KeyCode>,
    /// Raw pointer motion accumulated since the last [`take_mouse_delta`](Self::take_mouse_delta).
    mouse_delta: (f64, f64),
    focused: bool,
}

impl InputState {
    pub fn new() -> Self {
        Self {
            focused: true,
            ..Default::default()
        }
    }

    /// Clears edge-triggered state. Call once per tick after handling input.
    pub fn end_frame(&mut self) {
        self.just_pressed.clear();
    }

    pub fn on_key_pressed(&mut self, key: KeyCode) {
        if self.held.insert(key) {
            self.just_pressed.insert(key);
        }
    }

    pub fn on_key_released(&mut self, key: KeyCode) {
        self.held.remove(&key);
    }

    pub fn on_mouse_motion(&mut self, dx: f64, dy: f64) {
        if self.focused {
            self.mouse_delta.0 += dx;
            self.mouse_delta.1 += dy;
        }
    }

    /// Losing focus releases every key so nothing stays stuck down.
    pub fn on_focus(&mut self, focused: bool) {
        debug!(focused, "window focus changed");
        self.focused = focused;
        if !focused {
            self.held.clear();
            self.mouse_delta = (0.0, 0.0);
        }
    }

    /// Returns true when the event was consumed.
    pub fn handle_window_event(&mut self, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        repeat,
                        ..
                    },
                ..
            } => {
                match state {
                    ElementState::Pressed if !repeat => self.on_key_pressed(*code),
                    ElementState::Pressed => {}
                    ElementState::Released => self.on_key_released(*code),
                }
                true
            }
            WindowEvent::Focused(focused) => {
                self.on_focus(*focused);
                false
            }
            _ => false,
        }
    }

    pub fn handle_device_event(&mut self, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            self.on_mouse_motion(*dx, *dy);
        }
    }

    pub fn is_held(&self, key: KeyCode) -> bool {
        self.held.contains(&key)
    }

    pub fn was_pressed(&self, key: KeyCode) -> bool {
        self.just_pressed.contains(&key)
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn take_mouse_delta(&mut self) -> (f64, f64) {
        std::mem::take(&mut self.mouse_delta)
    }

    /// WASD moves, Space rises, left Shift sinks.
    pub fn movement(&self) -> Movement {
        let axis = |pos: KeyCode, neg: KeyCode| (self.is_held(pos) as i8 - self.is_held(neg) as i8) as f32;
        Movement {
            forward: axis(KeyCode::KeyW, KeyCode::KeyS),
            right: axis(KeyCode::KeyD, KeyCode::KeyA),
            up: axis(KeyCode::Space, KeyCode::ShiftLeft),
        }
    }
}
