// SPDX-License-Identifier: CEPL-1.0
//! Windowing glue: the winit re-export and first-person input tracking.

mod input;

pub use input::{InputState, Movement};
pub use winit;
pub use winit::keyboard::KeyCode;
