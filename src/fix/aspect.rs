//! Aspect ratio bookkeeping and the cutscene FOV fix.
//!
//! Cutscenes are authored for a 2.37:1 frame. On wider screens the game keeps the vertical FOV
//! and crops the picture vertically instead of widening it, so the FOV is widened here to keep
//! the authored framing.

use std::f32::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info};

use crate::hook::Context;
use crate::logging::RULE;
use crate::poll::Sleeper;

use super::{report, Fixer, Signature};

/// Aspect ratio the cutscenes are framed for
pub const NATIVE_ASPECT: f32 = 2.37;

/// Cutscene FOV calculation. The hook goes on the `movaps` after the framing comparison.
pub const CUTSCENE_FOV: Signature = Signature {
    name: "Cutscene FOV",
    pattern: "83 ?? ?? ?? 02 0F 28 ?? 48 8B ?? ?? ?? 0F 57 ?? F3 0F ?? ?? F3 0F ?? ?? ?? ?? ?? ??",
    offset: 8,
};

/// Output resolution and the values derived from it
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AspectState {
    /// Output width in pixels
    pub res_x: i32,
    /// Output height in pixels
    pub res_y: i32,
    /// `res_x / res_y`
    pub aspect: f32,
    /// `aspect` relative to [`NATIVE_ASPECT`]
    pub multiplier: f32,
    /// Width of the 16:9 HUD area
    pub hud_width: f32,
    /// Height of the 16:9 HUD area
    pub hud_height: f32,
    /// Pillarbox on each side of the HUD area
    pub hud_width_offset: f32,
    /// Letterbox above and below the HUD area
    pub hud_height_offset: f32,
}

impl AspectState {
    /// Computes the state for a resolution, `None` unless both sides are positive
    pub fn from_resolution(res_x: i32, res_y: i32) -> Option<Self> {
        if res_x <= 0 || res_y <= 0 {
            return None;
        }
        let (width, height) = (res_x as f32, res_y as f32);
        let aspect = width / height;

        // the HUD keeps the native shape, pillarboxed on wider screens and letterboxed on narrower ones
        let (hud_width, hud_height, hud_width_offset, hud_height_offset) = if aspect >= NATIVE_ASPECT {
            let hud_width = height * NATIVE_ASPECT;
            (hud_width, height, (width - hud_width) / 2.0, 0.0)
        } else {
            let hud_height = width / NATIVE_ASPECT;
            (width, hud_height, 0.0, (height - hud_height) / 2.0)
        };

        Some(Self {
            res_x,
            res_y,
            aspect,
            multiplier: aspect / NATIVE_ASPECT,
            hud_width,
            hud_height,
            hud_width_offset,
            hud_height_offset,
        })
    }

    /// Switches to a new resolution. Invalid resolutions leave the state alone and return `false`.
    pub fn update(&mut self, res_x: i32, res_y: i32) -> bool {
        match Self::from_resolution(res_x, res_y) {
            Some(state) => {
                *self = state;
                true
            }
            None => false,
        }
    }

    /// Writes the resolution to the log
    pub fn log(&self) {
        info!("{RULE}");
        info!("Current Resolution: Resolution: {}x{}", self.res_x, self.res_y);
        info!("Current Resolution: fAspectRatio: {}", self.aspect);
        info!("Current Resolution: fAspectMultiplier: {}", self.multiplier);
        info!("Current Resolution: fHUDWidth: {}", self.hud_width);
        info!("Current Resolution: fHUDHeight: {}", self.hud_height);
        info!("Current Resolution: fHUDWidthOffset: {}", self.hud_width_offset);
        info!("Current Resolution: fHUDHeightOffset: {}", self.hud_height_offset);
        info!("{RULE}");
    }
}

/// Widens a FOV (in degrees) framed for [`NATIVE_ASPECT`] so the same picture fills `aspect`
pub fn vert_minus_fov(fov: f32, aspect: f32) -> f32 {
    ((fov * (PI / 360.0)).tan() / NATIVE_ASPECT * aspect).atan() * (360.0 / PI)
}

/// Locks the shared state, carrying on past a panic in another holder
pub(super) fn lock(state: &Mutex<AspectState>) -> MutexGuard<'_, AspectState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hook body for [`CUTSCENE_FOV`].
///
/// At the hook site `rax` holds the picture framing option (0 is fullscreen), `xmm1`/`xmm2` the
/// render resolution and `xmm3` the FOV. Setting ZF skips the game's own 16:9 adjustment.
pub fn cutscene_fov(ctx: &mut Context, state: &Mutex<AspectState>) {
    if ctx.rax != 0 {
        return;
    }
    let (res_x, res_y) = (ctx.xmm[1].f32(0) as i32, ctx.xmm[2].f32(0) as i32);

    let mut state = lock(state);
    if (res_x, res_y) != (state.res_x, state.res_y) && state.update(res_x, res_y) {
        state.log();
    }

    if state.aspect > NATIVE_ASPECT {
        ctx.set_zero_flag(true);
        let fov = ctx.xmm[3].f32(0);
        ctx.xmm[3].set_f32(0, vert_minus_fov(fov, state.aspect));
    }
}

impl<S: Sleeper> Fixer<S> {
    /// Seeds the resolution with `desktop` and hooks the cutscene FOV if enabled
    pub(super) fn aspect_ratio_fov(&mut self, desktop: (i32, i32)) {
        {
            let mut state = lock(&self.aspect);
            if state.update(desktop.0, desktop.1) {
                state.log();
            } else {
                error!(
                    "Current Resolution: Desktop resolution {}x{} is invalid.",
                    desktop.0, desktop.1
                );
            }
        }

        if self.config.fix_cutscene_fov {
            let state = Arc::clone(&self.aspect);
            let result = self
                .find(&CUTSCENE_FOV)
                .and_then(|address| self.hook(address, move |ctx| cutscene_fov(ctx, &state)));
            report(CUTSCENE_FOV.name, result);
        }
    }
}
