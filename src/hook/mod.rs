//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another.
//!
//! The only hook type is the mid-function hook: any instruction boundary can be hooked and the
//! callback gets to inspect and change the full register state before execution carries on.

pub mod context;
#[cfg(target_arch = "x86_64")]
mod mid;

pub use context::{Context, Xmm};
#[cfg(target_arch = "x86_64")]
pub use mid::{HookError, MidHook};
