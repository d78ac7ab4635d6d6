#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod config;
pub mod cvar;
#[cfg(all(windows, target_arch = "x86_64"))]
mod entry;
mod error;
#[cfg(target_arch = "x86_64")]
pub mod fix;
pub mod hook;
pub mod logging;
pub mod module;
pub mod patcher;
pub mod poll;
pub mod scan;

pub use error::Error;

/// Name used for the log, the config file and the console
pub const FIX_NAME: &str = "GreatCircleFix";

/// Crate version, shown in the log banner
pub const FIX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file, looked up next to the DLL
pub const CONFIG_FILE: &str = "GreatCircleFix.ini";

/// Log file, created next to the game executable
pub const LOG_FILE: &str = "GreatCircleFix.log";
