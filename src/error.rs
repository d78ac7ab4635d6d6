//! Crate-wide error type

use std::path::PathBuf;

use thiserror::Error;

use crate::cvar::CVarError;
#[cfg(target_arch = "x86_64")]
use crate::hook::HookError;
use crate::module::ModuleError;
use crate::patcher::mem::PermissionError;
use crate::scan::{OutOfBounds, PatternError};

/// Everything that can stop a fix, or the whole module, from being applied.
///
/// Scan, resolve, patch and hook failures only affect the feature they happen in.
/// Config and log failures unload the module.
#[derive(Debug, Error)]
pub enum Error {
    /// A signature wasn't found in the image
    #[error("Pattern scan failed.")]
    ScanNotFound {
        /// Signature that was searched for
        pattern: &'static str,
    },
    /// A signature string is malformed
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] PatternError),
    /// A computed address points outside the image
    #[error("Invalid address: {0}")]
    ResolveInvalid(#[from] OutOfBounds),
    /// Memory couldn't be written
    #[error("Patch failed: {0}")]
    PatchDenied(#[from] PermissionError<()>),
    /// A hook couldn't be installed
    #[cfg(target_arch = "x86_64")]
    #[error("Hook failed: {0}")]
    Hook(#[from] HookError),
    /// The console variable system couldn't be used
    #[error("{0}")]
    CVar(#[from] CVarError),
    /// The process image couldn't be described
    #[error("{0}")]
    Module(#[from] ModuleError),
    /// The config file doesn't exist
    #[error("Could not locate config file {}", .0.display())]
    ConfigMissing(PathBuf),
    /// The config file exists but can't be read
    #[error("Could not read config file {}: {reason}", .path.display())]
    ConfigInvalid {
        /// Config file
        path: PathBuf,
        /// What went wrong
        reason: String,
    },
    /// The log file couldn't be opened
    #[error("Could not initialise log file: {0}")]
    LogInitFailed(String),
}

impl Error {
    /// Whether the error should unload the module instead of just skipping a feature
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigMissing(_)
                | Error::ConfigInvalid { .. }
                | Error::LogInitFailed(_)
                | Error::Module(_)
        )
    }
}
