//! # Fix
//!
//! The individual game fixes, and [`Fixer`] which finds their targets in the game image and
//! applies them.
//!
//! Every fix is independent: a signature that isn't found or a hook that can't be installed is
//! logged and only that fix is skipped.

pub mod aspect;
pub mod cvars;
pub mod framerate;
pub mod intro;

use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::code::x64::{JMP_REL32_LEN, MAX_INSTR_LEN};
use crate::config::Config;
use crate::cvar::CmdSystem;
use crate::hook::{Context, MidHook};
use crate::module::Module;
use crate::patcher::{self, PatchRecord};
use crate::poll::{Sleeper, ThreadSleeper};
use crate::scan::{scan, Pattern};
use crate::Error;

use self::aspect::AspectState;

/// A named byte signature and the offset of the interesting instruction from its start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Prefix for log lines about this signature
    pub name: &'static str,
    /// Bytes to look for, `??` for wildcards
    pub pattern: &'static str,
    /// Distance from the match to the address that gets patched or hooked
    pub offset: usize,
}

/// Applies fixes to one game image and keeps everything they installed
pub struct Fixer<S = ThreadSleeper> {
    /// Game image
    module: Module,
    /// Which fixes to apply
    config: Config,
    /// Used while waiting on game state
    sleeper: S,
    /// Resolution and derived values, shared with the FOV hook
    aspect: Arc<Mutex<AspectState>>,
    /// CVar setter, once both halves were found
    cmd_system: Option<CmdSystem>,
    /// Hooks that come out again when the fixer is dropped
    hooks: Vec<MidHook>,
    /// Writes that stay
    patches: Vec<PatchRecord>,
}

impl Fixer<ThreadSleeper> {
    /// Creates a fixer that waits on game state with real sleeps
    pub fn new(module: Module, config: Config) -> Self {
        Self::with_sleeper(module, config, ThreadSleeper)
    }
}

impl<S: Sleeper> Fixer<S> {
    /// Creates a fixer that waits on game state with `sleeper`
    pub fn with_sleeper(module: Module, config: Config, sleeper: S) -> Self {
        Self {
            module,
            config,
            sleeper,
            aspect: Default::default(),
            cmd_system: None,
            hooks: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Applies every enabled fix. `desktop` seeds the resolution until a cutscene reports one.
    pub fn run(&mut self, desktop: (i32, i32)) {
        self.skip_intro();
        self.cvars();
        self.aspect_ratio_fov(desktop);
        self.framerate();
    }

    /// Image the fixes are applied to
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Fixes that were asked for
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current resolution state
    pub fn aspect(&self) -> AspectState {
        *aspect::lock(&self.aspect)
    }

    /// The command system, if it was found
    pub fn cmd_system(&self) -> Option<&CmdSystem> {
        self.cmd_system.as_ref()
    }

    /// Installed hooks
    pub fn hooks(&self) -> &[MidHook] {
        &self.hooks
    }

    /// Writes made so far
    pub fn patches(&self) -> &[PatchRecord] {
        &self.patches
    }

    /// Keeps every hook installed for the rest of the process, handing back the patch records
    pub fn persist(self) -> Vec<PatchRecord> {
        for hook in self.hooks {
            hook.persist();
        }
        self.patches
    }

    /// Looks for `signature` in the image, returning the address it points at
    pub fn find(&self, signature: &Signature) -> Result<usize, Error> {
        let pattern: Pattern = signature.pattern.parse()?;
        let address = scan(&self.module.region(), &pattern).ok_or(Error::ScanNotFound {
            pattern: signature.pattern,
        })?;
        info!(
            "{}: Address is {}+{:x}",
            signature.name,
            self.module.name(),
            self.module.rva(address)
        );
        Ok(address + signature.offset)
    }

    /// Tries the signatures of `variants` in order, returning the first that's found.
    ///
    /// If none are, the error names the first variant.
    pub fn find_any<'a, T, F>(&self, variants: &'a [T], signature: F) -> Result<(&'a T, usize), Error>
    where
        F: Fn(&T) -> &Signature,
    {
        let mut first_miss = None;
        for variant in variants {
            match self.find(signature(variant)) {
                Ok(address) => return Ok((variant, address)),
                Err(e @ Error::ScanNotFound { .. }) => {
                    first_miss.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(first_miss.unwrap_or(Error::ScanNotFound { pattern: "" }))
    }

    /// Overwrites code at `address` for good
    fn patch(&mut self, address: usize, bytes: &[u8]) -> Result<(), Error> {
        self.module.region().check(address, bytes.len())?;
        // Safety: the address is inside the image and was found by signature
        let record = unsafe { patcher::write_bytes(address, bytes)? };
        self.patches.push(record);
        Ok(())
    }

    /// Runs `callback` whenever the game reaches `address`
    fn hook<F>(&mut self, address: usize, callback: F) -> Result<(), Error>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        // the installer reads a full instruction past the jump it writes
        self.module.region().check(address, JMP_REL32_LEN + MAX_INSTR_LEN - 1)?;
        // Safety: the address is inside the image and was found by a signature anchored on an instruction
        let hook = unsafe { MidHook::install(address, callback)? };
        self.hooks.push(hook);
        Ok(())
    }
}

/// Logs a failed fix under its name, passing successes through
fn report<T>(name: &str, result: Result<T, Error>) -> Option<T> {
    result.map_err(|e| error!("{name}: {e}")).ok()
}
