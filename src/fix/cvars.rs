//! Console variable fixes: lifting restrictions and setting CVars on level load

use std::time::Duration;

use log::{error, info};

use crate::config::Config;
use crate::cvar::{set_cvar, CVarError, CmdSystem};
use crate::hook::Context;
use crate::poll::{Poll, Sleeper};
use crate::scan::resolve_in;
use crate::Error;

use super::{report, Fixer, Signature};

/// `mov edx, 1` restriction flags passed when CVars are set from the console, binds and exec'd configs
pub const RESTRICTIONS: [Signature; 3] = [
    Signature {
        name: "CVar Restrictions: Console",
        pattern: "BA 01 00 00 00 49 ?? ?? 44 ?? ?? 41 FF ?? ?? 66 0F ?? ?? ?? ?? ?? ??",
        offset: 1,
    },
    Signature {
        name: "CVar Restrictions: Bind",
        pattern: "BA 01 00 00 00 49 ?? ?? 8B ?? 41 FF ?? ?? 8B ?? 8B ?? E8 ?? ?? ?? ??",
        offset: 1,
    },
    Signature {
        name: "CVar Restrictions: Exec",
        pattern: "BA 01 00 00 00 E8 ?? ?? ?? ?? 83 ?? ?? ?? ?? ?? 00 0F 84 ?? ?? ?? ??",
        offset: 1,
    },
];

/// Flag test on a CVar before it's written
pub const READ_ONLY_CVARS: Signature = Signature {
    name: "Read-Only Cvars",
    pattern: "0F ?? ?? 0E 73 ?? 48 8B ?? ?? 48 8D ?? ?? ?? ?? ?? E8 ?? ?? ?? ??",
    offset: 0,
};

/// `lea` of the command system object
pub const CMD_SYSTEM: Signature = Signature {
    name: "idCmdSystemLocal",
    pattern: "48 8D ?? ?? ?? ?? ?? 48 89 ?? ?? ?? ?? ?? 48 89 ?? ?? E8 ?? ?? ?? ?? 48 8B ?? ?? ?? ?? ?? 48 8D ?? ?? ?? ?? ?? B9 00 01 00 00",
    offset: 0,
};

/// Native CVar setter prologue
pub const SET_CVAR: Signature = Signature {
    name: "Set CVar Function",
    pattern: "40 ?? 53 41 ?? 48 8D ?? ?? ?? 48 81 ?? ?? ?? ?? ?? 48 8B ?? ?? ?? ?? ?? 48 33 ?? 48 89 ?? ?? 8B ?? 4C 8B ??",
    offset: 0,
};

/// `idLoadScreen::LevelLoadCompleted()`
pub const LEVEL_LOAD_COMPLETED: Signature = Signature {
    name: "LevelLoadCompleted()",
    pattern: "48 89 ?? ?? ?? 48 89 ?? ?? ?? 48 89 ?? ?? ?? 57 48 83 ?? ?? 48 8D ?? ?? ?? ?? ?? E8 ?? ?? ?? ??",
    offset: 0,
};

/// How long to wait for the command system to be constructed
pub const CMD_SYSTEM_POLL: Poll = Poll::new(15, Duration::from_millis(100));

/// CVar flag: can't be changed at runtime
pub const READ_ONLY: u64 = 1 << 15;
/// CVar flag: can only be set on the command line
pub const CMDLINE_ONLY: u64 = 1 << 14;

/// Strips the flags that make a CVar unchangeable from the value under test
pub fn clear_cvar_flags(ctx: &mut Context) {
    ctx.rax &= !(READ_ONLY | CMDLINE_ONLY);
}

/// CVars that have to be set again after every level load
pub fn level_load_commands(config: &Config) -> Vec<&'static str> {
    let mut commands = Vec::new();
    if config.fix_culling {
        // objects popping out of view at the screen edges
        commands.push("r_gpuTriangleCullingOptions 0");
    }
    if config.fix_dlss_dof_denoising {
        // DLSS ray reconstruction doesn't denoise while depth of field is active
        commands.push("r_dofAfterTAAMode 2");
    }
    commands
}

impl<S: Sleeper> Fixer<S> {
    /// Lifts CVar restrictions and sets up the level load CVars, as configured
    pub(super) fn cvars(&mut self) {
        if self.config.unrestrict_cvars {
            let mut unrestricted = 0;
            for restriction in &RESTRICTIONS {
                let result = self
                    .find(restriction)
                    .and_then(|address| self.patch(address, &0i32.to_le_bytes()));
                unrestricted += report(restriction.name, result).is_some() as usize;
            }
            if unrestricted == RESTRICTIONS.len() {
                info!("CVar Restrictions: Disabled restrictions.");
            }

            let result = self
                .find(&READ_ONLY_CVARS)
                .and_then(|address| self.hook(address, clear_cvar_flags));
            report(READ_ONLY_CVARS.name, result);
        }

        let commands = level_load_commands(&self.config);
        if commands.is_empty() {
            return;
        }

        let system = report(CMD_SYSTEM.name, self.find_cmd_system());
        let set_cvar = report(SET_CVAR.name, self.find(&SET_CVAR));
        if let (Some(system), Some(set_cvar)) = (system, set_cvar) {
            // Safety: the setter was matched by its prologue, and the object is the one the game passes it
            self.cmd_system = Some(unsafe { CmdSystem::new(system, set_cvar) });
        }

        let result = self.level_load(commands);
        report(LEVEL_LOAD_COMPLETED.name, result);
    }

    /// Finds the command system and waits for the game to construct it
    pub fn find_cmd_system(&self) -> Result<usize, Error> {
        let instruction = self.find(&CMD_SYSTEM)?;
        let system = resolve_in(&self.module.region(), instruction, 3, 7)?;

        let ready = CMD_SYSTEM_POLL.until(&self.sleeper, || {
            // Safety: `resolve_in` checked that the address is inside the image
            let first = unsafe { (system as *const u8).read_volatile() };
            (first != 0).then_some(system)
        });
        match ready {
            Some(system) => {
                info!("{}: idCmdSystemLocal address is {system:x}", CMD_SYSTEM.name);
                Ok(system)
            }
            None => Err(CVarError::CmdSystemUnavailable.into()),
        }
    }

    /// Sets `commands` every time a level finishes loading
    fn level_load(&mut self, commands: Vec<&'static str>) -> Result<(), Error> {
        let address = self.find(&LEVEL_LOAD_COMPLETED)?;
        let system = self.cmd_system;
        self.hook(address, move |_| {
            for command in &commands {
                if let Err(e) = set_cvar(system.as_ref(), command) {
                    error!("Set CVar: {e}");
                }
            }
        })
    }
}
