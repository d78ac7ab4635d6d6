//! # CVar
//!
//! Sets console variables through the game's own command system.
//!
//! The game exposes no API for this, so two things are borrowed from its image: the command
//! system object (`idCmdSystemLocal`) and the native function that applies a CVar descriptor to
//! it. [`CmdSystem`] pairs them up and is the only place the native function is called from.

use std::ffi::{c_char, c_void, CString};

use log::info;
use thiserror::Error;

/// Errors from setting a CVar
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CVarError {
    /// The command had no value
    #[error("expected \"<name> <value>\", got {0:?}")]
    MissingValue(String),
    /// The command can't be passed as a C string
    #[error("{0:?} contains a nul byte")]
    Nul(String),
    /// The command system or the setter couldn't be found
    #[error("Function address or idCmdSystemLocal address incorrect.")]
    CmdSystemUnavailable,
}

/// Descriptor type for string values
const CVAR_STRING: i32 = 2;

/// CVar descriptor as the game expects it
#[repr(C)]
#[derive(Debug)]
pub struct RawCVar {
    /// Value type tag
    pub kind: i32,
    /// NUL-terminated CVar name
    pub name: *const c_char,
    /// NUL-terminated value
    pub value: *const c_char,
}

/// Native setter: `(command system, descriptor) -> success`
pub type SetCVarFn = unsafe extern "C" fn(*mut c_void, *const RawCVar) -> u8;

/// Splits `"<name> <value>"` at the first space
pub fn parse_cvar(command: &str) -> Result<(&str, &str), CVarError> {
    command
        .split_once(' ')
        .ok_or_else(|| CVarError::MissingValue(command.to_owned()))
}

/// The game's command system together with its CVar setter
#[derive(Debug, Clone, Copy)]
pub struct CmdSystem {
    /// `idCmdSystemLocal` instance
    system: *mut c_void,
    /// Setter the instance is passed to
    set_cvar: SetCVarFn,
}

// Safety: both pointers refer to process-global game objects
unsafe impl Send for CmdSystem {}
unsafe impl Sync for CmdSystem {}

impl CmdSystem {
    /// Pairs the command system object with the setter function.
    ///
    /// # Safety
    ///
    /// `set_cvar` must be the address of a function with the [`SetCVarFn`] signature and
    /// `system` an object it accepts, both valid for the rest of the process
    pub unsafe fn new(system: usize, set_cvar: usize) -> Self {
        Self {
            system: system as *mut c_void,
            set_cvar: std::mem::transmute::<usize, SetCVarFn>(set_cvar),
        }
    }

    /// Applies `"<name> <value>"`, returning the setter's result
    pub fn set(&self, command: &str) -> Result<u8, CVarError> {
        let (name, value) = parse_cvar(command)?;
        let c_name = CString::new(name).map_err(|_| CVarError::Nul(command.to_owned()))?;
        let c_value = CString::new(value).map_err(|_| CVarError::Nul(command.to_owned()))?;
        let cvar = RawCVar {
            kind: CVAR_STRING,
            name: c_name.as_ptr(),
            value: c_value.as_ptr(),
        };

        // Safety: guaranteed by `new`; the strings outlive the call
        let result = unsafe { (self.set_cvar)(self.system, &cvar) };
        info!("Set CVar: {name} = {value}");
        Ok(result)
    }
}

/// Sets a CVar if the command system was found
pub fn set_cvar(system: Option<&CmdSystem>, command: &str) -> Result<u8, CVarError> {
    system.ok_or(CVarError::CmdSystemUnavailable)?.set(command)
}

#[cfg(test)]
mod tests {
    use std::ffi::{c_void, CStr};
    use std::sync::Mutex;

    use super::{parse_cvar, set_cvar, CVarError, CmdSystem, RawCVar};

    /// Calls seen by [`fake_set_cvar`], as (system, kind, name, value)
    static CALLS: Mutex<Vec<(usize, i32, String, String)>> = Mutex::new(Vec::new());

    /// Stand-in for the native setter, records what it was given
    unsafe extern "C" fn fake_set_cvar(system: *mut c_void, cvar: *const RawCVar) -> u8 {
        let cvar = &*cvar;
        CALLS.lock().unwrap().push((
            system as usize,
            cvar.kind,
            CStr::from_ptr(cvar.name).to_string_lossy().into_owned(),
            CStr::from_ptr(cvar.value).to_string_lossy().into_owned(),
        ));
        1
    }

    #[test]
    /// Commands split at the first space
    fn test_parse_cvar() {
        assert_eq!(
            parse_cvar("r_gpuTriangleCullingOptions 0"),
            Ok(("r_gpuTriangleCullingOptions", "0"))
        );
        // only the first space separates
        assert_eq!(parse_cvar("bind F1 toggle hud"), Ok(("bind", "F1 toggle hud")));
        assert_eq!(
            parse_cvar("r_dofAfterTAAMode"),
            Err(CVarError::MissingValue("r_dofAfterTAAMode".into()))
        );
    }

    #[test]
    /// The native setter gets a string descriptor, and malformed commands never reach it
    fn test_set_calls_native() {
        let marker = 0x5151usize;
        let system = unsafe { CmdSystem::new(marker, fake_set_cvar as *const () as usize) };

        assert_eq!(system.set("r_dofAfterTAAMode 2"), Ok(1));
        assert_eq!(
            system.set("noValue"),
            Err(CVarError::MissingValue("noValue".into()))
        );
        assert_eq!(set_cvar(None, "r_dofAfterTAAMode 2"), Err(CVarError::CmdSystemUnavailable));

        let calls = CALLS.lock().unwrap();
        let ours: Vec<_> = calls.iter().filter(|call| call.0 == marker).collect();
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].1, 2);
        assert_eq!(ours[0].2, "r_dofAfterTAAMode");
        assert_eq!(ours[0].3, "2");
    }
}
