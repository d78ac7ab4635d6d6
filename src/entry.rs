//! DLL entry point and start-up

use std::ffi::c_void;
use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};
use std::thread;

use log::{error, info};
use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::Console::AllocConsole;
use windows_sys::Win32::System::LibraryLoader::{DisableThreadLibraryCalls, FreeLibraryAndExitThread};
use windows_sys::Win32::System::SystemServices::DLL_PROCESS_ATTACH;
use windows_sys::Win32::System::Threading::{SetThreadPriority, THREAD_PRIORITY_HIGHEST};
use windows_sys::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

use crate::config::Config;
use crate::fix::Fixer;
use crate::logging::{self, RULE};
use crate::module::{module_path, Module};
use crate::{Error, CONFIG_FILE, FIX_NAME, LOG_FILE};

/// Starts the fix on its own thread when the DLL is attached
#[no_mangle]
pub unsafe extern "system" fn DllMain(instance: HMODULE, reason: u32, _reserved: *mut c_void) -> i32 {
    if reason == DLL_PROCESS_ATTACH {
        DisableThreadLibraryCalls(instance);

        // the loader lock is held here, so the real work happens on a thread of our own
        let instance = instance as usize;
        let spawned = thread::Builder::new()
            .name(FIX_NAME.to_owned())
            .spawn(move || main(instance));
        if let Ok(handle) = spawned {
            SetThreadPriority(handle.as_raw_handle() as _, THREAD_PRIORITY_HIGHEST);
        }
    }
    1
}

/// Start-up thread. Fatal errors unload the DLL.
fn main(instance: usize) {
    if let Err(e) = start(instance) {
        error!("{e}");
        if e.is_fatal() {
            unload(instance, &e);
        }
    }
}

/// Sets up logging and config, then applies every enabled fix
fn start(instance: usize) -> Result<(), Error> {
    let game = Module::process_image()?;
    let fix_dir = directory(&module_path(instance)?);
    let log_path = directory(game.path()).join(LOG_FILE);

    logging::init(&log_path)?;
    logging::banner(&game, &log_path);

    let config = Config::load(&fix_dir.join(CONFIG_FILE))?;
    info!("{RULE}");
    config.log();

    let mut fixer = Fixer::new(game, config);
    fixer.run(desktop_resolution());
    info!(
        "Installed {} hooks and {} patches.",
        fixer.hooks().len(),
        fixer.patches().len()
    );
    fixer.persist();
    Ok(())
}

/// Folder `path` is in
fn directory(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Primary display resolution
fn desktop_resolution() -> (i32, i32) {
    // Safety: plain queries without side effects
    unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) }
}

/// Tells the user what went wrong and unloads the DLL, leaving the game running
fn unload(instance: usize, error: &Error) -> ! {
    log::logger().flush();
    // Safety: the console is only used for this message, and nothing of ours runs after the unload
    unsafe {
        AllocConsole();
        println!("{FIX_NAME}: {error}");
        FreeLibraryAndExitThread(instance as HMODULE, 1)
    }
}
