//! Log file setup.
//!
//! Everything goes through the `log` macros into a single file next to the game executable.
//! The file is truncated on every start and each record is written straight through.

use std::fs::File;
use std::path::Path;

use log::{info, LevelFilter};
use simplelog::{ConfigBuilder, WriteLogger};

use crate::module::Module;
use crate::{Error, FIX_NAME, FIX_VERSION};

/// Separator between log sections
pub const RULE: &str = "----------";

/// Opens `path` for writing and routes all log records there
pub fn init(path: &Path) -> Result<(), Error> {
    let file = File::create(path)
        .map_err(|e| Error::LogInitFailed(format!("{}: {e}", path.display())))?;
    let config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .build();
    WriteLogger::init(LevelFilter::Info, config, file)
        .map_err(|e| Error::LogInitFailed(e.to_string()))
}

/// Writes the start-up banner describing the fix and the process it's attached to
pub fn banner(module: &Module, log_path: &Path) {
    info!("{RULE}");
    info!("{FIX_NAME} v{FIX_VERSION} loaded.");
    info!("{RULE}");
    info!("Log file: {}", log_path.display());
    info!("{RULE}");
    info!("Module Name: {}", module.name());
    info!("Module Path: {}", module.path().display());
    info!("Module Address: {:#x}", module.base());
    info!("Module Timestamp: {}", module.timestamp());
    info!("{RULE}");
}

#[cfg(test)]
mod tests {
    use std::fs;

    use log::info;

    use super::{banner, init};
    use crate::module::tests::write_headers;
    use crate::module::Module;
    use crate::Error;

    #[test]
    /// Records land in the file, and only one logger can ever be installed
    fn test_init_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GreatCircleFix.log");
        fs::write(&path, "stale contents from the last run\n").unwrap();

        init(&path).unwrap();

        let mut image = vec![0u8; 0x400];
        write_headers(&mut image);
        let module = unsafe { Module::from_base("TheGreatCircle.exe", "TheGreatCircle.exe", image.as_ptr() as usize) }.unwrap();
        banner(&module, &path);
        info!("Skip Intro Video: Address is TheGreatCircle.exe+1234");

        let contents = fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("stale"));
        assert!(contents.contains("GreatCircleFix v0.0.8 loaded."));
        assert!(contents.contains("Module Name: TheGreatCircle.exe"));
        assert!(contents.contains("Module Timestamp: 1737075661"));
        assert!(contents.contains("Skip Intro Video: Address is TheGreatCircle.exe+1234"));

        assert!(matches!(init(&path), Err(Error::LogInitFailed(_))));
    }

    #[test]
    /// An unwritable log path is reported
    fn test_init_bad_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("GreatCircleFix.log");
        assert!(matches!(init(&path), Err(Error::LogInitFailed(_))));
    }
}
