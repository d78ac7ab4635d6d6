//! Which fixes to apply, read from the INI file next to the DLL

use std::path::Path;

use ini::Ini;
use log::{info, warn};

use crate::Error;

/// Feature switches. Anything not mentioned in the file stays off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    /// `[Skip Intro]`
    pub skip_intro: bool,
    /// `[Unrestrict CVars]`
    pub unrestrict_cvars: bool,
    /// `[Fix Cutscene FOV]`
    pub fix_cutscene_fov: bool,
    /// `[Fix Culling]`
    pub fix_culling: bool,
    /// `[Fix DLSS DOF Denoising]`
    pub fix_dlss_dof_denoising: bool,
    /// `[Cutscene Frame Generation]`
    pub cutscene_frame_generation: bool,
    /// `[Cutscene Framerate Unlock]`
    pub cutscene_framerate_unlock: bool,
}

/// Section names, in the order they're logged
const SECTIONS: [&str; 7] = [
    "Skip Intro",
    "Unrestrict CVars",
    "Fix Cutscene FOV",
    "Fix Culling",
    "Fix DLSS DOF Denoising",
    "Cutscene Frame Generation",
    "Cutscene Framerate Unlock",
];

/// Key every section uses
const ENABLED: &str = "Enabled";

impl Config {
    /// Reads the config file at `path`
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.is_file() {
            return Err(Error::ConfigMissing(path.to_owned()));
        }
        let ini = Ini::load_from_file(path).map_err(|e| Error::ConfigInvalid {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        info!("Config file: {}", path.display());
        Ok(Self::from_ini(&ini))
    }

    /// Parses config file contents
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let ini = Ini::load_from_str(contents).map_err(|e| Error::ConfigInvalid {
            path: Default::default(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_ini(&ini))
    }

    /// Reads the `Enabled` key of every known section
    fn from_ini(ini: &Ini) -> Self {
        let enabled = |section: &str| {
            ini.section(Some(section))
                .and_then(|properties| properties.get(ENABLED))
                .map_or(false, |value| {
                    parse_bool(value).unwrap_or_else(|| {
                        warn!("Config Parse: {section}: unrecognised value {value:?}, treating as false");
                        false
                    })
                })
        };
        let [
            skip_intro,
            unrestrict_cvars,
            fix_cutscene_fov,
            fix_culling,
            fix_dlss_dof_denoising,
            cutscene_frame_generation,
            cutscene_framerate_unlock,
        ] = SECTIONS.map(enabled);

        Self {
            skip_intro,
            unrestrict_cvars,
            fix_cutscene_fov,
            fix_culling,
            fix_dlss_dof_denoising,
            cutscene_frame_generation,
            cutscene_framerate_unlock,
        }
    }

    /// Section names paired with their values
    pub fn entries(&self) -> [(&'static str, bool); 7] {
        [
            (SECTIONS[0], self.skip_intro),
            (SECTIONS[1], self.unrestrict_cvars),
            (SECTIONS[2], self.fix_cutscene_fov),
            (SECTIONS[3], self.fix_culling),
            (SECTIONS[4], self.fix_dlss_dof_denoising),
            (SECTIONS[5], self.cutscene_frame_generation),
            (SECTIONS[6], self.cutscene_framerate_unlock),
        ]
    }

    /// Writes every value to the log
    pub fn log(&self) {
        for (section, value) in self.entries() {
            info!("Config Parse: {section}: {value}");
        }
        info!("----------");
    }
}

/// Reads an INI boolean, ignoring case and any trailing comment
fn parse_bool(value: &str) -> Option<bool> {
    let value = value
        .split(|c| c == ';' || c == '#')
        .next()
        .unwrap_or_default()
        .trim();
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{parse_bool, Config};
    use crate::Error;

    const SHIPPED: &str = "\
[Skip Intro]
Enabled = true

[Unrestrict CVars]
Enabled = true

[Fix Cutscene FOV]
Enabled = true

[Fix Culling]
Enabled = false

[Fix DLSS DOF Denoising]
Enabled = true

[Cutscene Frame Generation]
Enabled = false

[Cutscene Framerate Unlock]
Enabled = true
";

    #[test]
    /// The shipped config parses into the matching switches
    fn test_parse_all_sections() {
        let config = Config::parse(SHIPPED).unwrap();
        assert_eq!(
            config,
            Config {
                skip_intro: true,
                unrestrict_cvars: true,
                fix_cutscene_fov: true,
                fix_culling: false,
                fix_dlss_dof_denoising: true,
                cutscene_frame_generation: false,
                cutscene_framerate_unlock: true,
            }
        );
    }

    #[test]
    /// Missing sections and keys leave the feature off
    fn test_missing_keys() {
        let config = Config::parse("[Skip Intro]\nEnabled = true\n[Fix Culling]\nOther = true\n").unwrap();
        assert!(config.skip_intro);
        assert!(!config.fix_culling);
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    /// Values are case-insensitive and may carry comments
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" 1 "), Some(true));
        assert_eq!(parse_bool("on ; comment"), Some(true));
        assert_eq!(parse_bool("No # comment"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    /// Files are read from disk, a missing one is an error
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GreatCircleFix.ini");

        assert!(matches!(Config::load(&path), Err(Error::ConfigMissing(p)) if p == path));

        fs::write(&path, SHIPPED).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::parse(SHIPPED).unwrap());
    }

    #[test]
    /// Entries come out in log order
    fn test_entries_order() {
        let config = Config {
            cutscene_framerate_unlock: true,
            ..Default::default()
        };
        let entries = config.entries();
        assert_eq!(entries[0], ("Skip Intro", false));
        assert_eq!(entries[6], ("Cutscene Framerate Unlock", true));
    }
}
