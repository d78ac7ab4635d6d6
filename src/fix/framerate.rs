//! Cutscene frame generation and framerate unlock

use log::info;

use crate::poll::Sleeper;
use crate::Error;

use super::{report, Fixer, Signature};

/// A fixed replacement for the bytes a signature points at
#[derive(Debug, Clone, Copy)]
pub struct BytePatch {
    /// Where to write
    pub signature: Signature,
    /// What to write
    pub bytes: &'static [u8],
}

/// Zeroes the `jnz` displacement that skips frame generation in cutscenes, newest layout last
pub const FRAME_GENERATION: [BytePatch; 2] = [
    BytePatch {
        signature: Signature {
            name: "Cutscene Frame Generation",
            pattern: "38 5F 5B 0F 85 ?? ?? ?? ?? 48",
            offset: 5,
        },
        bytes: &[0, 0, 0, 0],
    },
    BytePatch {
        signature: Signature {
            name: "Cutscene Frame Generation (Upd3)",
            pattern: "38 9F 87 00 00 00 0F 85 ?? ?? ?? ?? 48",
            offset: 8,
        },
        bytes: &[0, 0, 0, 0],
    },
];

/// Makes cutscenes use the game's frame timing instead of their own
pub const FRAMERATE_UNLOCK: [BytePatch; 2] = [
    BytePatch {
        signature: Signature {
            name: "Cutscene Framerate Unlock",
            pattern: "48 8B 41 28 48 8B 90 08 03 00 00",
            offset: 4,
        },
        // xor rdx, rdx
        bytes: &[0x48, 0x31, 0xD2, 0x90, 0x90, 0x90, 0x90],
    },
    BytePatch {
        // Update 2 checks the timing before using it, drop the branch instead
        signature: Signature {
            name: "Cutscene Framerate Unlock (Upd2)",
            pattern: "48 8B 41 28 48 39 98 08 03 00 00 75 1C",
            offset: 0xB,
        },
        bytes: &[0x90, 0x90],
    },
];

impl<S: Sleeper> Fixer<S> {
    /// Cutscene frame generation and framerate unlock
    pub(super) fn framerate(&mut self) {
        if self.config.cutscene_frame_generation {
            let result = self.apply_first(&FRAME_GENERATION, "Enabled cutscene frame generation.");
            report(FRAME_GENERATION[0].signature.name, result);
        }
        if self.config.cutscene_framerate_unlock {
            let result = self.apply_first(&FRAMERATE_UNLOCK, "Enabled framerate unlock.");
            report(FRAMERATE_UNLOCK[0].signature.name, result);
        }
    }

    /// Applies the first variant whose signature is in the image
    fn apply_first(&mut self, variants: &[BytePatch], done: &str) -> Result<(), Error> {
        let (variant, address) = self.find_any(variants, |variant| &variant.signature)?;
        self.patch(address, variant.bytes)?;
        info!("{}: {done}", variant.signature.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::fix::tests::{bytes, TestImage};

    use super::{FRAMERATE_UNLOCK, FRAME_GENERATION};

    /// Frame generation and framerate unlock both on
    fn both() -> Config {
        Config {
            cutscene_frame_generation: true,
            cutscene_framerate_unlock: true,
            ..Default::default()
        }
    }

    #[test]
    /// Launch version patterns are patched at their offsets
    fn test_original_layout() {
        let image = TestImage::new(&[
            (0x200, bytes(&FRAME_GENERATION[0].signature)),
            (0x300, bytes(&FRAMERATE_UNLOCK[0].signature)),
        ]);
        let mut fixer = image.fixer(both());
        fixer.framerate();

        assert_eq!(fixer.patches().len(), 2);
        assert_eq!(image.memory[0x203..0x20A], [0x0F, 0x85, 0, 0, 0, 0, 0x48]);
        assert_eq!(
            image.memory[0x300..0x30B],
            [0x48, 0x8B, 0x41, 0x28, 0x48, 0x31, 0xD2, 0x90, 0x90, 0x90, 0x90]
        );
    }

    #[test]
    /// When the original layout is gone the later update's layout is patched instead
    fn test_update_layouts() {
        let image = TestImage::new(&[
            (0x200, bytes(&FRAME_GENERATION[1].signature)),
            (0x300, bytes(&FRAMERATE_UNLOCK[1].signature)),
        ]);
        let mut fixer = image.fixer(both());
        fixer.framerate();

        assert_eq!(fixer.patches().len(), 2);
        assert_eq!(image.memory[0x206..0x20D], [0x0F, 0x85, 0, 0, 0, 0, 0x48]);
        assert_eq!(image.memory[0x30B..0x30D], [0x90, 0x90]);
        assert_eq!(fixer.patches()[1].original, [0x75, 0x1C]);
    }

    #[test]
    /// Nothing is touched when both switches are off
    fn test_disabled() {
        let image = TestImage::new(&[(0x200, bytes(&FRAME_GENERATION[0].signature))]);
        let mut fixer = image.fixer(Config::default());
        fixer.framerate();
        assert!(fixer.patches().is_empty());
        assert_eq!(image.memory[0x205..0x209], [0x11; 4]);
    }
}
