//! Skips the intro videos

use log::info;

use crate::hook::Context;
use crate::poll::Sleeper;

use super::{report, Fixer, Signature};

/// `setnz` on the "play intro videos" check
pub const SKIP_INTRO_VIDEO: Signature = Signature {
    name: "Skip Intro Video",
    pattern: "0F 95 ?? ?? ?? FF 15 ?? ?? ?? ?? 48 8B ?? ?? 48 8D ?? ?? ?? ?? ??",
    offset: 0,
};

/// Clears ZF so the check reads as "skip"
pub fn skip_intro_video(ctx: &mut Context) {
    ctx.set_zero_flag(false);
    info!("{}: Skipped intro videos.", SKIP_INTRO_VIDEO.name);
}

impl<S: Sleeper> Fixer<S> {
    /// Hooks the intro video check if enabled
    pub(super) fn skip_intro(&mut self) {
        if self.config.skip_intro {
            let result = self
                .find(&SKIP_INTRO_VIDEO)
                .and_then(|address| self.hook(address, skip_intro_video));
            report(SKIP_INTRO_VIDEO.name, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::fix::tests::{bytes, TestImage};
    use crate::hook::Context;

    use super::{skip_intro_video, SKIP_INTRO_VIDEO};

    #[test]
    /// The video check is forced to skip
    fn test_clears_zero_flag() {
        let mut ctx = Context {
            rflags: 0x246,
            ..Default::default()
        };
        skip_intro_video(&mut ctx);
        assert!(!ctx.zero_flag());
        assert_eq!(ctx.rflags, 0x206);
    }

    #[test]
    /// The hook goes in when enabled, and comes out with the fixer
    fn test_hook_installed() {
        let image = TestImage::new(&[(0x200, bytes(&SKIP_INTRO_VIDEO))]);

        let mut fixer = image.fixer(Config::default());
        fixer.skip_intro();
        assert!(fixer.hooks().is_empty());

        let mut fixer = image.fixer(Config {
            skip_intro: true,
            ..Default::default()
        });
        fixer.skip_intro();
        assert_eq!(fixer.hooks().len(), 1);
        assert_eq!(fixer.hooks()[0].target(), image.at(0x200));
        assert_eq!(image.memory[0x200], 0xE9);

        drop(fixer);
        assert_eq!(image.memory[0x200..0x205], [0x0F, 0x95, 0x11, 0x11, 0x11]);
    }
}
