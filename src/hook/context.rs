//! Register state handed to mid-hook callbacks

use std::fmt;

/// Bit of the zero flag in `rflags`
pub const ZERO_FLAG: u64 = 1 << 6;

/// A 128-bit vector register
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Xmm(pub [u8; 16]);

impl Xmm {
    /// Reads single-precision lane `lane` (0..4)
    pub fn f32(&self, lane: usize) -> f32 {
        f32::from_le_bytes(self.lane::<4>(lane))
    }

    /// Writes single-precision lane `lane` (0..4)
    pub fn set_f32(&mut self, lane: usize, value: f32) {
        self.0[lane * 4..lane * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads double-precision lane `lane` (0..2)
    pub fn f64(&self, lane: usize) -> f64 {
        f64::from_le_bytes(self.lane::<8>(lane))
    }

    /// Writes double-precision lane `lane` (0..2)
    pub fn set_f64(&mut self, lane: usize, value: f64) {
        self.0[lane * 8..lane * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads 64-bit integer lane `lane` (0..2)
    pub fn u64(&self, lane: usize) -> u64 {
        u64::from_le_bytes(self.lane::<8>(lane))
    }

    /// Copies out lane `lane` of `N` bytes
    fn lane<const N: usize>(&self, lane: usize) -> [u8; N] {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.0[lane * N..lane * N + N]);
        bytes
    }
}

impl fmt::Debug for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xmm({:#034x})", u128::from_le_bytes(self.0))
    }
}

/// CPU state at the hooked instruction.
///
/// The layout mirrors the order in which the hook stub saves registers, so this is a live
/// view of the saved state: anything written here is loaded back into the CPU before the
/// hooked instruction runs. `rsp` is the only exception, changing it has no effect.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    /// `xmm0`-`xmm15`
    pub xmm: [Xmm; 16],
    /// `r15`
    pub r15: u64,
    /// `r14`
    pub r14: u64,
    /// `r13`
    pub r13: u64,
    /// `r12`
    pub r12: u64,
    /// `r11`
    pub r11: u64,
    /// `r10`
    pub r10: u64,
    /// `r9`
    pub r9: u64,
    /// `r8`
    pub r8: u64,
    /// `rdi`
    pub rdi: u64,
    /// `rsi`
    pub rsi: u64,
    /// `rbp`
    pub rbp: u64,
    /// `rsp` before the hook ran, read-only
    pub rsp: u64,
    /// `rbx`
    pub rbx: u64,
    /// `rdx`
    pub rdx: u64,
    /// `rcx`
    pub rcx: u64,
    /// `rax`
    pub rax: u64,
    /// `rflags`, see [`ZERO_FLAG`]
    pub rflags: u64,
}

impl Context {
    /// Whether the zero flag is set
    pub fn zero_flag(&self) -> bool {
        self.rflags & ZERO_FLAG != 0
    }

    /// Sets or clears the zero flag, flipping the outcome of a following `jz`/`jnz`/`setnz`
    pub fn set_zero_flag(&mut self, set: bool) {
        if set {
            self.rflags |= ZERO_FLAG;
        } else {
            self.rflags &= !ZERO_FLAG;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem::{offset_of, size_of};

    use super::{Context, Xmm};

    #[test]
    /// The layout has to match what the stub pushes
    fn test_layout() {
        assert_eq!(size_of::<Xmm>(), 16);
        assert_eq!(size_of::<Context>(), 16 * 16 + 17 * 8);
        assert_eq!(offset_of!(Context, r15), 0x100);
        assert_eq!(offset_of!(Context, rsp), 0x100 + 11 * 8);
        assert_eq!(offset_of!(Context, rax), 0x100 + 15 * 8);
        assert_eq!(offset_of!(Context, rflags), 0x100 + 16 * 8);
    }

    #[test]
    /// Lanes are addressed by element width
    fn test_xmm_lanes() {
        let mut xmm = Xmm::default();
        xmm.set_f32(0, 3440.0);
        xmm.set_f32(3, -1.5);
        assert_eq!(xmm.f32(0), 3440.0);
        assert_eq!(xmm.f32(1), 0.0);
        assert_eq!(xmm.f32(3), -1.5);

        xmm.set_f64(1, 2.37);
        assert_eq!(xmm.f64(1), 2.37);
        assert_eq!(xmm.u64(0), 3440.0f32.to_bits() as u64);
    }

    #[test]
    /// Zero flag helpers leave the other flags alone
    fn test_zero_flag() {
        let mut context = Context {
            rflags: 0x246,
            ..Default::default()
        };
        assert!(context.zero_flag());

        context.set_zero_flag(false);
        assert_eq!(context.rflags, 0x206);

        context.set_zero_flag(true);
        assert_eq!(context.rflags, 0x246);
    }
}
