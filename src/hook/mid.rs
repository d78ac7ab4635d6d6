//! # Mid Hook
//!
//! Hooks an arbitrary instruction with a `jmp rel32` into a trampoline that
//! 1. saves the register state and calls a Rust callback with it,
//! 2. restores the (possibly modified) register state,
//! 3. runs the overwritten instructions from their new location,
//! 4. jumps back to the first instruction after the overwritten ones.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::slice;

use log::error;
use thiserror::Error;

use crate::alloc::{allocate_executable, AllocError, ExecutableMemory};
use crate::code::x64::{self, CodeError, JMP_REL32_LEN, MAX_INSTR_LEN};
use crate::patcher::byte::{BytePatchGuard, BytePatcher};
use crate::patcher::mem::{PermissionError, PermissionWrapper, PermissionWrapperGuard};
use crate::patcher::{PatchGuard, Patcher};

use super::Context;

/// Space reserved for a trampoline: context stub, relocated instructions and the jump back
const TRAMPOLINE_SIZE: usize = 512;

/// Filler after the jump at the hook site
const NOP: u8 = 0x90;

/// Callback type run by mid hooks
type Callback = dyn Fn(&mut Context) + Send + Sync + 'static;

/// Errors that can happen while installing a mid hook
#[derive(Debug, Error)]
pub enum HookError {
    /// Couldn't get executable memory close enough to the target
    #[error("{0}")]
    Alloc(#[from] AllocError),
    /// The target's instructions couldn't be decoded or moved
    #[error("{0}")]
    Code(#[from] CodeError),
    /// The generated trampoline doesn't fit its buffer
    #[error("trampoline needs {0} bytes")]
    TrampolineTooLarge(usize),
    /// The trampoline isn't reachable with a `jmp rel32`
    #[error("trampoline at {trampoline:#x} is out of jump range of {target:#x}")]
    OutOfRange {
        /// Hooked address
        target: usize,
        /// Trampoline address
        trampoline: usize,
    },
    /// Writing the jump to the target failed
    #[error("{0}")]
    Patch(#[from] PermissionError<()>),
}

/// An installed mid-function hook.
///
/// Dropping the hook restores the original instructions and frees the trampoline.
/// Use [`MidHook::persist`] to keep it installed for the rest of the process.
pub struct MidHook {
    /// Jump written over the target. Declared first so the original code comes back before the trampoline goes away
    patch: PermissionWrapperGuard<BytePatchGuard>,
    /// Stub, relocated instructions and the jump back
    #[allow(dead_code)]
    trampoline: ExecutableMemory,
    /// Callback run on every hit. Double boxed so the stub can hold a thin pointer to it
    #[allow(dead_code)]
    callback: Box<Box<Callback>>,
    /// Hooked address
    target: usize,
}

impl MidHook {
    /// Installs `callback` to run every time execution reaches `target`.
    ///
    /// # Safety
    ///
    /// - `target` must be the start of an instruction in executable memory, with at least
    ///   `5 + 14` readable bytes following it
    /// - the instructions covering the first 5 bytes are moved, so nothing may jump into the
    ///   middle of them and no thread may be executing them while the hook is installed or removed
    pub unsafe fn install<F>(target: usize, callback: F) -> Result<Self, HookError>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        let code = slice::from_raw_parts(target as *const u8, JMP_REL32_LEN + MAX_INSTR_LEN - 1);
        let stolen = x64::steal(code, target as u64, JMP_REL32_LEN)?;
        let stolen_len = x64::encoded_len(&stolen);

        let callback: Box<Box<Callback>> = Box::new(Box::new(callback));
        let data = &*callback as *const Box<Callback> as usize;

        // build the trampoline: [context stub][moved instructions][jmp back]
        let mut trampoline = allocate_executable(target, TRAMPOLINE_SIZE)?;
        let base = trampoline.address();
        let stub = x64::context_stub(base as u64, dispatch as *const () as usize, data)?;
        let moved = x64::relocate(&stolen, (base + stub.len()) as u64)?;
        let back = x64::jmp_abs(target + stolen_len);

        let total = stub.len() + moved.len() + back.len();
        if total > trampoline.len() {
            return Err(HookError::TrampolineTooLarge(total));
        }
        let mut offset = 0;
        for part in [&stub[..], &moved[..], &back[..]] {
            trampoline[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }

        // then send the target there
        let mut jump = x64::jmp_rel32(target, base)
            .ok_or(HookError::OutOfRange {
                target,
                trampoline: base,
            })?
            .to_vec();
        jump.resize(stolen_len, NOP);
        let patch = PermissionWrapper::new(BytePatcher::new()).patch(target as *mut u8, &jump)?;

        Ok(Self {
            patch,
            trampoline,
            callback,
            target,
        })
    }

    /// Hooked address
    pub fn target(&self) -> usize {
        self.target
    }

    /// Bytes that were overwritten at the target
    pub fn original_bytes(&self) -> &[u8] {
        &self.patch.record().original
    }

    /// Leaves the hook installed for the lifetime of the process
    pub fn persist(self) {
        mem::forget(self);
    }
}

/// Entry point called by every trampoline stub
extern "C" fn dispatch(context: *mut Context, callback: *const Box<Callback>) {
    // Safety: the stub passes the context it saved on its own stack and the callback owned by the hook
    let (context, callback) = unsafe { (&mut *context, &*callback) };
    if panic::catch_unwind(AssertUnwindSafe(|| callback(context))).is_err() {
        error!("mid hook callback panicked, registers left as they were");
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::alloc::{allocate_executable, ExecutableMemory};

    use super::MidHook;

    /// Places `code` in fresh executable memory
    fn function(code: &[u8]) -> ExecutableMemory {
        let mut memory = allocate_executable(function as *const () as usize, 64).unwrap();
        memory.fill(0xCC);
        memory[..code.len()].copy_from_slice(code);
        memory
    }

    #[test]
    /// The callback runs once per execution, sees the live registers and can change them
    fn test_hook_registers() {
        // mov eax, 1; add eax, 2; ret
        let memory = function(&[
            0xB8, 0x01, 0x00, 0x00, 0x00, 0x05, 0x02, 0x00, 0x00, 0x00, 0xC3,
        ]);
        let f: extern "C" fn() -> u32 = unsafe { mem::transmute(memory.address()) };
        assert_eq!(f(), 3);

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicU64::new(0));
        let hook = {
            let (hits, seen) = (hits.clone(), seen.clone());
            unsafe {
                MidHook::install(memory.address() + 5, move |ctx| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    seen.store(ctx.rax, Ordering::SeqCst);
                    ctx.rax = 40;
                })
            }
            .unwrap()
        };
        assert_eq!(hook.original_bytes(), [0x05, 0x02, 0x00, 0x00, 0x00]);

        assert_eq!(f(), 42);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert_eq!(f(), 42);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // unhooking puts the original code back
        drop(hook);
        assert_eq!(f(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    /// xor eax, eax; mov ecx, 0; jz +6; mov eax, 7; ret; mov eax, 3; ret
    const BRANCHY: [u8; 21] = [
        0x31, 0xC0, 0xB9, 0x00, 0x00, 0x00, 0x00, 0x74, 0x06, 0xB8, 0x07, 0x00, 0x00, 0x00, 0xC3,
        0xB8, 0x03, 0x00, 0x00, 0x00, 0xC3,
    ];

    #[test]
    /// Clearing the zero flag makes the following `jz` fall through
    fn test_hook_flags() {
        let memory = function(&BRANCHY);
        let f: extern "C" fn() -> u32 = unsafe { mem::transmute(memory.address()) };
        assert_eq!(f(), 3);

        let hook = unsafe {
            MidHook::install(memory.address() + 2, |ctx| {
                assert!(ctx.zero_flag());
                ctx.set_zero_flag(false);
            })
        }
        .unwrap();

        assert_eq!(f(), 7);
        drop(hook);
        assert_eq!(f(), 3);
    }

    #[test]
    /// A hooked conditional jump still reaches its original target from the trampoline
    fn test_hook_relocated_branch() {
        let memory = function(&BRANCHY);
        let f: extern "C" fn() -> u32 = unsafe { mem::transmute(memory.address()) };

        let fall_through = Arc::new(AtomicBool::new(false));
        let hook = {
            let fall_through = fall_through.clone();
            unsafe {
                MidHook::install(memory.address() + 7, move |ctx| {
                    if fall_through.load(Ordering::SeqCst) {
                        ctx.set_zero_flag(false);
                    }
                })
            }
            .unwrap()
        };
        // jz (2 bytes) and mov eax, 7 (5 bytes) were moved
        assert_eq!(hook.original_bytes().len(), 7);

        assert_eq!(f(), 3);
        fall_through.store(true, Ordering::SeqCst);
        assert_eq!(f(), 7);

        hook.persist();
    }

    #[test]
    /// Vector registers can be read and replaced
    fn test_hook_xmm() {
        // addss xmm0, xmm1; ret
        let memory = function(&[0xF3, 0x0F, 0x58, 0xC1, 0xC3]);
        let f: extern "C" fn(f32, f32) -> f32 = unsafe { mem::transmute(memory.address()) };
        assert_eq!(f(1.5, 100.0), 101.5);

        let seen = Arc::new(AtomicU64::new(0));
        let hook = {
            let seen = seen.clone();
            unsafe {
                MidHook::install(memory.address(), move |ctx| {
                    seen.store(ctx.xmm[0].f32(0).to_bits() as u64, Ordering::SeqCst);
                    ctx.xmm[1].set_f32(0, 2.0);
                })
            }
            .unwrap()
        };

        assert_eq!(f(1.5, 100.0), 3.5);
        assert_eq!(f32::from_bits(seen.load(Ordering::SeqCst) as u32), 1.5);
        drop(hook);
    }

    #[test]
    /// A panicking callback doesn't take the host down
    fn test_hook_panic() {
        let memory = function(&[
            0xB8, 0x01, 0x00, 0x00, 0x00, 0x05, 0x02, 0x00, 0x00, 0x00, 0xC3,
        ]);
        let f: extern "C" fn() -> u32 = unsafe { mem::transmute(memory.address()) };

        let hook = unsafe { MidHook::install(memory.address() + 5, |_| panic!("boom")) }.unwrap();
        assert_eq!(f(), 3);
        drop(hook);
    }
}
