//! This module contains a patcher which adjusts memory permissions to patch read-only data

use log::error;
use region::Protection;
use thiserror::Error;

use super::{PatchGuard, PatchRecord, Patcher};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections: {0}")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0:?}")]
    CustomError(E),
}
impl From<()> for PermissionError<()> {
    fn from(e: ()) -> Self {
        Self::CustomError(e)
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the patch, and then reverting the permissions.
///
/// Patched code is made visible to instruction fetch before the permissions are reverted.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
///
/// As always, casting a `&T` or `&mut T` to a `*mut u8` for use with `PermissionWrapper` can result in  undefined behavior because rust assumes `&T` will never change and `&mut T` will only be changed via that reference.
/// The `*mut u8` **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

/// Makes freshly written code visible to instruction fetch
#[cfg(windows)]
fn flush_instruction_cache(location: *const u8, len: usize) {
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    // Safety: the pseudo-handle of the current process is always valid
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), location.cast(), len);
    }
}

/// Makes freshly written code visible to instruction fetch
#[cfg(not(windows))]
fn flush_instruction_cache(_location: *const u8, _len: usize) {
    // x86 snoops stores into the instruction stream, nothing to do
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;
    type Guard = PermissionWrapperGuard<P::Guard>;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        let _guard = region::protect_with_handle(location, patch.len(), Protection::all())?;
        let guard = self.patcher.patch(location, patch)?;
        flush_instruction_cache(location, patch.len());
        Ok(PermissionWrapperGuard::guard(guard, location, patch.len()))
    }
}

/// Permission guard for the underlying patch guard
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher. `Option` so that we can drop it in our [`Drop::drop`] impl
    guard: Option<G>,
    /// Location of the patch
    location: *const u8,
    /// Length of the patch
    len: usize,
}
impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Wrap a patcher's guard. When this guard is dropped, the underlying guard will also be dropped with its target location made writable
    fn guard(guard: G, location: *const u8, len: usize) -> Self {
        let guard = Some(guard);
        Self {
            guard,
            location,
            len,
        }
    }
}
unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    fn record(&self) -> &PatchRecord {
        // `self.guard` is only taken in `commit` and `drop`
        match &self.guard {
            Some(guard) => guard.record(),
            None => unreachable!("permission guard used after release"),
        }
    }

    fn commit(mut self) -> PatchRecord {
        // with the inner guard gone our own drop has nothing left to restore
        match self.guard.take() {
            Some(guard) => guard.commit(),
            None => unreachable!("permission guard used after release"),
        }
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        // Safety: we already changed these permissions once to apply the patch
        match unsafe { region::protect_with_handle(self.location, self.len, Protection::all()) } {
            Ok(_protection) => {
                guard.restore();
                flush_instruction_cache(self.location, self.len);
            }
            Err(e) => {
                // restoring without write access would fault, so the patch stays
                error!("failed to unprotect {:p} for restore: {e}", self.location);
                guard.commit();
            }
        }
    }
}

// Safety: the guard only refers to process memory through plain addresses
unsafe impl<G: PatchGuard + Send> Send for PermissionWrapperGuard<G> {}
