//! # Patch
//!
//! This module covers patchers, which are used to overwrite and restore locations in memory

pub mod byte;
pub mod mem;

use std::mem::size_of;
use std::slice;

use self::byte::BytePatcher;
use self::mem::{PermissionError, PermissionWrapper};

/// Everything known about a single write: where it went, what was there before and what replaced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    /// Address of the first patched byte
    pub address: usize,
    /// Bytes that were at `address` before the patch
    pub original: Vec<u8>,
    /// Bytes that were written
    pub patched: Vec<u8>,
}

/// All patchers save state from where they patched and are able to revert on-command
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use `()`.
    type Error;
    /// Guard type for the patcher. When this guard is dropped, the location should be restored.
    type Guard: PatchGuard;

    /// Patches a given location.
    ///
    /// # Safety
    ///
    /// This function is intended to be used on arbitrary memory addresses, but must be valid for the supplied patcher
    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error>;
}

/// Guard for a patch
///
/// # Safety
///
/// Guard must fully unpatch the location when dropped, even if `restore` is not called
pub unsafe trait PatchGuard: Sized {
    /// Describes the patch this guard is holding
    fn record(&self) -> &PatchRecord;

    /// Keeps the patch in place for good, handing back its record
    fn commit(self) -> PatchRecord;

    /// Restores the original value of a patch
    fn restore(self) {
        // most implementations have their functionality in their [`Drop::drop`] implementation
    }
}

/// Writes `bytes` to `address` in (possibly read-only or executable) memory and keeps the write.
///
/// Page protections are lifted for the duration of the write and restored afterwards.
///
/// # Safety
///
/// `address` must be valid for `bytes.len()` bytes and no other thread may be executing or
/// reading the patched bytes while they're being written
pub unsafe fn write_bytes(address: usize, bytes: &[u8]) -> Result<PatchRecord, PermissionError<()>> {
    let wrapper = PermissionWrapper::new(BytePatcher::new());
    wrapper.patch(address as _, bytes).map(PatchGuard::commit)
}

/// Writes a plain value to `address` in its native (little-endian) representation.
///
/// # Safety
///
/// Same requirements as [`write_bytes`] for `size_of::<T>()` bytes
pub unsafe fn write_scalar<T: Copy>(address: usize, value: T) -> Result<PatchRecord, PermissionError<()>> {
    let bytes = slice::from_raw_parts(&value as *const T as *const u8, size_of::<T>());
    write_bytes(address, bytes)
}
