//! This module contains a byte patcher

use std::mem::ManuallyDrop;
use std::ptr;

use super::{PatchGuard, PatchRecord, Patcher};

/// Patcher for patching memory locations with byte arrays.
/// This patcher never fails.
#[derive(Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = ();
    type Guard = BytePatchGuard;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        Ok(BytePatchGuard::patch(location, patch))
    }
}
/// Guard for byte-patches
///
/// See [`BytePatcher`].
pub struct BytePatchGuard {
    /// What was replaced, and where
    record: PatchRecord,
}
impl BytePatchGuard {
    /// Patches a location, returning a guard for unpatching
    ///
    /// # Safety
    ///
    /// `location` must be a valid pointer
    unsafe fn patch(location: *mut u8, patch: &[u8]) -> Self {
        let mut original = vec![0u8; patch.len()];

        // Safety: caller must pass in a `location` pointer that is valid for the full length of the patch
        ptr::copy(location, original.as_mut_ptr(), patch.len());

        // Safety: caller must ensure that `location` is writable
        ptr::copy(patch.as_ptr(), location, patch.len());

        Self {
            record: PatchRecord {
                address: location as usize,
                original,
                patched: patch.to_vec(),
            },
        }
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    fn record(&self) -> &PatchRecord {
        &self.record
    }

    fn commit(self) -> PatchRecord {
        let this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the record is moved out exactly once
        unsafe { ptr::read(&this.record) }
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        let record = &self.record;
        // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
        unsafe {
            ptr::copy(
                record.original.as_ptr(),
                record.address as *mut u8,
                record.original.len(),
            );
        }
    }
}
