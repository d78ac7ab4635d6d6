//! # Scan
//!
//! Locates byte signatures inside a mapped memory region and resolves the
//! RIP-relative operands of the instructions found there

mod pattern;

use std::ops::Range;
use std::slice;

use thiserror::Error;

pub use pattern::{Pattern, PatternError};

/// Error for addresses that fall outside of a region
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{address:#x}..+{len:#x} lies outside of {base:#x}..{end:#x}")]
pub struct OutOfBounds {
    /// Start of the rejected access
    pub address: usize,
    /// Length of the rejected access
    pub len: usize,
    /// Start of the region
    pub base: usize,
    /// End of the region (exclusive)
    pub end: usize,
}

/// A contiguous range of mapped memory owned by the host process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First address of the region
    base: usize,
    /// Size of the region in bytes
    size: usize,
}

impl Region {
    /// Creates a region descriptor
    ///
    /// # Safety
    ///
    /// `base..base + size` must be address space of the current process that stays mapped
    /// for as long as the region is used. Unreadable pages inside the range are tolerated by [`scan`].
    pub unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Describes the memory behind a slice
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            base: data.as_ptr() as usize,
            size: data.len(),
        }
    }

    /// First address of the region
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the region in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Address range covered by the region
    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.size
    }

    /// Whether `address..address + len` is entirely inside the region
    pub fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base
            && address
                .checked_add(len)
                .map_or(false, |end| end <= self.base + self.size)
    }

    /// Returns `address` if `address..address + len` is inside the region
    pub fn check(&self, address: usize, len: usize) -> Result<usize, OutOfBounds> {
        if self.contains(address, len) {
            Ok(address)
        } else {
            Err(OutOfBounds {
                address,
                len,
                base: self.base,
                end: self.base + self.size,
            })
        }
    }

    /// Splits the region into runs of readable memory.
    ///
    /// Adjacent readable mappings are merged so that a signature can span them.
    /// If the OS cannot describe the range at all, the whole region is assumed readable.
    fn readable_runs(&self) -> Vec<Range<usize>> {
        let query = match region::query_range(self.base as *const u8, self.size) {
            Ok(query) => query,
            Err(_) => return vec![self.range()],
        };

        let mut runs: Vec<Range<usize>> = Vec::new();
        for mapping in query.flatten() {
            if mapping.is_guarded() || !mapping.protection().contains(region::Protection::READ) {
                continue;
            }
            let range = mapping.as_range();
            // clamp the mapping to our region, mappings may start before or end after it
            let start = range.start.max(self.base);
            let end = range.end.min(self.base + self.size);
            if start >= end {
                continue;
            }
            match runs.last_mut() {
                Some(last) if last.end == start => last.end = end,
                _ => runs.push(start..end),
            }
        }
        runs
    }
}

/// Scans `region` for `pattern`, returning the absolute address of the first match.
///
/// Memory is visited in ascending address order and pages that are not readable are skipped.
pub fn scan(region: &Region, pattern: &Pattern) -> Option<usize> {
    region.readable_runs().into_iter().find_map(|run| {
        // Safety: `Region::new` requires the range to be mapped, and we only look at readable runs
        let data = unsafe { slice::from_raw_parts(run.start as *const u8, run.end - run.start) };
        pattern.find_in(data).map(|offset| run.start + offset)
    })
}

/// Computes the target of a RIP-relative operand.
///
/// The result is `instruction + instruction_len + disp32`, where `disp32` is the little-endian
/// signed displacement stored at `instruction + displacement_offset`.
///
/// # Safety
///
/// `instruction + displacement_offset` must be readable for 4 bytes
pub unsafe fn resolve_rip_relative(
    instruction: usize,
    displacement_offset: usize,
    instruction_len: usize,
) -> usize {
    let displacement = ((instruction + displacement_offset) as *const i32).read_unaligned();
    (instruction + instruction_len).wrapping_add_signed(displacement as isize)
}

/// Bound-checked variant of [`resolve_rip_relative`].
///
/// Both the displacement and the resulting address must lie inside `region`.
pub fn resolve_in(
    region: &Region,
    instruction: usize,
    displacement_offset: usize,
    instruction_len: usize,
) -> Result<usize, OutOfBounds> {
    region.check(instruction, instruction_len)?;
    let displacement = region.check(instruction + displacement_offset, 4)?;
    if displacement + 4 > instruction + instruction_len {
        return Err(OutOfBounds {
            address: displacement,
            len: 4,
            base: instruction,
            end: instruction + instruction_len,
        });
    }
    // Safety: the displacement was just checked to be inside the region
    let target = unsafe { resolve_rip_relative(instruction, displacement_offset, instruction_len) };
    region.check(target, 1)
}
