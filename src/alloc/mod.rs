//! Allocates executable buffers near a given address
//!
//! Trampolines are entered and left with `rel32` jumps, so they have to live within
//! ±2 GiB of the code they're attached to. Memory is mapped in pools close to the
//! requested origin and handed out in slices; pools are kept for the lifetime of the process.

use std::ops::{Deref, DerefMut, Range};
use std::slice;
use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;
use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

pub mod search;

use self::search::{Direction, FreeBlocks, GRANULARITY};

/// The furthest distance between a target and its trampoline, with some slack so every byte
/// of a pool is reachable from the origin
pub const DETOUR_RANGE: usize = 0x7FF0_0000;

/// Lowest address we'll ever try to map, below this the OS refuses fixed mappings
const MIN_ADDRESS: usize = 0x1_0000;

/// Errors that occur while allocating near an address
#[derive(Debug, Error)]
pub enum AllocError {
    /// No free memory could be mapped within reach of the origin
    #[error("no free memory within reach of {0:#x}")]
    OutOfRange(usize),
    /// The requested size doesn't fit in a single pool
    #[error("allocation of {0:#x} bytes is larger than a pool")]
    TooLarge(usize),
}

/// A handle for allocated executable memory. The slice returns to its pool on drop.
pub struct ExecutableMemory {
    /// Allocation inside one of the pools
    data: SliceBox<u8>,
}

impl ExecutableMemory {
    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.deref()
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.deref_mut()
    }
}

/// Size of every pool we map
const POOL_SIZE: usize = GRANULARITY;

lazy_static! {
    /// Every pool mapped so far
    static ref POOLS: Mutex<Vec<SlicePool<u8>>> = Mutex::new(Vec::new());
}

/// Allocates `size` bytes of readable, writable and executable memory within [`DETOUR_RANGE`] of `origin`.
///
/// The contents of the returned buffer are unspecified.
pub fn allocate_executable(origin: usize, size: usize) -> Result<ExecutableMemory, AllocError> {
    if size == 0 || size > POOL_SIZE {
        return Err(AllocError::TooLarge(size));
    }
    let reach = origin.saturating_sub(DETOUR_RANGE).max(MIN_ADDRESS)
        ..origin.saturating_add(DETOUR_RANGE).saturating_sub(POOL_SIZE);

    let mut pools = POOLS.lock().unwrap_or_else(PoisonError::into_inner);

    // Reuse any pool that is close enough and still has room
    let existing = pools
        .iter_mut()
        .filter(|pool| reach.contains(&(pool.as_ptr() as usize)))
        .find_map(|pool| pool.alloc(size));
    if let Some(data) = existing {
        return Ok(ExecutableMemory { data });
    }

    let pool = map_pool_near(origin, &reach).ok_or(AllocError::OutOfRange(origin))?;
    let data = pool.alloc(size).ok_or(AllocError::OutOfRange(origin))?;
    pools.push(pool);
    Ok(ExecutableMemory { data })
}

/// Maps a new pool at the first free block found around `origin`.
///
/// Higher addresses are tried first (macOS can't map below the process image).
fn map_pool_near(origin: usize, reach: &Range<usize>) -> Option<SlicePool<u8>> {
    let up = FreeBlocks::new(origin, reach.clone(), POOL_SIZE, Direction::Up);
    let down = FreeBlocks::new(origin, reach.clone(), POOL_SIZE, Direction::Down);
    up.chain(down).find_map(|address| {
        mmap::MemoryMap::new(
            POOL_SIZE,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const u8),
            ],
        )
        .ok()
        // a mapping that was placed elsewhere is useless to us
        .filter(|map| map.data() as usize == address)
        .map(|map| SlicePool::new(PoolMemory(map)))
    })
}

/// A wrapper for making a memory map compatible with `SlicePool`.
struct PoolMemory(mmap::MemoryMap);

impl AsRef<[u8]> for PoolMemory {
    fn as_ref(&self) -> &[u8] {
        // Safety: the map is valid for its full length while we own it
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for PoolMemory {
    fn as_mut(&mut self) -> &mut [u8] {
        // Safety: the map is valid for its full length while we own it
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// Safety: the map is only reached through the pool, which does its own locking
unsafe impl Send for PoolMemory {}
unsafe impl Sync for PoolMemory {}

#[cfg(test)]
mod tests {
    use super::{allocate_executable, AllocError, DETOUR_RANGE};

    #[test]
    /// Allocations land within jump range of the origin and can be written to
    fn test_allocate_near_code() {
        let origin = test_allocate_near_code as *const () as usize;

        let mut first = allocate_executable(origin, 64).unwrap();
        let second = allocate_executable(origin, 64).unwrap();

        for memory in [&*first, &*second] {
            let distance = (memory.as_ptr() as usize).abs_diff(origin);
            assert!(distance < DETOUR_RANGE, "{distance:#x} is out of reach");
            assert_eq!(memory.len(), 64);
        }
        assert_ne!(first.address(), second.address());

        first.fill(0xCC);
        assert!(first.iter().all(|b| *b == 0xCC));
    }

    #[test]
    /// Zero-sized and oversized requests are refused
    fn test_reject_sizes() {
        let origin = test_reject_sizes as *const () as usize;
        assert!(matches!(
            allocate_executable(origin, 0),
            Err(AllocError::TooLarge(0))
        ));
        assert!(matches!(
            allocate_executable(origin, 0x10_0000),
            Err(AllocError::TooLarge(0x10_0000))
        ));
    }
}
