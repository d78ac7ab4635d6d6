//! Searches the address space for unmapped blocks close to a given address

use std::ops::Range;

/// Granularity of reservations. Windows can't place allocations on finer boundaries
pub const GRANULARITY: usize = 0x1_0000;

/// Direction for the block search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards higher addresses
    Up,
    /// Towards lower addresses
    Down,
}

/// An iterator yielding [`GRANULARITY`]-aligned addresses at which `len` bytes are entirely unmapped.
pub struct FreeBlocks {
    /// Addresses a block may start at
    reach: Range<usize>,
    /// Size of the wanted block
    len: usize,
    /// Which way we're walking
    direction: Direction,
    /// Next candidate
    current: Option<usize>,
}

impl FreeBlocks {
    /// Walks from `origin` in `direction` looking for free blocks of `len` bytes that start inside `reach`
    pub fn new(origin: usize, reach: Range<usize>, len: usize, direction: Direction) -> Self {
        let current = match direction {
            Direction::Up => Some(align_up(origin)),
            Direction::Down => align_down(origin).checked_sub(GRANULARITY),
        };
        Self {
            reach,
            len,
            direction,
            current,
        }
    }

    /// Moves the search past `occupied`
    fn skip(&mut self, occupied: Range<usize>) {
        self.current = match self.direction {
            Direction::Up => occupied.end.checked_add(GRANULARITY - 1).map(align_down),
            Direction::Down => occupied.start.checked_sub(self.len).map(align_down),
        };
    }

    /// Moves the search one step past `candidate`
    fn step(&mut self, candidate: usize) {
        self.current = match self.direction {
            Direction::Up => candidate.checked_add(GRANULARITY),
            Direction::Down => candidate.checked_sub(GRANULARITY),
        };
    }
}

impl Iterator for FreeBlocks {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(candidate) = self.current {
            if !self.reach.contains(&candidate) {
                return None;
            }
            match first_mapping(candidate, self.len) {
                Some(occupied) => self.skip(occupied),
                None => {
                    self.step(candidate);
                    return Some(candidate);
                }
            }
        }
        None
    }
}

/// Returns the first mapping that overlaps `start..start + len`, if any
fn first_mapping(start: usize, len: usize) -> Option<Range<usize>> {
    let page_size = region::page::size();
    (start..start.saturating_add(len))
        .step_by(page_size)
        .find_map(|page| match region::query(page as *const u8) {
            Ok(mapping) => Some(mapping.as_range()),
            Err(region::Error::UnmappedRegion) => None,
            // anything we can't describe is treated as taken
            Err(_) => Some(page..page + page_size),
        })
}

/// Rounds down to the allocation granularity
fn align_down(address: usize) -> usize {
    address & !(GRANULARITY - 1)
}

/// Rounds up to the allocation granularity
fn align_up(address: usize) -> usize {
    align_down(address.saturating_add(GRANULARITY - 1))
}

#[cfg(test)]
mod tests {
    use super::{Direction, FreeBlocks, GRANULARITY};

    #[test]
    /// Blocks next to our own code are found in both directions and stay inside the requested reach
    fn test_blocks_near_code() {
        let origin = test_blocks_near_code as *const () as usize;
        let reach = origin.saturating_sub(0x4000_0000)..origin + 0x4000_0000;

        for direction in [Direction::Up, Direction::Down] {
            let block = FreeBlocks::new(origin, reach.clone(), GRANULARITY, direction)
                .next()
                .expect("no free block near the test binary");
            assert_eq!(block % GRANULARITY, 0);
            assert!(reach.contains(&block));
            assert!(region::query(block as *const u8).is_err());
        }
    }

    #[test]
    /// An empty reach yields nothing
    fn test_empty_reach() {
        let origin = test_empty_reach as *const () as usize;
        assert_eq!(
            FreeBlocks::new(origin, origin..origin, GRANULARITY, Direction::Up).next(),
            None
        );
    }
}
