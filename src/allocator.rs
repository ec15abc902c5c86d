use std::ptr::null_mut;

use crate::immix_space::{Block, RcImmixSpace, LINES_PER_BLOCK, MAX_MEDIUM_OBJECT};

/// Bump allocator over the holes of Immix blocks. Each mutator owns one for young
/// allocation; each collector owns one for survivor copies and one for defrag
/// copies.
pub struct ImmixAllocator {
    space: *const RcImmixSpace,
    block: *mut Block,
    /// Next line to search for a hole in the current block.
    line: usize,
    cursor: usize,
    limit: usize,
    /// Copy allocators draw from the bounded defrag headroom instead of the general
    /// block pool.
    copy: bool,
}

unsafe impl Send for ImmixAllocator {}

impl ImmixAllocator {
    pub fn new(space: &RcImmixSpace, copy: bool) -> ImmixAllocator {
        ImmixAllocator {
            space,
            block: null_mut(),
            line: 1,
            cursor: 0,
            limit: 0,
            copy,
        }
    }

    fn space(&self) -> &RcImmixSpace {
        unsafe { &*self.space }
    }

    /// Bump-allocates `size` bytes. Returns null when the space cannot produce
    /// another block; the caller decides whether that triggers a collection or an
    /// in-place fallback.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        debug_assert!(size <= MAX_MEDIUM_OBJECT);
        loop {
            if self.cursor + size <= self.limit {
                let result = self.cursor as *mut u8;
                self.cursor += size;
                return result;
            }
            if !self.block.is_null() && self.line < LINES_PER_BLOCK {
                if let Some((start, end)) = unsafe { (*self.block).find_hole(self.line) } {
                    let block = unsafe { &*self.block };
                    self.cursor = block.line(start) as usize;
                    self.limit = block.line(end) as usize;
                    self.line = end;
                    continue;
                }
                self.line = LINES_PER_BLOCK;
            }
            let block = if self.copy {
                self.space().acquire_copy_block()
            } else {
                self.space().acquire_block()
            };
            if block.is_null() {
                return null_mut();
            }
            self.block = block;
            self.line = 1;
            self.cursor = 0;
            self.limit = 0;
        }
    }

    /// Abandons the current block and hole. The block is requeued by the next
    /// space release.
    pub fn reset(&mut self) {
        self.block = null_mut();
        self.line = 1;
        self.cursor = 0;
        self.limit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::immix_space::LINE_SIZE;
    use crate::Options;

    #[test]
    fn bump_allocates_within_a_hole() {
        let space = RcImmixSpace::new(&Options::default());
        let mut alloc = ImmixAllocator::new(&space, false);
        let a = alloc.alloc(64);
        let b = alloc.alloc(64);
        assert!(!a.is_null());
        assert_eq!(b as usize, a as usize + 64);
        // Never hands out block metadata.
        let block = Block::from_pointer(a);
        assert!(a as usize >= unsafe { (*block).line(1) } as usize);
    }

    #[test]
    fn skips_occupied_lines() {
        let space = RcImmixSpace::new(&Options::default());
        let mut alloc = ImmixAllocator::new(&space, false);
        let first = alloc.alloc(LINE_SIZE);
        let block = unsafe { &*Block::from_pointer(first) };
        // Kill the snapshot hole after line 2: pretend lines 2..4 are live.
        block.live_inc(2);
        block.live_inc(3);
        drop(alloc);
        space.release();
        let mut alloc = ImmixAllocator::new(&space, false);
        let next = alloc.alloc(LINE_SIZE);
        // Line 1 is still free (the first allocation was never counted live), so
        // the recycled block hands out line 1 first, then skips to line 4.
        assert_eq!(next as usize, block.line(1) as usize);
        let after = alloc.alloc(LINE_SIZE);
        assert_eq!(after as usize, block.line(4) as usize);
    }
}
