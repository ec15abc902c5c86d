use std::{
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::{align_down, gc_log, object::UntypedGcRef, Options};

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const LINE_SIZE: usize = 256;
pub const LINES_PER_BLOCK: usize = BLOCK_SIZE / LINE_SIZE;
/// Objects above this size go to the large object space.
pub const MAX_MEDIUM_OBJECT: usize = 8 * 1024;

/// Block metadata, stored in the block's first line. Objects start at line 1.
#[repr(C)]
pub struct Block {
    /// Live object count per line. An object spanning several lines contributes to
    /// each of them.
    line_live: [AtomicU8; LINES_PER_BLOCK],
    /// Free-line bitmap, rebuilt at every release. Allocators bump inside holes of
    /// this snapshot; line 0 is never free.
    free_map: [AtomicU8; LINES_PER_BLOCK / 8],
    defrag_source: AtomicBool,
}

impl Block {
    /// # Safety
    /// `at` must point at the start of a fresh, block-aligned region of
    /// [`BLOCK_SIZE`] bytes.
    unsafe fn init(at: *mut Block) {
        std::ptr::write_bytes(at as *mut u8, 0, std::mem::size_of::<Block>());
        (*at).reset_free_map();
    }

    #[inline(always)]
    pub fn from_pointer(p: *const u8) -> *mut Block {
        align_down(p as usize, BLOCK_SIZE) as *mut Block
    }

    #[inline(always)]
    pub fn begin(&self) -> *mut u8 {
        self as *const Self as *mut u8
    }

    #[inline(always)]
    pub fn line(&self, index: usize) -> *mut u8 {
        (self.begin() as usize + index * LINE_SIZE) as *mut u8
    }

    #[inline(always)]
    pub fn line_index_of(&self, p: *const u8) -> usize {
        (p as usize - self.begin() as usize) / LINE_SIZE
    }

    #[inline]
    pub fn line_is_free(&self, index: usize) -> bool {
        self.free_map[index / 8].load(Ordering::Relaxed) & (1 << (index % 8)) != 0
    }

    fn set_line_free(&self, index: usize, free: bool) {
        let bit = 1u8 << (index % 8);
        if free {
            self.free_map[index / 8].fetch_or(bit, Ordering::Relaxed);
        } else {
            self.free_map[index / 8].fetch_and(!bit, Ordering::Relaxed);
        }
    }

    fn reset_free_map(&self) {
        self.free_map[0].store(0xFE, Ordering::Relaxed);
        for byte in &self.free_map[1..] {
            byte.store(0xFF, Ordering::Relaxed);
        }
    }

    /// Finds the next run of free lines at or after `from`, returning the line span
    /// `[start, end)`.
    pub fn find_hole(&self, from: usize) -> Option<(usize, usize)> {
        let mut cursor = from.max(1);
        while cursor < LINES_PER_BLOCK && !self.line_is_free(cursor) {
            cursor += 1;
        }
        if cursor == LINES_PER_BLOCK {
            return None;
        }
        let start = cursor;
        while cursor < LINES_PER_BLOCK && self.line_is_free(cursor) {
            cursor += 1;
        }
        Some((start, cursor))
    }

    #[inline]
    pub fn live_inc(&self, index: usize) {
        self.line_live[index].fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn live_dec(&self, index: usize) {
        let prev = self.line_live[index].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "line occupancy underflow");
    }

    #[inline]
    pub fn live(&self, index: usize) -> u8 {
        self.line_live[index].load(Ordering::Relaxed)
    }

    fn zero_live_counts(&self) {
        for count in self.line_live.iter() {
            count.store(0, Ordering::Relaxed);
        }
    }

    pub fn is_defrag_source(&self) -> bool {
        self.defrag_source.load(Ordering::Relaxed)
    }

    fn set_defrag_source(&self, value: bool) {
        self.defrag_source.store(value, Ordering::Relaxed);
    }

    /// Rewrites the free map from the live counts and returns the number of free
    /// lines.
    fn rebuild_free_map(&self) -> usize {
        let mut free = 0;
        for index in 1..LINES_PER_BLOCK {
            let is_free = self.live(index) == 0;
            self.set_line_free(index, is_free);
            free += is_free as usize;
        }
        free
    }

    fn free_lines(&self) -> usize {
        (1..LINES_PER_BLOCK).filter(|&i| self.line_is_free(i)).count()
    }
}

#[derive(Clone, Copy)]
struct BlockPtr(*mut Block);

unsafe impl Send for BlockPtr {}
unsafe impl Sync for BlockPtr {}

/// The reference-counted Immix space: the default home of every small and medium
/// object.
pub struct RcImmixSpace {
    blocks: Mutex<Vec<BlockPtr>>,
    clean: SegQueue<BlockPtr>,
    recyclable: SegQueue<BlockPtr>,
    committed: AtomicUsize,
    limit: usize,
    defrag_threshold: f64,
    defrag_headroom: usize,
    force_defrag: AtomicBool,
    defrag_in_progress: AtomicBool,
    copy_space_exhausted: AtomicBool,
    copy_headroom: AtomicUsize,
}

unsafe impl Send for RcImmixSpace {}
unsafe impl Sync for RcImmixSpace {}

impl RcImmixSpace {
    pub fn new(options: &Options) -> RcImmixSpace {
        RcImmixSpace {
            blocks: Mutex::new(Vec::new()),
            clean: SegQueue::new(),
            recyclable: SegQueue::new(),
            committed: AtomicUsize::new(0),
            limit: options.heap_size,
            defrag_threshold: options.defrag_threshold,
            defrag_headroom: options.defrag_headroom,
            force_defrag: AtomicBool::new(false),
            defrag_in_progress: AtomicBool::new(false),
            copy_space_exhausted: AtomicBool::new(false),
            copy_headroom: AtomicUsize::new(0),
        }
    }

    /****************************************************************************
     * Block acquisition
     */

    /// Hands out a block for ordinary (young) allocation: recyclable holes first,
    /// then clean blocks, then fresh memory.
    pub(crate) fn acquire_block(&self) -> *mut Block {
        if let Some(BlockPtr(b)) = self.recyclable.pop() {
            return b;
        }
        if let Some(BlockPtr(b)) = self.clean.pop() {
            return b;
        }
        self.map_new_block()
    }

    /// Hands out a clean block for the defrag copy allocator, bounded by the copy
    /// headroom. Exhaustion is sticky for the rest of the collection.
    pub(crate) fn acquire_copy_block(&self) -> *mut Block {
        let mut headroom = self.copy_headroom.load(Ordering::Relaxed);
        loop {
            if headroom == 0 {
                self.copy_space_exhausted.store(true, Ordering::Release);
                return null_mut();
            }
            match self.copy_headroom.compare_exchange_weak(
                headroom,
                headroom - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => headroom = v,
            }
        }
        if let Some(BlockPtr(b)) = self.clean.pop() {
            return b;
        }
        let b = self.map_new_block();
        if b.is_null() {
            self.copy_space_exhausted.store(true, Ordering::Release);
        }
        b
    }

    fn map_new_block(&self) -> *mut Block {
        if self.committed.fetch_add(BLOCK_SIZE, Ordering::AcqRel) + BLOCK_SIZE > self.limit {
            self.committed.fetch_sub(BLOCK_SIZE, Ordering::AcqRel);
            return null_mut();
        }
        let mut mem: *mut libc::c_void = null_mut();
        let res = unsafe { libc::posix_memalign(&mut mem, BLOCK_SIZE, BLOCK_SIZE) };
        if res != 0 || mem.is_null() {
            self.committed.fetch_sub(BLOCK_SIZE, Ordering::AcqRel);
            return null_mut();
        }
        let block = mem as *mut Block;
        unsafe {
            Block::init(block);
        }
        self.blocks.lock().push(BlockPtr(block));
        block
    }

    /****************************************************************************
     * Line occupancy
     */

    fn line_span(obj: UntypedGcRef) -> (*mut Block, usize, usize) {
        let start = obj.header_ptr() as *const u8;
        let size = obj.header().size();
        let block = Block::from_pointer(start);
        let first = unsafe { (*block).line_index_of(start) };
        let last = unsafe { (*block).line_index_of(start.add(size - 1)) };
        (block, first, last)
    }

    /// Records the object on every line it touches. Called when an object is first
    /// counted or relocated into this space.
    pub fn inc_lines(&self, obj: UntypedGcRef) {
        let (block, first, last) = Self::line_span(obj);
        for index in first..=last {
            unsafe {
                (*block).live_inc(index);
            }
        }
    }

    /// Removes a dead object from its lines' occupancy.
    pub fn dec_lines(&self, obj: UntypedGcRef) {
        let (block, first, last) = Self::line_span(obj);
        for index in first..=last {
            unsafe {
                (*block).live_dec(index);
            }
        }
    }

    /// Scan-time line marking during a backup trace: occupancy is rebuilt from the
    /// live object graph, one contribution per object.
    pub fn mark_lines(&self, obj: UntypedGcRef) {
        self.inc_lines(obj);
    }

    pub(crate) fn is_defrag_source(obj: UntypedGcRef) -> bool {
        unsafe { (*Block::from_pointer(obj.header_ptr() as *const u8)).is_defrag_source() }
    }

    /****************************************************************************
     * Collection support
     */

    /// Requests that the next cycle collection defragments regardless of heap
    /// fragmentation.
    pub fn force_defrag(&self) {
        self.force_defrag.store(true, Ordering::Relaxed);
    }

    pub fn is_defrag_collection(&self) -> bool {
        self.defrag_in_progress.load(Ordering::Relaxed)
    }

    pub fn copy_space_exhausted(&self) -> bool {
        self.copy_space_exhausted.load(Ordering::Acquire)
    }

    pub(crate) fn prepare(&self, cycle_collection: bool) {
        if !cycle_collection {
            return;
        }
        // Occupancy is reconstructed by the trace; stale counts would double-count
        // survivors.
        let blocks = self.blocks.lock();
        let mut fragmented = 0usize;
        for &BlockPtr(block) in blocks.iter() {
            let block = unsafe { &*block };
            block.zero_live_counts();
            let free = block.free_lines();
            if free > 0 && free < LINES_PER_BLOCK - 1 {
                fragmented += 1;
            }
        }
        let defrag = self.force_defrag.swap(false, Ordering::Relaxed)
            || (!blocks.is_empty()
                && fragmented as f64 / blocks.len() as f64 >= self.defrag_threshold);
        if defrag {
            for &BlockPtr(block) in blocks.iter() {
                let block = unsafe { &*block };
                let free = block.free_lines();
                block.set_defrag_source(free > 0 && free < LINES_PER_BLOCK - 1);
            }
        }
        self.defrag_in_progress.store(defrag, Ordering::Relaxed);
        self.copy_space_exhausted.store(false, Ordering::Relaxed);
        self.copy_headroom
            .store(self.defrag_headroom, Ordering::Relaxed);
        gc_log!(defrag, fragmented, "immix space prepared for cycle collection");
    }

    /// Rebuilds every block's free map from line occupancy and requeues blocks for
    /// allocation. Returns `(empty_blocks, free_lines)`.
    pub(crate) fn release(&self) -> (usize, usize) {
        while self.clean.pop().is_some() {}
        while self.recyclable.pop().is_some() {}

        let blocks = self.blocks.lock();
        let mut empty = 0usize;
        let mut free_total = 0usize;
        for &BlockPtr(block) in blocks.iter() {
            let block_ref = unsafe { &*block };
            let free = block_ref.rebuild_free_map();
            block_ref.set_defrag_source(false);
            free_total += free;
            if free == LINES_PER_BLOCK - 1 {
                empty += 1;
                self.clean.push(BlockPtr(block));
            } else if free > 0 {
                self.recyclable.push(BlockPtr(block));
            }
        }
        self.defrag_in_progress.store(false, Ordering::Relaxed);
        gc_log!(empty, free_total, "immix space released");
        (empty, free_total)
    }

    /// Total free lines across the space, per the last release snapshot.
    pub fn free_lines(&self) -> usize {
        let blocks = self.blocks.lock();
        blocks
            .iter()
            .map(|&BlockPtr(b)| unsafe { (*b).free_lines() })
            .sum()
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }
}

impl Drop for RcImmixSpace {
    fn drop(&mut self) {
        let blocks = self.blocks.get_mut();
        for &BlockPtr(block) in blocks.iter() {
            unsafe {
                libc::free(block as *mut libc::c_void);
            }
        }
    }
}

const _: () = assert!(std::mem::size_of::<Block>() <= LINE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> RcImmixSpace {
        RcImmixSpace::new(&Options::default())
    }

    #[test]
    fn fresh_block_is_one_hole() {
        let space = space();
        let block = space.acquire_block();
        assert!(!block.is_null());
        let block = unsafe { &*block };
        assert_eq!(block.find_hole(1), Some((1, LINES_PER_BLOCK)));
    }

    #[test]
    fn release_recycles_dead_lines() {
        let space = space();
        let block = space.acquire_block();
        let block_ref = unsafe { &*block };
        // Two "objects" living on lines 1 and 3.
        block_ref.live_inc(1);
        block_ref.live_inc(3);
        let (empty, free) = space.release();
        assert_eq!(empty, 0);
        assert_eq!(free, LINES_PER_BLOCK - 1 - 2);
        assert!(!block_ref.line_is_free(1));
        assert!(block_ref.line_is_free(2));
        assert_eq!(block_ref.find_hole(1), Some((2, 3)));
        // Lines die, block becomes clean again.
        block_ref.live_dec(1);
        block_ref.live_dec(3);
        let (empty, _) = space.release();
        assert_eq!(empty, 1);
    }

    #[test]
    fn copy_headroom_is_bounded() {
        let mut options = Options::default();
        options.defrag_headroom = 1;
        let space = RcImmixSpace::new(&options);
        space.force_defrag();
        space.prepare(true);
        assert!(space.is_defrag_collection());
        let first = space.acquire_copy_block();
        assert!(!first.is_null());
        let second = space.acquire_copy_block();
        assert!(second.is_null());
        assert!(space.copy_space_exhausted());
    }
}
