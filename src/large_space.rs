use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::{gc_log, header::HeapObjectHeader, object::UntypedGcRef};

/// Space for objects too large for Immix lines. Every cell is an individual
/// allocation; reclamation frees the cell outright.
pub struct LargeObjectSpace {
    cells: Mutex<HashSet<usize>>,
    bytes: AtomicUsize,
}

impl LargeObjectSpace {
    pub fn new() -> LargeObjectSpace {
        LargeObjectSpace {
            cells: Mutex::new(HashSet::new()),
            bytes: AtomicUsize::new(0),
        }
    }

    /// Allocates a raw cell of `size` bytes (header included). Returns null when the
    /// system is out of memory.
    pub(crate) fn allocate(&self, size: usize) -> *mut HeapObjectHeader {
        let mem = unsafe { libc::malloc(size) } as *mut HeapObjectHeader;
        if mem.is_null() {
            return mem;
        }
        self.cells.lock().insert(mem as usize);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        mem
    }

    /// Frees a cell. A cell is freed at most once: losing the race against another
    /// reclamation path is a no-op.
    pub fn free(&self, obj: UntypedGcRef) {
        let size = obj.header().size();
        if !self.cells.lock().remove(&(obj.header_ptr() as usize)) {
            return;
        }
        self.bytes.fetch_sub(size, Ordering::Relaxed);
        gc_log!(size, "large object freed");
        unsafe {
            libc::free(obj.header_ptr() as *mut libc::c_void);
        }
    }

    pub fn contains(&self, obj: UntypedGcRef) -> bool {
        self.cells.lock().contains(&(obj.header_ptr() as usize))
    }

    /// Frees every cell the backup trace did not reach. Only meaningful at the end
    /// of a cycle collection, after nursery cells were handled by the decrement
    /// drain. Returns the number of cells freed.
    pub(crate) fn sweep(&self, mark_version: u8) -> usize {
        let mut cells = self.cells.lock();
        let dead: Vec<usize> = cells
            .iter()
            .copied()
            .filter(|&cell| {
                let header = unsafe { &*(cell as *const HeapObjectHeader) };
                !header.is_marked(mark_version) && !header.is_new()
            })
            .collect();
        for cell in &dead {
            cells.remove(cell);
            let header = unsafe { &*(*cell as *const HeapObjectHeader) };
            self.bytes.fetch_sub(header.size(), Ordering::Relaxed);
            unsafe {
                libc::free(*cell as *mut libc::c_void);
            }
        }
        dead.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn used_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Default for LargeObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LargeObjectSpace {
    fn drop(&mut self) {
        for &cell in self.cells.get_mut().iter() {
            unsafe {
                libc::free(cell as *mut libc::c_void);
            }
        }
    }
}
