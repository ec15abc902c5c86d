use parking_lot::Mutex;

use crate::{align_usize, header::HeapObjectHeader, ALLOCATION_GRANULARITY};

const CHUNK_SIZE: usize = 64 * 1024;

struct Chunk {
    base: *mut u8,
    capacity: usize,
    used: usize,
}

/// Bump-allocated space for objects that live for the whole process. Storage is
/// never reclaimed; a dead immortal object is only ever zero-scanned so it stops
/// anchoring other objects.
pub struct ImmortalSpace {
    chunks: Mutex<Vec<Chunk>>,
}

unsafe impl Send for ImmortalSpace {}
unsafe impl Sync for ImmortalSpace {}

impl ImmortalSpace {
    pub fn new() -> ImmortalSpace {
        ImmortalSpace {
            chunks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn allocate(&self, size: usize) -> *mut HeapObjectHeader {
        let size = align_usize(size, ALLOCATION_GRANULARITY);
        let mut chunks = self.chunks.lock();
        if let Some(chunk) = chunks.last_mut() {
            if chunk.used + size <= chunk.capacity {
                let mem = unsafe { chunk.base.add(chunk.used) };
                chunk.used += size;
                return mem as *mut HeapObjectHeader;
            }
        }
        let capacity = CHUNK_SIZE.max(size);
        let base = unsafe { libc::malloc(capacity) } as *mut u8;
        if base.is_null() {
            return std::ptr::null_mut();
        }
        chunks.push(Chunk {
            base,
            capacity,
            used: size,
        });
        base as *mut HeapObjectHeader
    }

    pub fn used_bytes(&self) -> usize {
        self.chunks.lock().iter().map(|c| c.used).sum()
    }
}

impl Default for ImmortalSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ImmortalSpace {
    fn drop(&mut self) {
        for chunk in self.chunks.get_mut().iter() {
            unsafe {
                libc::free(chunk.base as *mut libc::c_void);
            }
        }
    }
}
