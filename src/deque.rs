use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::object::{scan_object, Edge, UntypedGcRef, Visitor};

/// A multi-producer queue of object references shared by every mutator and collector
/// context. Producers batch entries in a local buffer and publish them with an
/// explicit flush; consumers pop lock-free.
pub struct SharedPool {
    name: &'static str,
    queue: SegQueue<UntypedGcRef>,
}

impl SharedPool {
    pub fn new(name: &'static str) -> Arc<SharedPool> {
        Arc::new(SharedPool {
            name,
            queue: SegQueue::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn push(&self, value: UntypedGcRef) {
        self.queue.push(value);
    }

    #[inline]
    pub fn pop(&self) -> Option<UntypedGcRef> {
        self.queue.pop()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// As [`SharedPool`], but carrying slot addresses instead of object references. Used
/// for root edges, which must stay rewritable until the end of the pause that
/// discovered them.
pub struct AddressPool {
    name: &'static str,
    queue: SegQueue<EdgeSlot>,
}

#[derive(Clone, Copy)]
pub(crate) struct EdgeSlot(pub Edge);

unsafe impl Send for EdgeSlot {}
unsafe impl Sync for EdgeSlot {}

impl AddressPool {
    pub fn new(name: &'static str) -> Arc<AddressPool> {
        Arc::new(AddressPool {
            name,
            queue: SegQueue::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn push(&self, slot: Edge) {
        self.queue.push(EdgeSlot(slot));
    }

    #[inline]
    pub fn pop(&self) -> Option<Edge> {
        self.queue.pop().map(|s| s.0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Context-local view of a [`SharedPool`]: unpublished entries live in a plain
/// vector until flushed. Pops drain the local buffer before stealing from the pool,
/// so work a context generates feeds back into its own draining pass first.
pub struct LocalQueue {
    shared: Arc<SharedPool>,
    buffer: Vec<UntypedGcRef>,
}

impl LocalQueue {
    pub fn new(shared: &Arc<SharedPool>) -> LocalQueue {
        LocalQueue {
            shared: shared.clone(),
            buffer: Vec::new(),
        }
    }

    #[inline]
    pub fn push(&mut self, value: UntypedGcRef) {
        self.buffer.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<UntypedGcRef> {
        self.buffer.pop().or_else(|| self.shared.pop())
    }

    /// Publishes every locally buffered entry to the shared pool.
    pub fn flush(&mut self) {
        for value in self.buffer.drain(..) {
            self.shared.push(value);
        }
    }

    #[inline]
    pub fn is_flushed(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn local_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Context-local view of an [`AddressPool`].
pub struct AddressBuffer {
    shared: Arc<AddressPool>,
    buffer: Vec<Edge>,
}

impl AddressBuffer {
    pub fn new(shared: &Arc<AddressPool>) -> AddressBuffer {
        AddressBuffer {
            shared: shared.clone(),
            buffer: Vec::new(),
        }
    }

    #[inline]
    pub fn push(&mut self, slot: Edge) {
        self.buffer.push(slot);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Edge> {
        self.buffer.pop().or_else(|| self.shared.pop())
    }

    pub fn flush(&mut self) {
        for slot in self.buffer.drain(..) {
            self.shared.push(slot);
        }
    }

    #[inline]
    pub fn is_flushed(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// The decrement buffer: object references whose count must eventually be
/// decremented. One of the two shared halves is live for mutator enqueues at any
/// time; the other is drained by at most one party.
pub struct DecBuffer {
    inner: LocalQueue,
}

impl DecBuffer {
    pub fn new(shared: &Arc<SharedPool>) -> DecBuffer {
        DecBuffer {
            inner: LocalQueue::new(shared),
        }
    }

    #[inline]
    pub fn push(&mut self, value: UntypedGcRef) {
        self.inner.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<UntypedGcRef> {
        self.inner.pop()
    }

    pub fn flush(&mut self) {
        self.inner.flush();
    }

    #[inline]
    pub fn is_flushed(&self) -> bool {
        self.inner.is_flushed()
    }

    #[inline]
    pub fn local_len(&self) -> usize {
        self.inner.local_len()
    }

    /// Enqueues a pending decrement for every object currently referenced from
    /// `object`'s fields. The entries land in this buffer's local half, so a
    /// draining pass picks its own children up before stealing new work.
    pub fn process_children(&mut self, object: UntypedGcRef) {
        let mut visitor = DecChildren { buffer: self };
        unsafe {
            scan_object(object, &mut visitor);
        }
    }
}

struct DecChildren<'a> {
    buffer: &'a mut DecBuffer,
}

impl<'a> Visitor for DecChildren<'a> {
    fn visit_edge(&mut self, slot: Edge) {
        if let Some(child) = unsafe { *slot } {
            self.buffer.push(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_refs(n: usize) -> Vec<UntypedGcRef> {
        // Addresses only; these tests never dereference.
        (1..=n)
            .map(|i| UntypedGcRef::from_header((i * 64) as *mut _))
            .collect()
    }

    #[test]
    fn local_pops_before_shared() {
        let pool = SharedPool::new("test");
        let refs = dummy_refs(3);
        pool.push(refs[0]);
        let mut local = LocalQueue::new(&pool);
        local.push(refs[1]);
        local.push(refs[2]);
        assert_eq!(local.pop(), Some(refs[2]));
        assert_eq!(local.pop(), Some(refs[1]));
        assert_eq!(local.pop(), Some(refs[0]));
        assert_eq!(local.pop(), None);
    }

    #[test]
    fn flush_publishes_everything() {
        let pool = SharedPool::new("test");
        let refs = dummy_refs(4);
        let mut a = LocalQueue::new(&pool);
        let mut b = LocalQueue::new(&pool);
        for &r in &refs {
            a.push(r);
        }
        assert!(pool.is_empty());
        a.flush();
        assert!(a.is_flushed());
        assert_eq!(pool.len(), 4);
        let mut seen = 0;
        while b.pop().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 4);
    }
}
