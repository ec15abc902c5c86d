//! The backup trace: a transitive closure layered on top of reference counting to
//! reclaim cycles and recover saturated counts. While it walks the live graph it
//! reconstructs every reached object's reference count from its in-edges and
//! rebuilds line occupancy, so everything it never reaches (cycle garbage included)
//! is left with dead lines and swept at release. With defragmentation active the
//! trace additionally evacuates objects out of fragmented blocks; an object visited
//! once is pinned in its final location for the rest of the collection.

use crate::{
    allocator::ImmixAllocator,
    forwarding,
    header::{HeapObjectHeader, SpaceTag},
    immix_space::RcImmixSpace,
    object::{scan_object, Edge, UntypedGcRef, Visitor},
    plan::RcImmix,
    trace::TraceQueue,
};

pub struct BackupTrace {
    queue: TraceQueue,
    defrag: bool,
    version: u8,
}

impl BackupTrace {
    pub fn new() -> BackupTrace {
        BackupTrace {
            queue: TraceQueue::new(),
            defrag: false,
            version: 0,
        }
    }

    pub fn prepare(&mut self, version: u8, defrag: bool) {
        self.queue.reset();
        self.version = version;
        self.defrag = defrag;
    }

    pub fn is_live(&self, object: UntypedGcRef) -> bool {
        object.header().is_marked(self.version)
    }

    /// Traces one edge to `object`: the first visit marks it (relocating it first
    /// when defragmenting), restarts its count at one and queues it for scanning;
    /// every later visit just adds the edge to the reconstructed count. Returns the
    /// object's final location.
    pub fn trace_object(
        &mut self,
        plan: &RcImmix,
        copy: &mut ImmixAllocator,
        object: UntypedGcRef,
    ) -> UntypedGcRef {
        if self.defrag && object.header().space() == SpaceTag::RefCount {
            self.trace_and_copy(plan, copy, object)
        } else {
            self.trace_and_mark(plan, object)
        }
    }

    fn trace_and_mark(&mut self, plan: &RcImmix, object: UntypedGcRef) -> UntypedGcRef {
        if object.header().mark_and_reset_count(self.version) {
            if object.header().space() == SpaceTag::RefCount {
                plan.rc_space.mark_lines(object);
            }
            self.queue.push(object);
        } else {
            object.header().inc_rc_old();
        }
        object
    }

    fn trace_and_copy(
        &mut self,
        plan: &RcImmix,
        copy: &mut ImmixAllocator,
        object: UntypedGcRef,
    ) -> UntypedGcRef {
        let header = object.header();
        let prior = header.attempt_to_forward();
        if HeapObjectHeader::state_is_forwarded_or_being_forwarded(prior) {
            // A peer owns the object; wait for its final location.
            let target = header.spin_and_get_forwarded();
            target.header().inc_rc_old();
            return target;
        }
        if HeapObjectHeader::state_is_marked(prior, self.version) {
            // Already visited, therefore already in its final location.
            header.return_to_prior_state(prior);
            header.inc_rc_old();
            return object;
        }
        let movable = !HeapObjectHeader::state_is_pinned(prior)
            && RcImmixSpace::is_defrag_source(object)
            && !plan.rc_space.copy_space_exhausted();
        if movable {
            let dest = copy.alloc(header.size());
            if !dest.is_null() {
                let target = forwarding::forward_object(object, dest, Some(self.version));
                plan.rc_space.mark_lines(target);
                self.queue.push(target);
                return target;
            }
        }
        // Pinned, outside the defrag set, or out of copy space: promote in place.
        header.return_to_prior_state(prior);
        if header.mark_and_reset_count(self.version) {
            plan.rc_space.mark_lines(object);
            self.queue.push(object);
        } else {
            header.inc_rc_old();
        }
        object
    }

    /// Completes the closure over everything queued so far.
    pub fn complete_trace(&mut self, plan: &RcImmix, copy: &mut ImmixAllocator) {
        while let Some(object) = self.queue.pop() {
            let mut visitor = BtEdgeVisitor {
                trace: &mut *self,
                plan,
                copy: &mut *copy,
            };
            unsafe {
                scan_object(object, &mut visitor);
            }
        }
    }

    pub fn release(&mut self) {
        debug_assert!(self.queue.is_empty());
        self.queue.reset();
    }
}

impl Default for BackupTrace {
    fn default() -> Self {
        Self::new()
    }
}

struct BtEdgeVisitor<'a> {
    trace: &'a mut BackupTrace,
    plan: &'a RcImmix,
    copy: &'a mut ImmixAllocator,
}

impl<'a> Visitor for BtEdgeVisitor<'a> {
    fn visit_edge(&mut self, slot: Edge) {
        if let Some(object) = unsafe { *slot } {
            let target = self.trace.trace_object(self.plan, self.copy, object);
            if target != object {
                unsafe {
                    *slot = Some(target);
                }
            }
        }
    }
}
