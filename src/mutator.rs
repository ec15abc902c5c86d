use std::{any::TypeId, mem::size_of, ptr, sync::Arc};

use crate::{
    align_usize,
    allocator::ImmixAllocator,
    deque::{DecBuffer, LocalQueue},
    header::{HeapObjectHeader, SpaceTag},
    immix_space::MAX_MEDIUM_OBJECT,
    object::{vtable_of, Collectable, Gc, UntypedGcRef},
    oom_abort,
    plan::RcImmix,
    scheduler::Phase,
    ALLOCATION_GRANULARITY,
};

/// Per-application-thread context: the allocation fast path, the write barrier and
/// the local halves of the shared buffers. One instance per thread, bound to the
/// heap with [`RcImmix::bind_mutator`].
pub struct Mutator {
    pub(crate) plan: Arc<RcImmix>,
    pub(crate) young: ImmixAllocator,
    pub(crate) modbuf: LocalQueue,
    pub(crate) dec: [DecBuffer; 2],
    /// Index of the live decrement-buffer half. Retargeted at SWITCH_DECPOOL.
    pub(crate) dec_target: usize,
}

unsafe impl Send for Mutator {}

impl Mutator {
    pub(crate) fn new(plan: Arc<RcImmix>) -> Box<Mutator> {
        let mutator = Box::new(Mutator {
            young: ImmixAllocator::new(&plan.rc_space, false),
            modbuf: LocalQueue::new(&plan.mod_pool),
            dec: [
                DecBuffer::new(&plan.dec_pool[0]),
                DecBuffer::new(&plan.dec_pool[1]),
            ],
            dec_target: plan.current_dec_pool(),
            plan,
        });
        mutator.plan.register_mutator(&*mutator);
        mutator
    }

    #[inline(always)]
    pub(crate) fn dec_buffer(&mut self) -> &mut DecBuffer {
        &mut self.dec[self.dec_target]
    }

    /****************************************************************************
     * Allocation
     */

    /// Allocates `value` on the GC heap. Medium objects go to the Immix space as
    /// nursery objects; anything larger lands in the large object space. Every
    /// allocation is a safepoint.
    #[inline]
    pub fn allocate<T: Collectable + Sized + 'static>(&mut self, value: T) -> Gc<T> {
        self.safepoint();
        let size = align_usize(
            size_of::<HeapObjectHeader>() + value.allocation_size(),
            ALLOCATION_GRANULARITY,
        );
        if size > MAX_MEDIUM_OBJECT {
            return self.allocate_large(value, size);
        }
        let mut mem = self.young.alloc(size);
        if mem.is_null() {
            mem = self.alloc_slow(size);
        }
        unsafe { self.finish_alloc(mem as *mut HeapObjectHeader, value, size, SpaceTag::RefCount) }
    }

    /// Allocates `value` in the immortal space. The storage is never reclaimed; a
    /// dead immortal object only has its reference fields cleared.
    pub fn allocate_immortal<T: Collectable + Sized + 'static>(&mut self, value: T) -> Gc<T> {
        let size = align_usize(
            size_of::<HeapObjectHeader>() + value.allocation_size(),
            ALLOCATION_GRANULARITY,
        );
        let mem = self.plan.immortal.allocate(size);
        if mem.is_null() {
            oom_abort();
        }
        let result = unsafe { self.finish_alloc(mem, value, size, SpaceTag::Immortal) };
        // Releases the allocation once nothing ever counted the object.
        self.dec_buffer().push(result.untyped());
        result
    }

    #[cold]
    fn allocate_large<T: Collectable + Sized + 'static>(&mut self, value: T, size: usize) -> Gc<T> {
        let mem = self.plan.los.allocate(size);
        if mem.is_null() {
            oom_abort();
        }
        let result = unsafe { self.finish_alloc(mem, value, size, SpaceTag::Large) };
        self.dec_buffer().push(result.untyped());
        result
    }

    #[cold]
    fn alloc_slow(&mut self, size: usize) -> *mut u8 {
        // One forced collection, then give up.
        self.collect();
        let mem = self.young.alloc(size);
        if mem.is_null() {
            oom_abort();
        }
        mem
    }

    unsafe fn finish_alloc<T: Collectable + Sized + 'static>(
        &mut self,
        header: *mut HeapObjectHeader,
        value: T,
        size: usize,
        tag: SpaceTag,
    ) -> Gc<T> {
        HeapObjectHeader::initialize(header, vtable_of::<T>(), TypeId::of::<T>(), size, tag);
        let raw = UntypedGcRef::from_header(header);
        ptr::write(raw.payload().cast::<T>(), value);
        Gc::from_untyped(raw)
    }

    /****************************************************************************
     * Write barriers
     */

    /// Reference store barrier: `src.field = target`.
    #[inline]
    pub fn object_reference_write<T: Collectable + ?Sized>(
        &mut self,
        src: UntypedGcRef,
        slot: &mut Option<Gc<T>>,
        target: Option<Gc<T>>,
    ) {
        if src.header().log_required() {
            self.coalescing_barrier_slow(src);
        }
        *slot = target;
    }

    /// Compare-and-swap store barrier. The barrier fires whether or not the swap
    /// succeeds, exactly like the plain store barrier.
    #[inline]
    pub fn object_reference_try_compare_and_swap<T: Collectable + ?Sized>(
        &mut self,
        src: UntypedGcRef,
        slot: &mut Option<Gc<T>>,
        old: Option<Gc<T>>,
        target: Option<Gc<T>>,
    ) -> bool {
        if src.header().log_required() {
            self.coalescing_barrier_slow(src);
        }
        if *slot == old {
            *slot = target;
            true
        } else {
            false
        }
    }

    /// Bulk-copy barrier: a region of references is about to be copied into `dst`.
    /// Fires once per call, not once per copied slot; the copy itself is left to
    /// the caller.
    #[inline]
    pub fn object_reference_bulk_copy(&mut self, dst: UntypedGcRef) {
        if dst.header().log_required() {
            self.coalescing_barrier_slow(dst);
        }
    }

    /// Slow path of the coalescing write barrier.
    ///
    /// Attempt to log the source object. If successful in racing for the log bit,
    /// push an entry into the modified buffer and add a decrement buffer entry for
    /// each current referent before marking the object logged (allowing others in
    /// the race to continue).
    #[inline(never)]
    fn coalescing_barrier_slow(&mut self, src: UntypedGcRef) {
        if src.header().attempt_to_log() {
            self.modbuf.push(src);
            let target = self.dec_target;
            self.dec[target].process_children(src);
            src.header().make_logged();
        }
    }

    /****************************************************************************
     * Collection
     */

    /// Polls the global safepoint. Mutator threads must reach this regularly;
    /// allocation does.
    #[inline(always)]
    pub fn safepoint(&self) {
        self.plan.safepoint.poll();
    }

    /// Triggers a stop-the-world collection and waits for it.
    pub fn collect(&mut self) {
        let plan = self.plan.clone();
        plan.collect_from_mutator();
    }

    /// Requests that the next collection also runs the backup trace.
    pub fn request_cycle_collection(&self) {
        self.plan.request_cycle_collection();
    }

    pub(crate) fn collection_phase(&mut self, phase: Phase) {
        match phase {
            Phase::Prepare => {
                self.young.reset();
            }
            Phase::ProcessModBuffer => {
                self.modbuf.flush();
            }
            Phase::ProcessDecBuffer => {
                self.dec[0].flush();
                self.dec[1].flush();
            }
            Phase::Release => {
                debug_assert!(self.modbuf.is_flushed());
                debug_assert!(self.dec[0].is_flushed());
                debug_assert!(self.dec[1].is_flushed());
            }
            Phase::SwitchDecPool => {
                // Publish any stragglers before abandoning the old half, then
                // retarget; the pause guarantees every mutator observes the switch
                // before it can enqueue again.
                let target = self.dec_target;
                self.dec[target].flush();
                self.dec_target = self.plan.current_dec_pool();
            }
            _ => {}
        }
    }

    /// Publishes all locally buffered work to the shared pools.
    pub fn flush_remembered_sets(&mut self) {
        self.dec[0].flush();
        self.dec[1].flush();
        self.modbuf.flush();
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.flush_remembered_sets();
        self.plan.deregister_mutator(self);
    }
}
