use std::sync::{
    atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use atomic::Atomic;
use parking_lot::{Condvar, Mutex};

use crate::{
    collector::Collector,
    deque::{AddressPool, EdgeSlot, SharedPool},
    gc_log,
    immix_space::RcImmixSpace,
    immortal_space::ImmortalSpace,
    large_space::LargeObjectSpace,
    mutator::Mutator,
    object::{Edge, Visitor},
    safepoint::GlobalSafepoint,
    scheduler::{Phase, Request, WorkerGroup},
    Options,
};

/// Heap-wide counters. Reclamation events are counted where they happen, so tests
/// and embedders can observe collector progress without walking the heap.
#[derive(Default)]
pub struct GcStats {
    pub collections: AtomicUsize,
    pub cycle_collections: AtomicUsize,
    /// Objects reclaimed through an explicit path: decrement kills, nursery frees
    /// and large-object sweeps. Line-granularity reclamation is visible through
    /// [`RcImmixSpace::free_lines`] instead.
    pub reclaimed_objects: AtomicUsize,
    pub free_lines_after_gc: AtomicUsize,
    pub empty_blocks_after_gc: AtomicUsize,
}

impl GcStats {
    pub(crate) fn count_reclaimed(&self, n: usize) {
        self.reclaimed_objects.fetch_add(n, Ordering::Relaxed);
    }

    pub fn reclaimed(&self) -> usize {
        self.reclaimed_objects.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy)]
struct MutatorPtr(*mut Mutator);

unsafe impl Send for MutatorPtr {}

struct ConcurrentSync {
    active: bool,
    done: bool,
}

type Constraint = Box<dyn FnMut(&mut dyn Visitor) + Send>;

/// The global coordinator: process-wide collection state, the shared buffer pools,
/// the live decrement-half index, the latched cycle-collection flag and the worker
/// pools. Everything mutable is behind an atomic or a lock; the coordinator is
/// explicitly constructed and explicitly passed, never ambient.
pub struct RcImmix {
    pub options: Options,
    pub rc_space: RcImmixSpace,
    pub los: LargeObjectSpace,
    pub immortal: ImmortalSpace,
    pub safepoint: GlobalSafepoint,
    pub stats: GcStats,

    pub(crate) dec_pool: [Arc<SharedPool>; 2],
    pub(crate) mod_pool: Arc<SharedPool>,
    pub(crate) old_root_pool: Arc<SharedPool>,
    pub(crate) new_root_pool: Arc<AddressPool>,
    pub(crate) new_root_back_pool: Arc<AddressPool>,

    /// Which decrement-buffer half currently accepts mutator enqueues. Flipped only
    /// inside a pause, at SWITCH_DECPOOL.
    current_dec_pool: AtomicUsize,
    /// Set by policy before a collection; latched into `cycle_latched` at PREPARE.
    cycle_request: AtomicBool,
    cycle_latched: AtomicBool,
    mark_version: AtomicU8,
    gc_in_progress: AtomicBool,
    collections: AtomicUsize,

    /// Which phase the background worker loop runs when it wakes.
    concurrent_phase_id: Atomic<Phase>,
    concurrent: Mutex<ConcurrentSync>,
    concurrent_cond: Condvar,

    mutators: Mutex<Vec<MutatorPtr>>,
    root_slots: Mutex<Vec<EdgeSlot>>,
    constraints: Mutex<Vec<Constraint>>,

    stw_group: Mutex<Option<Arc<WorkerGroup>>>,
    conc_group: Mutex<Option<Arc<WorkerGroup>>>,
    gc_lock: Mutex<()>,
}

unsafe impl Send for RcImmix {}
unsafe impl Sync for RcImmix {}

impl RcImmix {
    pub fn new(options: Options) -> Arc<RcImmix> {
        let stw_workers = options.collector_threads;
        let concurrent_workers = options.concurrent_threads;
        let plan = Arc::new(RcImmix {
            rc_space: RcImmixSpace::new(&options),
            los: LargeObjectSpace::new(),
            immortal: ImmortalSpace::new(),
            safepoint: GlobalSafepoint::new(),
            stats: GcStats::default(),
            dec_pool: [SharedPool::new("dec-0"), SharedPool::new("dec-1")],
            mod_pool: SharedPool::new("mod"),
            old_root_pool: SharedPool::new("old-root"),
            new_root_pool: AddressPool::new("new-root"),
            new_root_back_pool: AddressPool::new("new-root-back"),
            current_dec_pool: AtomicUsize::new(0),
            cycle_request: AtomicBool::new(false),
            cycle_latched: AtomicBool::new(false),
            mark_version: AtomicU8::new(0),
            gc_in_progress: AtomicBool::new(false),
            collections: AtomicUsize::new(0),
            concurrent_phase_id: Atomic::new(Phase::Concurrent),
            concurrent: Mutex::new(ConcurrentSync {
                active: false,
                done: false,
            }),
            concurrent_cond: Condvar::new(),
            mutators: Mutex::new(Vec::new()),
            root_slots: Mutex::new(Vec::new()),
            constraints: Mutex::new(Vec::new()),
            stw_group: Mutex::new(None),
            conc_group: Mutex::new(None),
            gc_lock: Mutex::new(()),
            options,
        });
        if stw_workers > 0 {
            *plan.stw_group.lock() = Some(spawn_worker_group(&plan, stw_workers));
        }
        if concurrent_workers > 0 {
            *plan.conc_group.lock() = Some(spawn_worker_group(&plan, concurrent_workers));
        }
        plan
    }

    /// Binds the calling thread to the heap as a mutator.
    pub fn bind_mutator(self: Arc<Self>) -> Box<Mutator> {
        Mutator::new(self)
    }

    /****************************************************************************
     * Roots
     */

    /// Registers a root enumeration callback, executed at the ROOTS phase of every
    /// collection. The callback reports every root slot to the visitor.
    pub fn add_constraint(&self, constraint: impl FnMut(&mut dyn Visitor) + Send + 'static) {
        self.constraints.lock().push(Box::new(constraint));
    }

    /// Registers a single root slot.
    ///
    /// # Safety
    /// The slot must stay valid for the lifetime of the heap and must only be
    /// mutated by a thread that is not inside a collection pause.
    pub unsafe fn add_root_slot(&self, slot: Edge) {
        self.root_slots.lock().push(EdgeSlot(slot));
    }

    pub(crate) fn scan_roots(&self, vis: &mut dyn Visitor) {
        for slot in self.root_slots.lock().iter() {
            vis.visit_edge(slot.0);
        }
        for constraint in self.constraints.lock().iter_mut() {
            constraint(vis);
        }
    }

    /****************************************************************************
     * Mutator registry
     */

    pub(crate) fn register_mutator(&self, mutator: *const Mutator) {
        self.mutators.lock().push(MutatorPtr(mutator as *mut Mutator));
        self.safepoint.register();
    }

    pub(crate) fn deregister_mutator(&self, mutator: *const Mutator) {
        self.mutators
            .lock()
            .retain(|m| m.0 as *const Mutator != mutator);
        self.safepoint.deregister();
    }

    /// Runs `f` over every bound mutator.
    ///
    /// # Safety
    /// Only callable while every mutator thread is stopped (inside a pause).
    pub(crate) unsafe fn for_each_mutator(&self, mut f: impl FnMut(&mut Mutator)) {
        for &MutatorPtr(mutator) in self.mutators.lock().iter() {
            f(&mut *mutator);
        }
    }

    /****************************************************************************
     * Collection state
     */

    #[inline]
    pub fn current_dec_pool(&self) -> usize {
        self.current_dec_pool.load(Ordering::SeqCst)
    }

    /// Whether the collection latched at the last PREPARE performs the backup
    /// trace.
    #[inline]
    pub fn cycle_collection(&self) -> bool {
        self.cycle_latched.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn mark_version(&self) -> u8 {
        self.mark_version.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn gc_in_progress(&self) -> bool {
        self.gc_in_progress.load(Ordering::Relaxed)
    }

    pub fn collection_count(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Requests that the next collection also performs the backup trace. Latched at
    /// PREPARE; requests arriving during a pause apply to the following collection.
    pub fn request_cycle_collection(&self) {
        self.cycle_request.store(true, Ordering::Relaxed);
    }

    fn decide_cycle_collection(&self) -> bool {
        if self.cycle_request.swap(false, Ordering::Relaxed) {
            return true;
        }
        match self.options.cycle_collection_every {
            Some(n) if n > 0 => (self.collections.load(Ordering::Relaxed) + 1) % n == 0,
            _ => false,
        }
    }

    /****************************************************************************
     * Phase execution (coordinator side)
     */

    pub(crate) fn global_phase(&self, phase: Phase) {
        match phase {
            Phase::Prepare => {
                let cycle = self.decide_cycle_collection();
                self.cycle_latched.store(cycle, Ordering::Relaxed);
                if cycle {
                    self.mark_version.fetch_add(1, Ordering::Relaxed);
                    self.stats.cycle_collections.fetch_add(1, Ordering::Relaxed);
                }
                self.rc_space.prepare(cycle);
                gc_log!(cycle, "prepare");
            }
            Phase::Release => {
                if self.cycle_collection() {
                    let swept = self.los.sweep(self.mark_version());
                    self.stats.count_reclaimed(swept);
                }
                let (empty, free_lines) = self.rc_space.release();
                self.stats
                    .free_lines_after_gc
                    .store(free_lines, Ordering::Relaxed);
                self.stats
                    .empty_blocks_after_gc
                    .store(empty, Ordering::Relaxed);
                debug_assert!(self.mod_pool.is_empty());
                debug_assert!(self.new_root_pool.is_empty());
                if self.cycle_collection() {
                    debug_assert!(self.dec_pool[0].is_empty());
                    debug_assert!(self.dec_pool[1].is_empty());
                }
                self.collections.fetch_add(1, Ordering::Relaxed);
                self.stats.collections.fetch_add(1, Ordering::Relaxed);
            }
            Phase::SwitchDecPool => {
                // Total-order broadcast point: flipped under the pause, before any
                // mutator handler re-reads it.
                self.current_dec_pool.fetch_xor(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    /****************************************************************************
     * Stop-the-world orchestration
     */

    /// Runs a full collection from a non-mutator thread (e.g. a heap-pressure
    /// controller). Mutator threads trigger collections through
    /// [`Mutator::collect`] instead.
    pub fn collect_garbage(self: Arc<Self>) {
        run_stw_collection(&self);
    }

    pub(crate) fn collect_from_mutator(self: Arc<Self>) {
        // The requester counts as stopped for the duration, so the pause does not
        // wait for it.
        let scope = self.safepoint.stopped_scope();
        run_stw_collection(&self);
        drop(scope);
    }

    /****************************************************************************
     * Concurrent drain handoff
     */

    pub(crate) fn concurrent_phase(&self) -> Phase {
        self.concurrent_phase_id.load(atomic::Ordering::Acquire)
    }

    fn start_concurrent_drain(&self) {
        let group = self.conc_group.lock().clone();
        if let Some(group) = group {
            // The completion flag can be raised while workers are still between
            // their termination rendezvous and the park; the group must be idle
            // before it accepts another dispatch.
            group.wait_idle();
            {
                let mut sync = self.concurrent.lock();
                sync.active = true;
                sync.done = false;
            }
            self.concurrent_phase_id
                .store(Phase::Concurrent, atomic::Ordering::Release);
            group.dispatch(Request::Concurrent);
        }
    }

    /// The explicit happens-before edge between background draining and a pause: a
    /// stop-the-world request preempts the drain, then blocks until the draining
    /// workers have published completion of their half.
    pub(crate) fn preempt_concurrent_and_wait(&self) {
        let mut sync = self.concurrent.lock();
        if sync.active {
            self.concurrent_phase_id
                .store(Phase::ConcurrentPreempt, atomic::Ordering::Release);
            while !sync.done {
                self.concurrent_cond.wait(&mut sync);
            }
            sync.active = false;
        }
    }

    /// Called by the rank-zero concurrent worker once its group drained the idle
    /// half to empty.
    pub(crate) fn notify_concurrent_complete(&self) {
        let mut sync = self.concurrent.lock();
        sync.done = true;
        sync.active = false;
        self.concurrent_cond.notify_all();
    }

    /// Stops every worker thread. The heap stays usable for allocation; further
    /// collections run inline on the requesting thread.
    pub fn shutdown(&self) {
        self.preempt_concurrent_and_wait();
        let conc = self.conc_group.lock().take();
        if let Some(group) = conc {
            group.wait_idle();
            group.dispatch(Request::Exit);
            group.wait_idle();
        }
        let stw = self.stw_group.lock().take();
        if let Some(group) = stw {
            group.wait_idle();
            group.dispatch(Request::Exit);
            group.wait_idle();
        }
    }
}

fn run_stw_collection(plan: &Arc<RcImmix>) {
    let _gc = plan.gc_lock.lock();
    plan.preempt_concurrent_and_wait();
    plan.safepoint.arm();
    plan.safepoint.wait_mutators_stopped();
    plan.gc_in_progress.store(true, Ordering::Relaxed);

    let group = plan.stw_group.lock().clone();
    match group {
        Some(group) => {
            group.dispatch(Request::Collect);
            group.wait_idle();
        }
        None => {
            Collector::new(plan.clone()).collect();
        }
    }

    plan.gc_in_progress.store(false, Ordering::Relaxed);
    plan.safepoint.disarm();
    plan.start_concurrent_drain();
}

fn spawn_worker_group(plan: &Arc<RcImmix>, size: usize) -> Arc<WorkerGroup> {
    let group = WorkerGroup::new(size);
    for id in 0..size {
        let plan = plan.clone();
        let group = group.clone();
        std::thread::spawn(move || {
            let mut collector = Collector::with_group(plan, group, id);
            collector.run();
        });
    }
    group
}
