use std::sync::Arc;

use crate::{
    allocator::ImmixAllocator,
    backup_trace::BackupTrace,
    deque::{AddressBuffer, DecBuffer, LocalQueue},
    forwarding, gc_log,
    header::{HeapObjectHeader, RcOutcome, SpaceTag},
    object::{scan_object, Edge, UntypedGcRef, Visitor},
    plan::RcImmix,
    protocol_abort,
    scheduler::{Phase, Request, WorkerGroup, COLLECTION_SCHEDULE},
    trace::{zero_scan_object, RootsClosure},
};

/// Per-worker-thread collector context: drives the stop-the-world phase machine and
/// the background concurrent drain.
pub struct Collector {
    pub(crate) plan: Arc<RcImmix>,
    group: Arc<WorkerGroup>,
    id: usize,
    /// Survivor-copy allocator for nursery promotion.
    young: ImmixAllocator,
    /// Defrag-copy allocator, bounded by the copy headroom.
    copy: ImmixAllocator,
    pub(crate) new_roots: AddressBuffer,
    new_roots_back: AddressBuffer,
    pub(crate) old_roots: LocalQueue,
    pub(crate) modbuf: LocalQueue,
    pub(crate) dec: [DecBuffer; 2],
    backup: BackupTrace,
    /// Latched at PREPARE for the whole collection.
    cycle: bool,
    dec_current: usize,
}

unsafe impl Send for Collector {}

impl Collector {
    /// A standalone collector forming its own group of one. Collections run
    /// synchronously on the calling thread.
    pub fn new(plan: Arc<RcImmix>) -> Collector {
        let group = WorkerGroup::new(1);
        Collector::with_group(plan, group, 0)
    }

    pub fn with_group(plan: Arc<RcImmix>, group: Arc<WorkerGroup>, id: usize) -> Collector {
        Collector {
            young: ImmixAllocator::new(&plan.rc_space, false),
            copy: ImmixAllocator::new(&plan.rc_space, true),
            new_roots: AddressBuffer::new(&plan.new_root_pool),
            new_roots_back: AddressBuffer::new(&plan.new_root_back_pool),
            old_roots: LocalQueue::new(&plan.old_root_pool),
            modbuf: LocalQueue::new(&plan.mod_pool),
            dec: [
                DecBuffer::new(&plan.dec_pool[0]),
                DecBuffer::new(&plan.dec_pool[1]),
            ],
            backup: BackupTrace::new(),
            cycle: false,
            dec_current: 0,
            group,
            id,
            plan,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /****************************************************************************
     * Worker loop
     */

    /// Parks between dispatches; runs stop-the-world collections and concurrent
    /// drains as requested until told to exit.
    pub fn run(&mut self) {
        let mut epoch = 0u64;
        loop {
            let request = self.group.park(&mut epoch);
            match request {
                Request::Collect => self.collect(),
                Request::Concurrent => self.concurrent_collect(),
                Request::Exit => {
                    self.group.done();
                    return;
                }
            }
            self.group.done();
        }
    }

    /// Runs the whole stop-the-world schedule. Each phase is fenced by a group
    /// rendezvous; rank zero additionally executes the coordinator side and the
    /// mutator handlers (mutators are stopped for the duration).
    pub fn collect(&mut self) {
        for &phase in COLLECTION_SCHEDULE {
            self.run_phase(phase);
        }
    }

    fn run_phase(&mut self, phase: Phase) {
        let rank = self.group.rendezvous();
        if rank == 0 {
            gc_log!(phase = phase.name(), "collection phase");
            self.plan.global_phase(phase);
            unsafe {
                self.plan.for_each_mutator(|mutator| mutator.collection_phase(phase));
            }
        }
        self.group.rendezvous();
        self.collection_phase(phase, rank == 0);
        self.group.rendezvous();
    }

    /****************************************************************************
     * Concurrent collection
     */

    /// Entry point of the background worker loop.
    pub fn concurrent_collect(&mut self) {
        debug_assert!(!self.plan.gc_in_progress());
        let phase = self.plan.concurrent_phase();
        self.concurrent_collection_phase(phase);
    }

    pub fn concurrent_collection_phase(&mut self, phase: Phase) {
        match phase {
            Phase::Concurrent | Phase::ConcurrentPreempt => {
                if !self.plan.cycle_collection() {
                    let idle = 1 - self.plan.current_dec_pool();
                    gc_log!(worker = self.id, idle, "draining idle decrement half");
                    self.process_dec_buf(idle);
                    debug_assert!(self.dec[idle].is_flushed());
                    debug_assert!(self.plan.dec_pool[idle].is_empty());
                }
                if self.group.rendezvous() == 0 {
                    // The rendezvous saw the whole group finish; one worker owns
                    // the termination signal.
                    self.plan.notify_concurrent_complete();
                }
            }
            _ => protocol_abort(&format!(
                "concurrent phase {} not handled",
                phase.name()
            )),
        }
    }

    /****************************************************************************
     * Stop-the-world phases
     */

    pub fn collection_phase(&mut self, phase: Phase, primary: bool) {
        match phase {
            Phase::Prepare => {
                self.cycle = self.plan.cycle_collection();
                self.dec_current = self.plan.current_dec_pool();
                self.young.reset();
                if self.cycle {
                    self.copy.reset();
                    self.backup.prepare(
                        self.plan.mark_version(),
                        self.plan.rc_space.is_defrag_collection(),
                    );
                }
            }
            Phase::Roots => {
                if primary {
                    let mut closure = RootsClosure::new(&mut self.new_roots);
                    self.plan.scan_roots(&mut closure);
                }
            }
            Phase::Closure => {
                self.new_roots.flush();
            }
            Phase::ProcessOldRootBuffer => {
                // The previous cycle's root pins are released.
                let current = self.dec_current;
                loop {
                    let Some(object) = self.old_roots.pop() else { break };
                    self.dec[current].push(object);
                }
            }
            Phase::ProcessNewRootBuffer => {
                loop {
                    let Some(slot) = self.new_roots.pop() else { break };
                    let Some(object) = (unsafe { *slot }) else {
                        continue;
                    };
                    if self.cycle {
                        if object.header().inc_rc() == RcOutcome::IncNew {
                            self.modbuf.push(object);
                        }
                        // Preserved for fix-up through the backup trace.
                        self.new_roots_back.push(slot);
                    } else {
                        self.survivor_copy(slot, object, true);
                    }
                }
                self.modbuf.flush();
                if self.cycle {
                    self.new_roots_back.flush();
                } else {
                    self.old_roots.flush();
                }
            }
            Phase::ProcessModBuffer => {
                loop {
                    let Some(object) = self.modbuf.pop() else { break };
                    object.header().make_unlogged();
                    let mut visitor = ModEdgeVisitor {
                        collector: &mut *self,
                    };
                    unsafe {
                        scan_object(object, &mut visitor);
                    }
                }
            }
            Phase::ProcessDecBuffer => {
                if self.cycle {
                    self.process_dec_cycle(0);
                    self.process_dec_cycle(1);
                } else {
                    self.dec[0].flush();
                    self.dec[1].flush();
                }
            }
            Phase::BtClosureInit => {
                if self.cycle {
                    loop {
                        let Some(slot) = self.new_roots_back.pop() else { break };
                        let Some(object) = (unsafe { *slot }) else {
                            continue;
                        };
                        let target = self.backup.trace_object(&self.plan, &mut self.copy, object);
                        unsafe {
                            *slot = Some(target);
                        }
                        // The pin baked into the reconstructed count is released by
                        // the next collection.
                        self.old_roots.push(target);
                    }
                    self.old_roots.flush();
                }
            }
            Phase::BtClosure => {
                if self.cycle {
                    self.backup.complete_trace(&self.plan, &mut self.copy);
                }
            }
            Phase::Release => {
                if self.cycle {
                    self.backup.release();
                }
                debug_assert!(self.modbuf.is_flushed());
                debug_assert!(self.new_roots.is_flushed());
                if self.cycle {
                    debug_assert!(self.dec[0].is_flushed());
                    debug_assert!(self.dec[1].is_flushed());
                }
            }
            Phase::SwitchDecPool => {
                self.dec_current = self.plan.current_dec_pool();
            }
            Phase::ConcurrentPreempt => {
                // Finish draining the owned half so the next PROCESS_DECBUFFER finds
                // both halves in a known state.
                if !self.plan.cycle_collection() {
                    let idle = 1 - self.plan.current_dec_pool();
                    self.process_dec_buf(idle);
                    debug_assert!(self.dec[idle].is_flushed());
                }
            }
            Phase::Concurrent => {
                protocol_abort("phase concurrent dispatched inside a pause")
            }
        }
    }

    /****************************************************************************
     * Decrement draining
     */

    /// The full drain of one buffer half: nursery objects are summarily reclaimed,
    /// everything else is decremented, and kills transitively feed children back
    /// into this same pass.
    pub(crate) fn process_dec_buf(&mut self, which: usize) {
        loop {
            let Some(object) = self.dec[which].pop() else { break };
            let header = object.header();
            if header.is_new() {
                // Never counted, so nothing reachable holds it.
                match header.space() {
                    SpaceTag::Large => {
                        self.plan.los.free(object);
                        self.plan.stats.count_reclaimed(1);
                    }
                    SpaceTag::Immortal => {
                        zero_scan_object(object);
                        self.plan.stats.count_reclaimed(1);
                    }
                    SpaceTag::RefCount => {}
                }
            } else if header.dec_rc() == RcOutcome::DecKill {
                self.dec[which].process_children(object);
                match header.space() {
                    SpaceTag::RefCount => self.plan.rc_space.dec_lines(object),
                    SpaceTag::Large => self.plan.los.free(object),
                    SpaceTag::Immortal => zero_scan_object(object),
                }
                self.plan.stats.count_reclaimed(1);
            }
        }
    }

    /// The drain used inside a cycle-collection pause: only the nursery rule
    /// applies. Pending decrements against mature objects are dropped, because the
    /// backup trace is about to reconstruct every live count from scratch.
    fn process_dec_cycle(&mut self, which: usize) {
        loop {
            let Some(object) = self.dec[which].pop() else { break };
            let header = object.header();
            if header.is_new() {
                match header.space() {
                    SpaceTag::Large => {
                        self.plan.los.free(object);
                        self.plan.stats.count_reclaimed(1);
                    }
                    SpaceTag::Immortal => {
                        zero_scan_object(object);
                        self.plan.stats.count_reclaimed(1);
                    }
                    SpaceTag::RefCount => {}
                }
            }
        }
    }

    /****************************************************************************
     * Concurrent promotion
     */

    /// Promotes the nursery object behind `slot` into the counted space, racing
    /// against any other thread that discovered it. Non-nursery objects are simply
    /// counted. The slot is rewritten to the final location.
    pub(crate) fn survivor_copy(&mut self, slot: Edge, object: UntypedGcRef, root: bool) {
        if object.header().space() == SpaceTag::RefCount {
            // Race to be the (potential) forwarder.
            let prior = object.header().attempt_to_forward();
            if HeapObjectHeader::state_is_forwarded_or_being_forwarded(prior) {
                // Lost the race; a peer publishes the final location.
                let target = object.header().spin_and_get_forwarded();
                target.header().inc_rc_old();
                unsafe {
                    *slot = Some(target);
                }
                if root {
                    self.old_roots.push(target);
                }
            } else if !HeapObjectHeader::state_is_new(prior) {
                // Already out of the nursery; undo the claim and count it.
                object.header().return_to_prior_state(prior);
                object.header().inc_rc_old();
                if root {
                    self.old_roots.push(object);
                }
            } else {
                // First to reach the object; promote it.
                let outcome = object.header().inc_rc();
                debug_assert_eq!(outcome, RcOutcome::IncNew);
                let target = if object.header().is_pinned() {
                    object.header().clear_forwarding_state();
                    object
                } else {
                    let dest = self.young.alloc(object.header().size());
                    if dest.is_null() {
                        // Copy space exhausted: promote in place.
                        object.header().clear_forwarding_state();
                        object
                    } else {
                        forwarding::forward_object(object, dest, None)
                    }
                };
                unsafe {
                    *slot = Some(target);
                }
                self.plan.rc_space.inc_lines(target);
                self.modbuf.push(target);
                if root {
                    self.old_roots.push(target);
                }
            }
        } else {
            if object.header().inc_rc() == RcOutcome::IncNew {
                self.modbuf.push(object);
            }
            if root {
                self.old_roots.push(object);
            }
        }
    }

    fn process_mod_edge(&mut self, slot: Edge) {
        let Some(object) = (unsafe { *slot }) else {
            return;
        };
        if self.cycle {
            // Counts are about to be reconstructed; only the discovery of
            // formerly-nursery objects matters here.
            if object.header().remain_rc() == RcOutcome::IncNew {
                self.modbuf.push(object);
            }
        } else {
            self.survivor_copy(slot, object, false);
        }
    }
}

/// Rescans one modified object's current fields, re-incrementing whichever children
/// it references now.
struct ModEdgeVisitor<'a> {
    collector: &'a mut Collector,
}

impl<'a> Visitor for ModEdgeVisitor<'a> {
    fn visit_edge(&mut self, slot: Edge) {
        self.collector.process_mod_edge(slot);
    }
}
