use std::sync::{Arc, Barrier};

use crate::{
    collector::Collector,
    immix_space::{BLOCK_SIZE, LINES_PER_BLOCK, MAX_MEDIUM_OBJECT},
    object::{Collectable, Gc, Trace, UntypedGcRef, Visitor},
    plan::RcImmix,
    scheduler::Phase,
    Options,
};

struct Node {
    next: Option<Gc<Node>>,
    other: Option<Gc<Node>>,
}

impl Node {
    fn new() -> Node {
        Node {
            next: None,
            other: None,
        }
    }
}

unsafe impl Trace for Node {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.next.trace(vis);
        self.other.trace(vis);
    }
}

impl Collectable for Node {}

struct Big {
    _data: [u8; 2 * MAX_MEDIUM_OBJECT],
}

impl Big {
    fn new() -> Big {
        Big {
            _data: [0; 2 * MAX_MEDIUM_OBJECT],
        }
    }
}

unsafe impl Trace for Big {}
impl Collectable for Big {}

/// A heap-registered root slot owned by the test.
struct RootSlot {
    slot: Box<Option<UntypedGcRef>>,
}

impl RootSlot {
    fn new(plan: &Arc<RcImmix>, value: Option<UntypedGcRef>) -> RootSlot {
        let mut slot = Box::new(value);
        unsafe {
            plan.add_root_slot(&mut *slot as *mut Option<UntypedGcRef>);
        }
        RootSlot { slot }
    }

    fn set(&mut self, value: Option<UntypedGcRef>) {
        *self.slot = value;
    }

    fn get(&self) -> UntypedGcRef {
        (*self.slot).unwrap()
    }

    fn node(&self) -> Gc<Node> {
        unsafe { Gc::from_untyped(self.get()) }
    }
}

fn plan_without_workers() -> Arc<RcImmix> {
    RcImmix::new(Options::default())
}

/// Drains the idle decrement-buffer half the way a background worker would.
fn drain_idle_half(plan: &Arc<RcImmix>) {
    let mut drainer = Collector::new(plan.clone());
    drainer.concurrent_collection_phase(Phase::Concurrent);
}

#[test]
fn rc_reclaims_acyclic_garbage_and_backup_trace_reclaims_cycles() {
    let plan = plan_without_workers();
    let mut mutator = plan.clone().bind_mutator();

    let mut a = mutator.allocate(Node::new());
    let b = mutator.allocate(Node::new());
    let c = mutator.allocate(Node::new());
    // A and B reference each other; C references nothing and nothing references C.
    // All three are nursery objects, so the stores need no barrier work.
    a.next = Some(b);
    let mut b_mut = b;
    b_mut.next = Some(a);

    let mut root_a = RootSlot::new(&plan, Some(a.untyped()));
    let mut root_b = RootSlot::new(&plan, Some(b.untyped()));
    let mut root_c = RootSlot::new(&plan, Some(c.untyped()));

    mutator.collect();

    // Everything was promoted; handles come back through the root slots.
    let a2 = root_a.get();
    let b2 = root_b.get();
    let c2 = root_c.get();
    assert!(!a2.header().is_new());
    assert_eq!(a2.header().rc_count(), 2, "root pin + edge from B");
    assert_eq!(b2.header().rc_count(), 2, "root pin + edge from A");
    assert_eq!(c2.header().rc_count(), 1, "root pin only");
    // The promoted copies reference each other's promoted copies.
    assert_eq!(root_a.node().next.unwrap().untyped(), b2);
    assert_eq!(root_b.node().next.unwrap().untyped(), a2);

    // Drop every root: A and B survive as an unreachable cycle, C is plain garbage.
    root_a.set(None);
    root_b.set(None);
    root_c.set(None);
    mutator.collect();
    let reclaimed_before_drain = plan.stats.reclaimed();
    drain_idle_half(&plan);

    assert_eq!(plan.stats.reclaimed(), reclaimed_before_drain + 1, "only C dies");
    assert_eq!(c2.header().rc_count(), 0);
    assert_eq!(a2.header().rc_count(), 1, "cycle keeps itself alive under pure RC");
    assert_eq!(b2.header().rc_count(), 1);

    // The backup trace reaches neither A nor B; their lines come back.
    plan.request_cycle_collection();
    mutator.collect();
    let blocks = plan.rc_space.committed_bytes() / BLOCK_SIZE;
    assert_eq!(plan.rc_space.free_lines(), blocks * (LINES_PER_BLOCK - 1));
    assert_eq!(
        plan.stats.empty_blocks_after_gc.load(std::sync::atomic::Ordering::Relaxed),
        blocks
    );
}

#[test]
fn cycle_collection_rebuilds_counts_and_preserves_live_objects() {
    let plan = plan_without_workers();
    let mut mutator = plan.clone().bind_mutator();

    let mut a = mutator.allocate(Node::new());
    let b = mutator.allocate(Node::new());
    a.next = Some(b);
    let mut root = RootSlot::new(&plan, Some(a.untyped()));

    mutator.collect();
    let a2 = root.get();
    let b2 = root.node().next.unwrap().untyped();
    assert_eq!(a2.header().rc_count(), 1);
    assert_eq!(b2.header().rc_count(), 1);

    // Saturate A's count; only the backup trace can bring it back down.
    for _ in 0..400 {
        a2.header().inc_rc_old();
    }
    assert_eq!(a2.header().rc_count(), crate::header::RC_STICKY);
    assert_eq!(a2.header().dec_rc(), crate::header::RcOutcome::Remain);

    plan.request_cycle_collection();
    mutator.collect();

    let a3 = root.get();
    let b3 = root.node().next.unwrap().untyped();
    assert_eq!(a3.header().rc_count(), 1, "one root edge");
    assert_eq!(b3.header().rc_count(), 1, "one edge from A");
    assert!(a3.header().is_marked(plan.mark_version()));

    // The pin baked into the rebuilt count is released like any other old root.
    root.set(None);
    let before = plan.stats.reclaimed();
    mutator.collect();
    drain_idle_half(&plan);
    assert_eq!(plan.stats.reclaimed(), before + 2, "A and B die through the kill path");
    assert_eq!(a3.header().rc_count(), 0);
    assert_eq!(b3.header().rc_count(), 0);
}

#[test]
fn write_barrier_logs_an_object_once_per_epoch() {
    let plan = plan_without_workers();
    let mut mutator = plan.clone().bind_mutator();

    let mut x = mutator.allocate(Node::new());
    let w = mutator.allocate(Node::new());
    x.next = Some(w);
    let root = RootSlot::new(&plan, Some(x.untyped()));
    mutator.collect();

    let x2 = root.get();
    let mut x2_node = root.node();
    assert!(!x2.header().is_logged(), "rescan leaves the object unlogged");

    let y = mutator.allocate(Node::new());
    let z = mutator.allocate(Node::new());
    mutator.object_reference_write(x2, &mut x2_node.next, Some(y));
    assert!(x2.header().is_logged());
    assert_eq!(mutator.modbuf.local_len(), 1);
    let target = mutator.dec_target;
    assert_eq!(
        mutator.dec[target].local_len(),
        1,
        "one pending decrement for the overwritten child"
    );

    // Second and third stores in the same epoch add nothing.
    mutator.object_reference_write(x2, &mut x2_node.next, Some(z));
    let swapped =
        mutator.object_reference_try_compare_and_swap(x2, &mut x2_node.next, Some(z), None);
    assert!(swapped);
    assert_eq!(mutator.modbuf.local_len(), 1);
    assert_eq!(mutator.dec[target].local_len(), 1);
}

#[test]
fn double_buffer_deterministic_alternation_drains_exactly_once() {
    let plan = plan_without_workers();
    let mut mutator = plan.clone().bind_mutator();
    const ROUNDS: usize = 6;
    const OBJECTS: usize = 8;

    let objects: Vec<UntypedGcRef> = (0..OBJECTS)
        .map(|_| {
            let object = mutator.allocate(Node::new()).untyped();
            object.header().inc_rc();
            for _ in 0..ROUNDS {
                object.header().inc_rc_old();
            }
            object
        })
        .collect();

    let mut drainer = Collector::new(plan.clone());
    for _ in 0..ROUNDS {
        for &object in &objects {
            mutator.dec_buffer().push(object);
        }
        mutator.dec_buffer().flush();
        // The pause-time broadcast: flip the live half, then every producer
        // retargets before it can enqueue again.
        plan.global_phase(Phase::SwitchDecPool);
        mutator.collection_phase(Phase::SwitchDecPool);
        drainer.concurrent_collection_phase(Phase::Concurrent);
    }

    for &object in &objects {
        assert_eq!(
            object.header().rc_count(),
            1,
            "every enqueued decrement applied exactly once"
        );
    }
}

#[test]
fn double_buffer_with_racing_producer_and_drainer() {
    let plan = plan_without_workers();
    const ROUNDS: usize = 16;
    const OBJECTS: usize = 64;

    let objects: Vec<UntypedGcRef> = {
        let mut mutator = plan.clone().bind_mutator();
        (0..OBJECTS)
            .map(|_| {
                let object = mutator.allocate(Node::new()).untyped();
                object.header().inc_rc();
                for _ in 0..ROUNDS {
                    object.header().inc_rc_old();
                }
                object
            })
            .collect()
    };

    let switch = Barrier::new(2);
    crossbeam::thread::scope(|scope| {
        let producer_plan = &plan;
        let producer_objects = &objects;
        let switch = &switch;
        scope.spawn(move |_| {
            let mut mutator = producer_plan.clone().bind_mutator();
            for _ in 0..ROUNDS {
                for &object in producer_objects {
                    mutator.dec_buffer().push(object);
                }
                mutator.dec_buffer().flush();
                switch.wait();
                // The coordinator flips between the barriers.
                switch.wait();
                mutator.collection_phase(Phase::SwitchDecPool);
            }
        });

        let mut drainer = Collector::new(plan.clone());
        for _ in 0..ROUNDS {
            switch.wait();
            plan.global_phase(Phase::SwitchDecPool);
            switch.wait();
            // Drain the vacated half while the producer races ahead into the
            // newly live one.
            drainer.concurrent_collection_phase(Phase::Concurrent);
        }
    })
    .unwrap();

    for &object in &objects {
        assert_eq!(object.header().rc_count(), 1);
    }
}

#[test]
fn racing_promoters_produce_exactly_one_copy() {
    let plan = plan_without_workers();
    let mut mutator = plan.clone().bind_mutator();
    let object = mutator.allocate(Node::new()).untyped();
    const THREADS: usize = 8;

    let start = Barrier::new(THREADS);
    let results: Vec<UntypedGcRef> = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let plan = plan.clone();
                let start = &start;
                scope.spawn(move |_| {
                    let mut collector = Collector::new(plan);
                    let mut slot: Option<UntypedGcRef> = Some(object);
                    start.wait();
                    collector.survivor_copy(&mut slot as *mut _, object, false);
                    slot.unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    let target = results[0];
    for &seen in &results {
        assert_eq!(seen, target, "every discoverer observes the same location");
    }
    assert_eq!(
        target.header().rc_count(),
        THREADS,
        "one nursery transition plus one increment per losing discoverer"
    );
    assert!(!target.header().is_new());
    assert!(
        object.header().is_forwarded(),
        "exactly one physical relocation happened"
    );
    assert_ne!(target, object);
}

#[test]
fn defrag_cycle_collection_relocates_live_objects() {
    let plan = plan_without_workers();
    let mut mutator = plan.clone().bind_mutator();

    let mut a = mutator.allocate(Node::new());
    let b = mutator.allocate(Node::new());
    a.next = Some(b);
    let root = RootSlot::new(&plan, Some(a.untyped()));
    mutator.collect();
    let a2 = root.get();

    plan.rc_space.force_defrag();
    plan.request_cycle_collection();
    mutator.collect();

    assert!(!plan.rc_space.is_defrag_collection(), "flag clears at release");
    let a3 = root.get();
    assert_ne!(a3, a2, "the live object moved out of its fragmented block");
    assert!(a2.header().is_forwarded());
    assert_eq!(a3.header().rc_count(), 1);
    assert!(a3.header().is_marked(plan.mark_version()));
    // The relocated copy still references B's final location.
    let b3 = root.node().next.unwrap().untyped();
    assert_eq!(b3.header().rc_count(), 1);
}

#[test]
fn dead_immortal_objects_are_zero_scanned() {
    let plan = plan_without_workers();
    let mut mutator = plan.clone().bind_mutator();

    let target = mutator.allocate(Node::new());
    let mut immortal = mutator.allocate_immortal(Node::new());
    immortal.next = Some(target);
    let root = RootSlot::new(&plan, Some(target.untyped()));

    plan.request_cycle_collection();
    mutator.collect();

    assert!(
        immortal.next.is_none(),
        "the dead immortal object anchors nothing"
    );
    assert_eq!(root.get().header().rc_count(), 1, "the rooted target survives");
}

#[test]
fn unreferenced_large_objects_are_freed_by_the_nursery_rule() {
    let plan = plan_without_workers();
    let mut mutator = plan.clone().bind_mutator();

    let big = mutator.allocate(Big::new());
    assert_eq!(plan.los.cell_count(), 1);
    assert!(big.untyped().header().is_new());

    let before = plan.stats.reclaimed();
    plan.request_cycle_collection();
    mutator.collect();

    assert_eq!(plan.los.cell_count(), 0);
    assert_eq!(plan.stats.reclaimed(), before + 1);
}

#[test]
fn worker_pool_collections_and_background_draining() {
    let mut options = Options::default();
    options.collector_threads = 2;
    options.concurrent_threads = 1;
    let plan = RcImmix::new(options);
    let mut mutator = plan.clone().bind_mutator();

    let a = mutator.allocate(Node::new());
    let mut root = RootSlot::new(&plan, Some(a.untyped()));
    mutator.collect();
    let a2 = root.get();
    assert_eq!(a2.header().rc_count(), 1);

    // The decrement for the dropped pin is drained in the background; the next
    // pause preempts the drain and waits for its completion flag.
    root.set(None);
    mutator.collect();
    let before = plan.stats.reclaimed();
    mutator.collect();
    assert!(
        plan.stats.reclaimed() > before || a2.header().rc_count() == 0,
        "the backlog was drained before the pause proceeded"
    );

    plan.shutdown();
}
