use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Identifier of one step of a collection. Stop-the-world phases run once per
/// collection, in schedule order, by every worker of the stop-the-world group with
/// a barrier between phases. The concurrent phases drive the background drain loop
/// outside any pause.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Prepare,
    Roots,
    Closure,
    ProcessOldRootBuffer,
    ProcessNewRootBuffer,
    ProcessModBuffer,
    ProcessDecBuffer,
    BtClosureInit,
    BtClosure,
    Release,
    /// Mutator-visible broadcast: the live decrement-buffer half changed; every
    /// mutator retargets its local enqueues before it resumes.
    SwitchDecPool,
    /// Background draining of the idle decrement-buffer half.
    Concurrent,
    /// A stop-the-world request arrived during background draining; the worker
    /// finishes its half before yielding.
    ConcurrentPreempt,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Roots => "roots",
            Phase::Closure => "closure",
            Phase::ProcessOldRootBuffer => "process-old-root-buffer",
            Phase::ProcessNewRootBuffer => "process-new-root-buffer",
            Phase::ProcessModBuffer => "process-mod-buffer",
            Phase::ProcessDecBuffer => "process-dec-buffer",
            Phase::BtClosureInit => "bt-closure-init",
            Phase::BtClosure => "bt-closure",
            Phase::Release => "release",
            Phase::SwitchDecPool => "switch-dec-pool",
            Phase::Concurrent => "concurrent",
            Phase::ConcurrentPreempt => "concurrent-preempt",
        }
    }
}

/// The stop-the-world schedule, in execution order.
pub const COLLECTION_SCHEDULE: &[Phase] = &[
    Phase::Prepare,
    Phase::Roots,
    Phase::Closure,
    Phase::ProcessOldRootBuffer,
    Phase::ProcessNewRootBuffer,
    Phase::ProcessModBuffer,
    Phase::ProcessDecBuffer,
    Phase::BtClosureInit,
    Phase::BtClosure,
    Phase::Release,
    Phase::SwitchDecPool,
];

/// What a parked worker wakes up to do.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Request {
    Collect,
    Concurrent,
    Exit,
}

struct RendezvousState {
    arrived: usize,
    generation: u64,
}

/// Counting barrier. Every member blocks until the whole group arrives; the return
/// value is the arrival rank, so rank zero can take group-wide responsibilities
/// (root scanning, termination signalling).
pub struct Rendezvous {
    size: usize,
    state: Mutex<RendezvousState>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new(size: usize) -> Rendezvous {
        Rendezvous {
            size,
            state: Mutex::new(RendezvousState {
                arrived: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn rendezvous(&self) -> usize {
        let mut state = self.state.lock();
        let generation = state.generation;
        let rank = state.arrived;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
            return rank;
        }
        while state.generation == generation {
            self.cond.wait(&mut state);
        }
        rank
    }
}

struct GroupState {
    epoch: u64,
    request: Request,
    active: usize,
}

/// A fixed pool of collector workers. Workers park between dispatches; a dispatch
/// wakes the whole group on one request and the dispatcher can block until every
/// worker finished it.
pub struct WorkerGroup {
    size: usize,
    state: Mutex<GroupState>,
    cond: Condvar,
    rendezvous: Rendezvous,
}

impl WorkerGroup {
    pub fn new(size: usize) -> Arc<WorkerGroup> {
        Arc::new(WorkerGroup {
            size,
            state: Mutex::new(GroupState {
                epoch: 0,
                request: Request::Exit,
                active: 0,
            }),
            cond: Condvar::new(),
            rendezvous: Rendezvous::new(size),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Parks until a dispatch newer than `last_epoch` arrives.
    pub fn park(&self, last_epoch: &mut u64) -> Request {
        let mut state = self.state.lock();
        while state.epoch == *last_epoch {
            self.cond.wait(&mut state);
        }
        *last_epoch = state.epoch;
        state.request
    }

    /// Wakes the whole group on `request`. The previous dispatch must have
    /// completed.
    pub fn dispatch(&self, request: Request) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.active, 0, "dispatch while the group is active");
        state.epoch += 1;
        state.request = request;
        state.active = self.size;
        self.cond.notify_all();
    }

    /// Reports one worker's completion of the current dispatch.
    pub fn done(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.cond.notify_all();
        }
    }

    /// Blocks until every worker finished the current dispatch.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.active > 0 {
            self.cond.wait(&mut state);
        }
    }

    pub fn rendezvous(&self) -> usize {
        self.rendezvous.rendezvous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_of_one_is_immediate() {
        let r = Rendezvous::new(1);
        assert_eq!(r.rendezvous(), 0);
        assert_eq!(r.rendezvous(), 0);
    }

    #[test]
    fn rendezvous_ranks_are_unique() {
        let r = Rendezvous::new(4);
        let mut ranks: Vec<usize> = crossbeam::thread::scope(|s| {
            let handles: Vec<_> = (0..4).map(|_| s.spawn(|_| r.rendezvous())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
        .unwrap();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn group_dispatch_runs_every_worker() {
        let group = WorkerGroup::new(3);
        let counter = std::sync::atomic::AtomicUsize::new(0);
        crossbeam::thread::scope(|s| {
            for _ in 0..3 {
                let group = group.clone();
                let counter = &counter;
                s.spawn(move |_| {
                    let mut epoch = 0;
                    loop {
                        match group.park(&mut epoch) {
                            Request::Exit => {
                                group.done();
                                return;
                            }
                            _ => {
                                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                                group.done();
                            }
                        }
                    }
                });
            }
            group.dispatch(Request::Collect);
            group.wait_idle();
            assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
            group.dispatch(Request::Exit);
            group.wait_idle();
        })
        .unwrap();
    }
}
