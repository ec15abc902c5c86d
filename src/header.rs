use std::{
    any::TypeId,
    mem::size_of,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use crossbeam::utils::Backoff;

use crate::object::{Collectable, UntypedGcRef};

/// Outcome of an atomic reference count operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RcOutcome {
    /// The object stays in whatever state it was; no bookkeeping follows.
    Remain,
    /// First increment: the object just left the nursery state and must be scanned.
    IncNew,
    /// The count reached zero: the object is dead and its children must be processed.
    DecKill,
}

/// Which space an object was allocated in. Stored in the header so the reclamation
/// paths can pick the space-specific rule without address-range lookups.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpaceTag {
    RefCount,
    Large,
    Immortal,
}

// State word layout. All mutation of these bits goes through compare-and-swap or
// fetch-and-add below; there is no non-atomic mutation of a published header.
//
// +-------------+--------+----------------------------------------------+
// | field       | bits   |                                              |
// +-------------+--------+----------------------------------------------+
// | rc count    | 0..8   | saturates at RC_STICKY, never overflows      |
// | new         | 8      | set until the first increment                |
// | log state   | 9..11  | unlogged / being logged / logged             |
// | forwarding  | 11..13 | none / being forwarded / forwarded           |
// | pinned      | 13     | object may not move                          |
// | space       | 14..16 | SpaceTag                                     |
// | mark        | 16..24 | backup trace mark, compared against the      |
// |             |        | current mark version                         |
// +-------------+--------+----------------------------------------------+

const RC_MASK: usize = 0xFF;
/// Saturated ("sticky") count. A sticky object is never decremented back to zero;
/// only the backup trace can reclaim it.
pub const RC_STICKY: usize = 0xFF;

const NEW_BIT: usize = 1 << 8;

const LOG_SHIFT: usize = 9;
const LOG_MASK: usize = 0b11 << LOG_SHIFT;
const LOG_BEING_LOGGED: usize = 0b01 << LOG_SHIFT;
const LOG_LOGGED: usize = 0b10 << LOG_SHIFT;

const FWD_SHIFT: usize = 11;
const FWD_MASK: usize = 0b11 << FWD_SHIFT;
const FWD_BEING_FORWARDED: usize = 0b01 << FWD_SHIFT;
const FWD_FORWARDED: usize = 0b10 << FWD_SHIFT;

const PIN_BIT: usize = 1 << 13;

const SPACE_SHIFT: usize = 14;
const SPACE_MASK: usize = 0b11 << SPACE_SHIFT;

const MARK_SHIFT: usize = 16;
const MARK_MASK: usize = 0xFF << MARK_SHIFT;

/// Per-object metadata, prepended to every allocation.
#[repr(C)]
pub struct HeapObjectHeader {
    state: AtomicUsize,
    /// Vtable of the payload type. Once the object is forwarded this word holds the
    /// address of the new header instead; the forwarding bits in `state` say which.
    word: AtomicUsize,
    type_id: TypeId,
    size: AtomicU32,
}

impl HeapObjectHeader {
    /// Writes a fresh header for a newly allocated object. New objects start logged:
    /// their fields are scanned once when they are first counted, so the write
    /// barrier has nothing to record for them.
    ///
    /// # Safety
    /// `at` must point at uninitialized memory large enough for the header.
    pub(crate) unsafe fn initialize(
        at: *mut HeapObjectHeader,
        vtable: usize,
        type_id: TypeId,
        size: usize,
        tag: SpaceTag,
    ) {
        at.write(HeapObjectHeader {
            state: AtomicUsize::new(NEW_BIT | LOG_LOGGED | ((tag as usize) << SPACE_SHIFT)),
            word: AtomicUsize::new(vtable),
            type_id,
            size: AtomicU32::new(size as u32),
        });
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + size_of::<Self>()) as *mut u8
    }

    /// Allocation size of the object, header included.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed) as usize
    }

    #[inline(always)]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[inline(always)]
    pub fn space(&self) -> SpaceTag {
        match (self.state.load(Ordering::Relaxed) & SPACE_MASK) >> SPACE_SHIFT {
            0 => SpaceTag::RefCount,
            1 => SpaceTag::Large,
            _ => SpaceTag::Immortal,
        }
    }

    #[inline(always)]
    pub fn rc_count(&self) -> usize {
        self.state.load(Ordering::Relaxed) & RC_MASK
    }

    #[inline(always)]
    pub fn is_new(&self) -> bool {
        self.state.load(Ordering::Relaxed) & NEW_BIT != 0
    }

    #[inline(always)]
    pub(crate) fn state_is_new(word: usize) -> bool {
        word & NEW_BIT != 0
    }

    /// Atomically increments the reference count. The first increment clears the new
    /// state and reports `IncNew`; the count saturates at [`RC_STICKY`].
    pub fn inc_rc(&self) -> RcOutcome {
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            let (new, outcome) = if old & NEW_BIT != 0 {
                ((old & !(NEW_BIT | RC_MASK)) | 1, RcOutcome::IncNew)
            } else {
                let rc = old & RC_MASK;
                if rc == RC_STICKY {
                    return RcOutcome::Remain;
                }
                ((old & !RC_MASK) | (rc + 1), RcOutcome::Remain)
            };
            match self
                .state
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return outcome,
                Err(v) => old = v,
            }
        }
    }

    /// Increment for an object known to be out of the nursery (e.g. the published
    /// target of a forwarding race).
    pub fn inc_rc_old(&self) {
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(old & NEW_BIT == 0);
            let rc = old & RC_MASK;
            if rc == RC_STICKY {
                return;
            }
            match self.state.compare_exchange_weak(
                old,
                (old & !RC_MASK) | (rc + 1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(v) => old = v,
            }
        }
    }

    /// Atomically decrements the reference count, reporting `DecKill` when it reaches
    /// zero. Sticky counts are never decremented.
    pub fn dec_rc(&self) -> RcOutcome {
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            let rc = old & RC_MASK;
            if rc == RC_STICKY {
                return RcOutcome::Remain;
            }
            debug_assert!(rc > 0, "decrement of a zero reference count");
            if rc == 0 {
                return RcOutcome::Remain;
            }
            let new = (old & !RC_MASK) | (rc - 1);
            match self
                .state
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    return if rc == 1 {
                        RcOutcome::DecKill
                    } else {
                        RcOutcome::Remain
                    }
                }
                Err(v) => old = v,
            }
        }
    }

    /// Reports what an increment would discover without changing the count: `IncNew`
    /// exactly once for a nursery object (which is atomically transitioned out of the
    /// nursery state), `Remain` otherwise. Used when counts are about to be
    /// reconstructed wholesale and only the discovery matters.
    pub fn remain_rc(&self) -> RcOutcome {
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            if old & NEW_BIT == 0 {
                return RcOutcome::Remain;
            }
            match self.state.compare_exchange_weak(
                old,
                old & !NEW_BIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return RcOutcome::IncNew,
                Err(v) => old = v,
            }
        }
    }

    /****************************************************************************
     * Logging (write barrier support)
     */

    /// Fast-path test of the write barrier: does this store need to log the object?
    #[inline(always)]
    pub fn log_required(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOG_MASK != LOG_LOGGED
    }

    /// Races to take responsibility for logging the object. Exactly one caller per
    /// unlogged epoch wins; callers that observe another thread mid-log wait for it
    /// to finish and lose.
    pub fn attempt_to_log(&self) -> bool {
        let backoff = Backoff::new();
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            match old & LOG_MASK {
                LOG_LOGGED => return false,
                LOG_BEING_LOGGED => {
                    backoff.snooze();
                    old = self.state.load(Ordering::Relaxed);
                }
                _ => match self.state.compare_exchange_weak(
                    old,
                    (old & !LOG_MASK) | LOG_BEING_LOGGED,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return true,
                    Err(v) => old = v,
                },
            }
        }
    }

    /// Publishes the completion of logging. Only the thread that won
    /// [`attempt_to_log`](Self::attempt_to_log) may call this.
    pub fn make_logged(&self) {
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert_eq!(old & LOG_MASK, LOG_BEING_LOGGED);
            match self.state.compare_exchange_weak(
                old,
                (old & !LOG_MASK) | LOG_LOGGED,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(v) => old = v,
            }
        }
    }

    /// Clears the logged state so the next mutation epoch logs the object again.
    pub fn make_unlogged(&self) {
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            match self
                .state
                .compare_exchange_weak(old, old & !LOG_MASK, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(v) => old = v,
            }
        }
    }

    #[inline(always)]
    pub fn is_logged(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOG_MASK == LOG_LOGGED
    }

    /****************************************************************************
     * Forwarding
     */

    /// Races to claim the object for forwarding. Returns the state word observed
    /// before the claim; if it already carried a forwarding state the claim failed.
    pub(crate) fn attempt_to_forward(&self) -> usize {
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            if old & FWD_MASK != 0 {
                return old;
            }
            match self.state.compare_exchange_weak(
                old,
                old | FWD_BEING_FORWARDED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prior) => return prior,
                Err(v) => old = v,
            }
        }
    }

    #[inline(always)]
    pub(crate) fn state_is_forwarded_or_being_forwarded(word: usize) -> bool {
        word & FWD_MASK != 0
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        self.state.load(Ordering::Acquire) & FWD_MASK == FWD_FORWARDED
    }

    /// Undoes a successful claim, restoring the observed prior word. Only the
    /// claiming thread may call this, and only before publishing a forwarding.
    pub(crate) fn return_to_prior_state(&self, prior: usize) {
        self.state.store(prior, Ordering::Release);
    }

    /// Publishes `to` as the new location of this object. The old header keeps the
    /// forwarded state forever; spinning discoverers read the target from the word.
    pub(crate) fn set_forwarded(&self, to: UntypedGcRef) {
        self.word
            .store(to.header_ptr() as usize, Ordering::Release);
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            match self.state.compare_exchange_weak(
                old,
                (old & !FWD_MASK) | FWD_FORWARDED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(v) => old = v,
            }
        }
    }

    /// Drops an unpublished claim after an in-place promotion.
    pub(crate) fn clear_forwarding_state(&self) {
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            match self
                .state
                .compare_exchange_weak(old, old & !FWD_MASK, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(v) => old = v,
            }
        }
    }

    /// Waits for a racing forwarder to publish the object's final location. Bounded
    /// spin, then yields.
    pub(crate) fn spin_and_get_forwarded(&self) -> UntypedGcRef {
        let backoff = Backoff::new();
        let mut state = self.state.load(Ordering::Acquire);
        while state & FWD_MASK == FWD_BEING_FORWARDED {
            backoff.snooze();
            state = self.state.load(Ordering::Acquire);
        }
        if state & FWD_MASK == FWD_FORWARDED {
            UntypedGcRef::from_header(self.word.load(Ordering::Acquire) as *mut HeapObjectHeader)
        } else {
            // The claim was reverted: the object was promoted in place.
            UntypedGcRef::from_header(self as *const Self as *mut HeapObjectHeader)
        }
    }

    /****************************************************************************
     * Pinning and backup trace marks
     */

    pub fn pin(&self) {
        self.state.fetch_or(PIN_BIT, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn is_pinned(&self) -> bool {
        self.state.load(Ordering::Relaxed) & PIN_BIT != 0
    }

    #[inline(always)]
    pub(crate) fn state_is_pinned(word: usize) -> bool {
        word & PIN_BIT != 0
    }

    #[inline(always)]
    pub fn is_marked(&self, version: u8) -> bool {
        (self.state.load(Ordering::Acquire) & MARK_MASK) >> MARK_SHIFT == version as usize
    }

    #[inline(always)]
    pub(crate) fn state_is_marked(word: usize, version: u8) -> bool {
        (word & MARK_MASK) >> MARK_SHIFT == version as usize
    }

    /// First-visit test of the backup trace. Atomically installs the current mark
    /// version and restarts the reference count at one (the traced edge); returns
    /// false if another visit got there first.
    pub(crate) fn mark_and_reset_count(&self, version: u8) -> bool {
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            if Self::state_is_marked(old, version) {
                return false;
            }
            let new = (old & !(MARK_MASK | RC_MASK | NEW_BIT)) | ((version as usize) << MARK_SHIFT) | 1;
            match self
                .state
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(v) => old = v,
            }
        }
    }

    /****************************************************************************
     * Scanning support
     */

    #[inline(always)]
    pub(crate) fn vtable(&self) -> usize {
        self.word.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn get_dyn(&mut self) -> &mut dyn Collectable {
        unsafe {
            std::mem::transmute(mopa::TraitObject {
                data: self.payload() as *mut (),
                vtable: self.vtable() as *mut (),
            })
        }
    }

    /// Builds the header of a forwarding destination: counted once, out of the
    /// nursery, logged, optionally carrying the current trace mark.
    pub(crate) fn initialize_copy(&self, mark_version: Option<u8>) {
        let mark = mark_version.map(|v| (v as usize) << MARK_SHIFT).unwrap_or(0);
        self.state.store(
            1 | LOG_LOGGED | ((SpaceTag::RefCount as usize) << SPACE_SHIFT) | mark,
            Ordering::Release,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn fresh(tag: SpaceTag) -> HeapObjectHeader {
        let mut slot = MaybeUninit::<HeapObjectHeader>::uninit();
        unsafe {
            HeapObjectHeader::initialize(slot.as_mut_ptr(), 0, TypeId::of::<()>(), 64, tag);
            slot.assume_init()
        }
    }

    #[test]
    fn inc_transitions_out_of_nursery_once() {
        let h = fresh(SpaceTag::RefCount);
        assert!(h.is_new());
        assert_eq!(h.inc_rc(), RcOutcome::IncNew);
        assert!(!h.is_new());
        assert_eq!(h.rc_count(), 1);
        assert_eq!(h.inc_rc(), RcOutcome::Remain);
        assert_eq!(h.rc_count(), 2);
    }

    #[test]
    fn dec_reports_kill_at_zero() {
        let h = fresh(SpaceTag::RefCount);
        h.inc_rc();
        h.inc_rc();
        assert_eq!(h.dec_rc(), RcOutcome::Remain);
        assert_eq!(h.dec_rc(), RcOutcome::DecKill);
        assert_eq!(h.rc_count(), 0);
    }

    #[test]
    fn count_sticks_at_saturation() {
        let h = fresh(SpaceTag::RefCount);
        for _ in 0..RC_STICKY + 10 {
            h.inc_rc();
        }
        assert_eq!(h.rc_count(), RC_STICKY);
        assert_eq!(h.dec_rc(), RcOutcome::Remain);
        assert_eq!(h.rc_count(), RC_STICKY);
    }

    #[test]
    fn remain_discovers_without_counting() {
        let h = fresh(SpaceTag::RefCount);
        assert_eq!(h.remain_rc(), RcOutcome::IncNew);
        assert_eq!(h.rc_count(), 0);
        assert_eq!(h.remain_rc(), RcOutcome::Remain);
    }

    #[test]
    fn log_race_has_one_winner_per_epoch() {
        let h = fresh(SpaceTag::RefCount);
        // New objects start logged.
        assert!(!h.log_required());
        h.make_unlogged();
        assert!(h.log_required());
        assert!(h.attempt_to_log());
        h.make_logged();
        assert!(!h.attempt_to_log());
        h.make_unlogged();
        assert!(h.attempt_to_log());
    }

    #[test]
    fn forwarding_claim_is_exclusive() {
        let h = fresh(SpaceTag::RefCount);
        let prior = h.attempt_to_forward();
        assert!(!HeapObjectHeader::state_is_forwarded_or_being_forwarded(
            prior
        ));
        let second = h.attempt_to_forward();
        assert!(HeapObjectHeader::state_is_forwarded_or_being_forwarded(
            second
        ));
        h.return_to_prior_state(prior);
        assert!(!h.is_forwarded());
    }

    #[test]
    fn mark_and_reset_is_first_visit_only() {
        let h = fresh(SpaceTag::RefCount);
        for _ in 0..5 {
            h.inc_rc();
        }
        assert!(h.mark_and_reset_count(3));
        assert_eq!(h.rc_count(), 1);
        assert!(!h.mark_and_reset_count(3));
        h.inc_rc_old();
        assert_eq!(h.rc_count(), 2);
        assert!(h.is_marked(3));
        assert!(!h.is_marked(4));
    }
}
