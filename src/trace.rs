use crate::{
    deque::AddressBuffer,
    object::{scan_object, Edge, UntypedGcRef, Visitor},
};

/// Worklist of gray objects owned by one closure engine on one collector thread.
pub struct TraceQueue {
    values: Vec<UntypedGcRef>,
}

impl TraceQueue {
    pub fn new() -> TraceQueue {
        TraceQueue { values: Vec::new() }
    }

    #[inline]
    pub fn push(&mut self, value: UntypedGcRef) {
        self.values.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<UntypedGcRef> {
        self.values.pop()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}

impl Default for TraceQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The root-set closure: reference counting does not trace transitively from roots,
/// it only records every reported root slot so the root-buffer phases can process
/// them.
pub struct RootsClosure<'a> {
    buffer: &'a mut AddressBuffer,
}

impl<'a> RootsClosure<'a> {
    pub fn new(buffer: &'a mut AddressBuffer) -> RootsClosure<'a> {
        RootsClosure { buffer }
    }
}

impl<'a> Visitor for RootsClosure<'a> {
    fn visit_edge(&mut self, slot: Edge) {
        if unsafe { (*slot).is_some() } {
            self.buffer.push(slot);
        }
    }
}

/// Clears every reference field of an object. The immortal space cannot release
/// storage, so a dead immortal object is "finalized" by dropping everything it
/// anchors.
pub struct ZeroScan;

impl Visitor for ZeroScan {
    fn visit_edge(&mut self, slot: Edge) {
        unsafe {
            *slot = None;
        }
    }
}

pub fn zero_scan_object(object: UntypedGcRef) {
    let mut zero = ZeroScan;
    unsafe {
        scan_object(object, &mut zero);
    }
}
