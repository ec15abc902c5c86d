//! Race resolution for concurrent promotion: however many threads discover an
//! unpromoted object at once, exactly one physical copy (or in-place promotion) is
//! produced and every discoverer ends up with the same final location.
//!
//! The claim, spin and publish primitives live on the header; this module performs
//! the physical relocation once a claim is won.

use crate::{
    header::HeapObjectHeader,
    object::UntypedGcRef,
};

/// Relocates `object` into `dest` and publishes the forwarding pointer in the old
/// header. The new header starts counted once, out of the nursery and logged;
/// `mark_version` additionally stamps it as reached by the current backup trace.
///
/// Only the thread that won the forwarding claim may call this.
pub(crate) fn forward_object(
    object: UntypedGcRef,
    dest: *mut u8,
    mark_version: Option<u8>,
) -> UntypedGcRef {
    let size = object.header().size();
    unsafe {
        std::ptr::copy_nonoverlapping(object.header_ptr() as *const u8, dest, size);
    }
    let target = UntypedGcRef::from_header(dest as *mut HeapObjectHeader);
    target.header().initialize_copy(mark_version);
    object.header().set_forwarded(target);
    target
}
