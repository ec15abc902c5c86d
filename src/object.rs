use std::{
    any::TypeId,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
};

use mopa::mopafy;

use crate::header::HeapObjectHeader;

/// Implemented by GC-managed types to report their reference fields. Every field that
/// can hold a heap reference must be passed to the visitor, otherwise the collector
/// will free objects that are still reachable through it.
pub unsafe trait Trace {
    fn trace(&mut self, _vis: &mut dyn Visitor) {}
}

/// A type that can be allocated on the GC heap.
pub trait Collectable: Trace + mopa::Any {
    fn allocation_size(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

mopafy!(Collectable);

/// Address of a reference field inside an object, a root set, or a stack map. The
/// collector reads the current referent through it and rewrites it in place when the
/// referent moves.
pub type Edge = *mut Option<UntypedGcRef>;

/// Receives the reference fields of an object during a scan.
pub trait Visitor {
    fn visit_edge(&mut self, slot: Edge);
}

/// An untyped reference to a heap object. Points at the object header; the heap space
/// that produced the object owns the storage behind it.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UntypedGcRef {
    pub(crate) header: NonNull<HeapObjectHeader>,
}

unsafe impl Send for UntypedGcRef {}
unsafe impl Sync for UntypedGcRef {}

impl UntypedGcRef {
    #[inline(always)]
    pub(crate) fn from_header(header: *mut HeapObjectHeader) -> UntypedGcRef {
        UntypedGcRef {
            header: unsafe { NonNull::new_unchecked(header) },
        }
    }

    #[inline(always)]
    pub fn header(&self) -> &HeapObjectHeader {
        unsafe { &*self.header.as_ptr() }
    }

    #[inline(always)]
    pub(crate) fn header_ptr(&self) -> *mut HeapObjectHeader {
        self.header.as_ptr()
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        self.header().payload()
    }
}

impl fmt::Debug for UntypedGcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UntypedGcRef({:p})", self.header)
    }
}

impl fmt::Pointer for UntypedGcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.header)
    }
}

/// A typed reference to a heap object.
#[repr(transparent)]
pub struct Gc<T: Collectable + ?Sized> {
    pub(crate) base: NonNull<HeapObjectHeader>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable + ?Sized> Gc<T> {
    #[inline(always)]
    pub fn untyped(self) -> UntypedGcRef {
        UntypedGcRef { header: self.base }
    }

    pub fn is<U: Collectable>(&self) -> bool {
        unsafe { (*self.base.as_ptr()).type_id() == TypeId::of::<U>() }
    }

    pub fn downcast<U: Collectable>(&self) -> Option<Gc<U>> {
        if self.is::<U>() {
            Some(Gc {
                base: self.base,
                marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// # Safety
    /// `raw` must reference a live object whose payload is a `T`.
    #[inline(always)]
    pub unsafe fn from_untyped(raw: UntypedGcRef) -> Gc<T> {
        Gc {
            base: raw.header,
            marker: PhantomData,
        }
    }
}

impl<T: Collectable + Sized> Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*(*self.base.as_ptr()).payload().cast::<T>() }
    }
}

impl<T: Collectable + Sized> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *(*self.base.as_ptr()).payload().cast::<T>() }
    }
}

impl<T: Collectable + ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Collectable + ?Sized> Copy for Gc<T> {}

impl<T: Collectable + ?Sized> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
    }
}

impl<T: Collectable + ?Sized> Eq for Gc<T> {}

impl<T: Collectable + ?Sized> fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.base)
    }
}

unsafe impl<T: Collectable + ?Sized> Send for Gc<T> {}

// `Option<Gc<T>>` and `Option<UntypedGcRef>` are both a nullable pointer to the object
// header (`Gc` and `UntypedGcRef` are `repr(transparent)` over `NonNull`), so a field
// can be handed to the visitor as a rewritable edge.
unsafe impl<T: Collectable + ?Sized> Trace for Option<Gc<T>> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.visit_edge(self as *mut Self as Edge);
    }
}

unsafe impl<T: Collectable + ?Sized> Trace for Gc<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.visit_edge(self as *mut Self as Edge);
    }
}

pub(crate) fn vtable_of<T: Collectable>() -> usize {
    let x = null_mut::<T>();
    unsafe { std::mem::transmute::<_, mopa::TraitObject>(x as *mut dyn Collectable).vtable as _ }
}

/// Invokes `trace` on the object behind `obj`, reporting every reference field to
/// `vis`.
///
/// # Safety
/// `obj` must reference a live, fully initialized object.
pub unsafe fn scan_object(obj: UntypedGcRef, vis: &mut dyn Visitor) {
    (*obj.header_ptr()).get_dyn().trace(vis);
}
