//! Managed pointer type.
//!
//! `Gc<T>` is a traced, non-counting smart pointer to a payload produced by
//! `make_gc`. Reachability is decided by tracing from the root set, never by
//! counting. A free-standing `Gc` registers itself as a root when created;
//! a `Gc` that ends up as a field of a managed object is demoted to a
//! non-root child while that object is adopted by the collector.
//!
//! The second type parameter is the can-be-root knob: containers store their
//! elements as `Gc<T, false>` so pointers inside a reallocating backing
//! buffer are never root-registered.

use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::allocation::{Allocation, AllocationInfo};
use crate::collector;
use crate::node::NodeBase;

/// A managed pointer to a garbage-collected `T`.
///
/// Nullable like a raw pointer. Copying with [`Clone`] produces a new root
/// node pointing at the same payload. Rebinding goes through [`Gc::set`],
/// [`Gc::set_raw`] and [`Gc::clear`], which take the collector mutex so the
/// tracer never observes a half-updated target.
#[repr(C)]
pub struct Gc<T, const CAN_BE_ROOT: bool = true> {
    node: NodeBase,
    target: AtomicPtr<AllocationInfo>,
    _marker: PhantomData<*const T>,
}

// The payload is shared between every pointer to it and may be dropped on
// whichever thread runs the sweep.
unsafe impl<T: Send + Sync, const CAN_BE_ROOT: bool> Send for Gc<T, CAN_BE_ROOT> {}
unsafe impl<T: Send + Sync, const CAN_BE_ROOT: bool> Sync for Gc<T, CAN_BE_ROOT> {}

impl<T, const CAN_BE_ROOT: bool> Gc<T, CAN_BE_ROOT> {
    /// Create a pointer, register it as a root when the kind allows it, and
    /// bind it to `target`.
    pub(crate) fn from_parts(target: Option<Allocation>) -> Self {
        let mut node = NodeBase::new();
        if CAN_BE_ROOT {
            collector::register_ptr_root(node.id(), target);
            node.set_is_root(true);
        }
        Gc {
            node,
            target: AtomicPtr::new(raw_info(target)),
            _marker: PhantomData,
        }
    }

    /// Construct an empty (null) pointer.
    pub fn null() -> Self {
        Self::from_parts(None)
    }

    /// Construct a pointer from a raw payload address.
    ///
    /// `raw` must be null or a payload previously obtained from `make_gc`
    /// (through [`Gc::get`]); anything else triggers the critical-error
    /// callback. The caller is responsible for some other managed pointer
    /// keeping the payload alive; nothing prevents binding a payload whose
    /// last root is dropped before this pointer is used.
    pub fn from_raw(raw: *const T) -> Self {
        let _guard = collector::collector().lock();
        let target = collector::resolve_payload(raw as *const u8);
        Self::from_parts(target)
    }

    /// Current target as an allocation handle.
    pub(crate) fn current_target(&self) -> Option<Allocation> {
        NonNull::new(self.target.load(Ordering::Acquire)).map(Allocation::from_info)
    }

    pub(crate) fn target_info(&self) -> *mut AllocationInfo {
        self.target.load(Ordering::Acquire)
    }

    fn store_target(&self, target: Option<Allocation>) {
        let _guard = collector::collector().lock();
        self.target.store(raw_info(target), Ordering::Release);
        if self.node.is_root() {
            collector::update_ptr_root_target(self.node.id(), target);
        }
    }

    /// Point at the same payload as `other`.
    pub fn set<const R: bool>(&self, other: &Gc<T, R>) {
        self.store_target(other.current_target());
    }

    /// Rebind to a raw payload address, with the same validation as
    /// [`Gc::from_raw`].
    pub fn set_raw(&self, raw: *const T) {
        let _guard = collector::collector().lock();
        let target = collector::resolve_payload(raw as *const u8);
        self.store_target(target);
    }

    /// Reset to null.
    pub fn clear(&self) {
        self.store_target(None);
    }

    /// Raw payload address, or null for an empty pointer.
    pub fn get(&self) -> *mut T {
        self.current_target()
            .map_or(core::ptr::null_mut(), |a| a.payload_ptr() as *mut T)
    }

    /// Shared reference to the payload, or `None` for an empty pointer.
    pub fn as_ref(&self) -> Option<&T> {
        unsafe { (self.get() as *const T).as_ref() }
    }

    pub fn is_null(&self) -> bool {
        self.target.load(Ordering::Acquire).is_null()
    }

    /// Move the binding out into a fresh root pointer, leaving this pointer
    /// null. The managed analogue of a move-assignment.
    pub fn take(&self) -> Gc<T> {
        let _guard = collector::collector().lock();
        let target = self.current_target();
        self.store_target(None);
        Gc::<T>::from_parts(target)
    }

    /// Convert into a pointer that is never root-registered.
    ///
    /// Containers call this for every pointer they store; the stored copies
    /// are enumerated by the container itself during tracing instead.
    pub fn into_unrooted(self) -> Gc<T, false> {
        let _guard = collector::collector().lock();
        let target = self.current_target();
        drop(self);
        Gc::<T, false>::from_parts(target)
    }
}

#[inline]
fn raw_info(target: Option<Allocation>) -> *mut AllocationInfo {
    target.map_or(core::ptr::null_mut(), |a| a.info_ptr())
}

impl<T> Clone for Gc<T, true> {
    /// Create a new root pointer bound to the same payload.
    fn clone(&self) -> Self {
        Self::from_parts(self.current_target())
    }
}

impl<T, const CAN_BE_ROOT: bool> Default for Gc<T, CAN_BE_ROOT> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, const CAN_BE_ROOT: bool> Drop for Gc<T, CAN_BE_ROOT> {
    fn drop(&mut self) {
        if self.node.is_root() {
            collector::deregister_ptr_root(self.node.id());
        }
    }
}

impl<T, const R1: bool, const R2: bool> PartialEq<Gc<T, R2>> for Gc<T, R1> {
    /// Payload-address equality.
    fn eq(&self, other: &Gc<T, R2>) -> bool {
        self.get() == other.get()
    }
}

impl<T, const CAN_BE_ROOT: bool> Eq for Gc<T, CAN_BE_ROOT> {}

impl<T, const CAN_BE_ROOT: bool> Deref for Gc<T, CAN_BE_ROOT> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.as_ref() {
            Some(payload) => payload,
            None => panic!("dereferenced a null managed pointer"),
        }
    }
}

impl<T, const CAN_BE_ROOT: bool> core::fmt::Debug for Gc<T, CAN_BE_ROOT> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gc({:p})", self.get())
    }
}

impl<T, const CAN_BE_ROOT: bool> core::fmt::Pointer for Gc<T, CAN_BE_ROOT> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Pointer::fmt(&self.get(), f)
    }
}

/// Layout-compatible prefix of every `Gc` instantiation, used by the mark
/// phase to read an embedded pointer's target at a learned offset.
#[repr(C)]
struct ErasedGcPrefix {
    _node: NodeBase,
    target: AtomicPtr<AllocationInfo>,
}

/// Read the target of the managed pointer located at `node_addr`.
///
/// # Safety
/// `node_addr` must be the address of a live `Gc` field, reachable only
/// while the collector mutex is held.
pub(crate) unsafe fn read_target_at(node_addr: usize) -> Option<Allocation> {
    let prefix = &*(node_addr as *const ErasedGcPrefix);
    NonNull::new(prefix.target.load(Ordering::Acquire)).map(Allocation::from_info)
}
