//! Managed container base.
//!
//! A managed container is a node that stores managed pointers inside a
//! backing buffer and exposes them to the tracer through a static
//! enumeration function, so the stored pointers are never mistaken for
//! roots. Implementing a new container means following the contract below;
//! [`crate::GcVec`] is the exemplar.
//!
//! Contract for container implementations:
//! - store elements as `Gc<T, false>` (use [`crate::Gc::into_unrooted`] on
//!   every pointer taken in) so stored copies are never root-registered;
//! - keep the backing buffer behind a stable heap pointer and hand that
//!   pointer to [`ContainerBase::new`] together with the enumeration
//!   function;
//! - take the collector mutex (via [`crate::collector_lock`]) for the whole
//!   duration of every operation that touches the buffer, including copies;
//! - call [`ContainerBase::notify_destruction`] first thing in the
//!   destructor, before the buffer is torn down.

use core::ptr::NonNull;

use crate::allocation::AllocationInfo;
use crate::collector;
use crate::node::NodeBase;

/// Static per-container-type function that invokes `visit` once per managed
/// pointer currently stored, passing each pointer's target header (null for
/// an empty element).
pub type EnumerateItems = unsafe fn(inner: NonNull<()>, visit: &mut dyn FnMut(*mut AllocationInfo));

/// State embedded at the start of every managed container.
///
/// Creating the base classifies the container: free-standing containers are
/// registered as roots, containers that become fields of a managed object
/// are demoted while that object is adopted.
#[repr(C)]
pub struct ContainerBase {
    node: NodeBase,
    enumerate: EnumerateItems,
    inner: NonNull<()>,
}

impl ContainerBase {
    /// Create container node state over a stable pointer to the container's
    /// backing store.
    pub fn new(inner: NonNull<()>, enumerate: EnumerateItems) -> ContainerBase {
        let mut node = NodeBase::new();
        collector::register_container_root(node.id(), inner, enumerate);
        node.set_is_root(true);
        ContainerBase { node, enumerate, inner }
    }

    pub(crate) fn inner(&self) -> NonNull<()> {
        self.inner
    }

    /// Tell the collector the container is going away.
    ///
    /// Takes the collector mutex unconditionally: a collection that is
    /// currently enumerating this container must finish before the backing
    /// store may be torn down.
    pub fn notify_destruction(&self) {
        let _guard = collector::collector().lock();
        if self.node.is_root() {
            collector::deregister_container_root(self.node.id());
        }
    }
}

/// Run the enumeration function of the container located at `node_addr`.
///
/// # Safety
/// `node_addr` must be the address of a live container field whose first
/// field is a [`ContainerBase`], and the collector mutex must be held.
pub(crate) unsafe fn enumerate_container_at(
    node_addr: usize,
    visit: &mut dyn FnMut(*mut AllocationInfo),
) {
    let base = &*(node_addr as *const ContainerBase);
    (base.enumerate)(base.inner, visit);
}
