//! Per-type records.
//!
//! One `TypeInfo` exists per concrete managed type, obtained through
//! monomorphized trampolines and a process-wide registry. A record stores the
//! type's size and block layout, a destructor trampoline, a discovery
//! trampoline, and the learned byte offsets of the type's managed fields.
//! Offsets are written at most once, during the type's first completed
//! construction; the `offsets_frozen` flag is set when that construction
//! finishes and the lists are read-only afterwards.

use core::alloc::Layout;
use core::any::TypeId;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use crate::allocation::AllocationInfo;
use crate::callbacks::critical_error;
use crate::node::NodeKind;
use crate::trace::{Trace, TraceFn};

/// Type used to store offsets from a payload start to its managed fields.
pub type NodeFieldOffset = u32;

/// Learned managed-field offsets of one type.
#[derive(Default)]
pub(crate) struct FieldTable {
    pub(crate) ptr_offsets: Vec<NodeFieldOffset>,
    pub(crate) container_offsets: Vec<NodeFieldOffset>,
}

/// Information about one garbage-collected type.
pub struct TypeInfo {
    size: usize,
    payload_offset: usize,
    block_layout: Layout,
    type_name: &'static str,
    drop_payload: unsafe fn(*mut u8),
    trace_payload: TraceFn,
    fields: Mutex<FieldTable>,
    offsets_frozen: AtomicBool,
}

static REGISTRY: Lazy<Mutex<HashMap<TypeId, &'static TypeInfo>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl TypeInfo {
    /// Return the process-wide record for `T`, creating it on first use.
    pub fn of<T: Trace + 'static>() -> &'static TypeInfo {
        let mut registry = REGISTRY.lock();
        *registry
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::leak(Box::new(TypeInfo::new::<T>())))
    }

    fn new<T: Trace + 'static>() -> TypeInfo {
        let size = mem::size_of::<T>();
        let align = mem::align_of::<T>();

        // The payload must be T-aligned and the info header must sit
        // immediately before it so that raw-pointer binding can subtract a
        // fixed header size. Over-aligned types get their padding in front
        // of the header.
        let payload_offset = AllocationInfo::SIZE.next_multiple_of(align);
        debug_assert!(payload_offset >= AllocationInfo::SIZE);
        debug_assert!(payload_offset % align.max(1) == 0);

        let block_align = align.max(mem::align_of::<AllocationInfo>());
        let block_layout = Layout::from_size_align(payload_offset + size, block_align).unwrap();

        TypeInfo {
            size,
            payload_offset,
            block_layout,
            type_name: core::any::type_name::<T>(),
            drop_payload: drop_payload_erased::<T>,
            trace_payload: trace_payload_erased::<T>,
            fields: Mutex::new(FieldTable::default()),
            offsets_frozen: AtomicBool::new(false),
        }
    }

    /// Size of the type in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset from the block start to the payload.
    #[inline]
    pub(crate) fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    /// Layout of the whole allocation block, header included.
    #[inline]
    pub(crate) fn block_layout(&self) -> Layout {
        self.block_layout
    }

    /// Name of the type, for diagnostics.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[inline]
    pub(crate) fn drop_payload(&self) -> unsafe fn(*mut u8) {
        self.drop_payload
    }

    #[inline]
    pub(crate) fn trace_payload(&self) -> TraceFn {
        self.trace_payload
    }

    /// Whether the field-offset lists are complete.
    #[inline]
    pub fn offsets_frozen(&self) -> bool {
        self.offsets_frozen.load(Ordering::Acquire)
    }

    /// Mark the field-offset lists complete. Called once the first
    /// construction of the type finishes without an error.
    pub(crate) fn mark_offsets_frozen(&self) {
        self.offsets_frozen.store(true, Ordering::Release);
    }

    pub(crate) fn fields(&self) -> MutexGuard<'_, FieldTable> {
        self.fields.lock()
    }

    /// Discard offsets gathered by an earlier discovery pass that never
    /// froze. Must not be called once the lists are frozen.
    pub(crate) fn reset_fields(&self) {
        debug_assert!(!self.offsets_frozen());
        let mut fields = self.fields.lock();
        fields.ptr_offsets.clear();
        fields.container_offsets.clear();
    }

    /// Learned offsets of managed pointer fields. For diagnostics and tests.
    pub fn ptr_field_offsets(&self) -> Vec<NodeFieldOffset> {
        self.fields.lock().ptr_offsets.clone()
    }

    /// Learned offsets of managed container fields. For diagnostics and tests.
    pub fn container_field_offsets(&self) -> Vec<NodeFieldOffset> {
        self.fields.lock().container_offsets.clone()
    }

    /// Check whether `node_addr` lies inside the payload of an allocation of
    /// this type starting at `payload_addr`, and if so record the node's
    /// offset in the list matching `kind` (unless the lists are frozen).
    ///
    /// Returns `true` iff the node belongs to that payload.
    pub(crate) fn try_register_node_field(
        &self,
        node_addr: usize,
        kind: NodeKind,
        payload_addr: usize,
    ) -> bool {
        if node_addr < payload_addr || node_addr >= payload_addr + self.size {
            return false;
        }

        if self.offsets_frozen() {
            // The node belongs to the payload but the offset is already known.
            return true;
        }

        let offset = node_addr - payload_addr;
        if offset > NodeFieldOffset::MAX as usize {
            critical_error("managed field offset exceeds the limit of the offset table type");
        }

        let mut fields = self.fields.lock();
        match kind {
            NodeKind::Pointer => fields.ptr_offsets.push(offset as NodeFieldOffset),
            NodeKind::Container => fields.container_offsets.push(offset as NodeFieldOffset),
        }
        true
    }
}

unsafe fn drop_payload_erased<T>(payload: *mut u8) {
    core::ptr::drop_in_place(payload as *mut T);
}

unsafe fn trace_payload_erased<T: Trace>(payload: *const u8, tracer: &mut crate::trace::Tracer) {
    (*(payload as *const T)).trace(tracer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_offset_is_aligned() {
        let info = TypeInfo::of::<u64>();
        assert_eq!(info.size(), 8);
        assert_eq!(info.payload_offset() % mem::align_of::<u64>(), 0);
        assert!(info.payload_offset() >= AllocationInfo::SIZE);
    }

    #[test]
    fn test_record_is_a_singleton() {
        let a = TypeInfo::of::<u32>() as *const TypeInfo;
        let b = TypeInfo::of::<u32>() as *const TypeInfo;
        assert_eq!(a, b);
    }

    #[test]
    fn test_field_registration_respects_payload_range() {
        // A private local type keeps this record isolated from other tests.
        struct Probe {
            _a: u64,
            _b: u64,
        }
        unsafe impl Trace for Probe {
            fn trace(&self, _tracer: &mut crate::trace::Tracer<'_>) {}
        }

        let info = TypeInfo::of::<Probe>();
        let payload = 0x1000usize;

        assert!(!info.try_register_node_field(payload - 1, NodeKind::Pointer, payload));
        assert!(!info.try_register_node_field(payload + info.size(), NodeKind::Pointer, payload));
        assert!(info.try_register_node_field(payload + 8, NodeKind::Pointer, payload));
        assert_eq!(info.ptr_field_offsets(), vec![8]);
    }
}
