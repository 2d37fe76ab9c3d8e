//! The collector.
//!
//! Process-wide singleton owning every allocation and all node bookkeeping:
//! the set of live allocations, the info index used to validate raw-pointer
//! binding, both root sets, the constructing stack, and the gray buffer.
//! Everything is guarded by a single reentrant mutex; reentrancy is required
//! because user destructors running during the sweep phase deregister their
//! own nodes.
//!
//! State mutation goes through a `RefCell` behind the reentrant lock. No
//! borrow is ever held across user code (payload moves, `Trace` impls,
//! destructor trampolines), so reentrant calls cannot observe a held borrow.

use core::cell::RefCell;
use core::mem;
use core::ptr::NonNull;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use hashbrown::{HashMap, HashSet};
use once_cell::sync::Lazy;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::allocation::{self, AllocResult, Allocation, AllocationColor, AllocationInfo};
use crate::callbacks::{critical_error, emit_warning};
use crate::container::{self, EnumerateItems};
use crate::gray_queue::GrayQueue;
use crate::guard::ConstructionGuard;
use crate::node::{NodeBase, NodeId, NodeKind};
use crate::pointer::{self, Gc};
use crate::stats::CollectorStats;
use crate::trace::{Trace, Tracer};
use crate::type_info::TypeInfo;

const NOT_MANAGED_MESSAGE: &str =
    "raw pointer does not reference a managed payload; only pointers previously produced by \
     make_gc can be bound to a managed pointer";

/// Root-set entry of one container node.
pub(crate) struct ContainerRootEntry {
    inner: NonNull<()>,
    enumerate: EnumerateItems,
}

// Entries are only dereferenced under the collector mutex.
unsafe impl Send for ContainerRootEntry {}

/// Read-only view of the collector's root sets, for diagnostics and tests.
///
/// Obtained through [`with_root_nodes`]; the inspection closure runs under
/// the collector mutex and must not call back into the collector.
pub struct RootNodes {
    ptr_roots: HashMap<NodeId, Option<Allocation>>,
    container_roots: HashMap<NodeId, ContainerRootEntry>,
}

impl RootNodes {
    fn new() -> RootNodes {
        RootNodes { ptr_roots: HashMap::new(), container_roots: HashMap::new() }
    }

    /// Number of managed pointers in the root set.
    pub fn gc_ptr_root_count(&self) -> usize {
        self.ptr_roots.len()
    }

    /// Number of managed containers in the root set.
    pub fn gc_container_root_count(&self) -> usize {
        self.container_roots.len()
    }

    /// Whether some root pointer currently targets the given payload.
    pub fn has_ptr_root_to(&self, payload: *const u8) -> bool {
        self.ptr_roots
            .values()
            .any(|target| target.is_some_and(|a| a.payload_addr() == payload as usize))
    }
}

pub(crate) struct CollectorState {
    allocations: HashSet<Allocation>,
    info_index: HashMap<usize, Allocation>,
    roots: RootNodes,
    pub(crate) constructing: Vec<Allocation>,
    gray: GrayQueue,
    stats: CollectorStats,
}

pub(crate) struct GarbageCollector {
    state: ReentrantMutex<RefCell<CollectorState>>,
}

static COLLECTOR: Lazy<GarbageCollector> = Lazy::new(|| GarbageCollector {
    state: ReentrantMutex::new(RefCell::new(CollectorState {
        allocations: HashSet::new(),
        info_index: HashMap::new(),
        roots: RootNodes::new(),
        constructing: Vec::new(),
        gray: GrayQueue::new(),
        stats: CollectorStats::default(),
    })),
});

pub(crate) fn collector() -> &'static GarbageCollector {
    &COLLECTOR
}

impl GarbageCollector {
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<CollectorState>> {
        self.state.lock()
    }

    /// Run `f` with exclusive access to the collector state. `f` must not
    /// run user code.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut CollectorState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }
}

// ============================================================================
// Node registration
// ============================================================================

pub(crate) fn register_ptr_root(id: NodeId, target: Option<Allocation>) {
    collector().with_state(|state| {
        state.roots.ptr_roots.insert(id, target);
    });
}

pub(crate) fn deregister_ptr_root(id: NodeId) {
    collector().with_state(|state| {
        state.roots.ptr_roots.remove(&id);
    });
}

/// Mirror a root pointer's rebinding into the root set, so the mark phase
/// reads targets without touching mutator-owned memory.
pub(crate) fn update_ptr_root_target(id: NodeId, target: Option<Allocation>) {
    collector().with_state(|state| {
        if let Some(entry) = state.roots.ptr_roots.get_mut(&id) {
            *entry = target;
        }
    });
}

pub(crate) fn register_container_root(id: NodeId, inner: NonNull<()>, enumerate: EnumerateItems) {
    collector().with_state(|state| {
        state.roots.container_roots.insert(id, ContainerRootEntry { inner, enumerate });
    });
}

pub(crate) fn deregister_container_root(id: NodeId) {
    collector().with_state(|state| {
        state.roots.container_roots.remove(&id);
    });
}

/// Validate a raw payload address against the info index.
///
/// Null resolves to an empty binding. Any non-null address that does not sit
/// exactly one info header past a registered header is a critical error;
/// this also rejects pointers into the middle of managed objects.
pub(crate) fn resolve_payload(payload: *const u8) -> Option<Allocation> {
    if payload.is_null() {
        return None;
    }

    let payload_addr = payload as usize;
    if payload_addr < AllocationInfo::SIZE {
        critical_error(NOT_MANAGED_MESSAGE);
    }

    let info_addr = payload_addr - AllocationInfo::SIZE;
    match collector().with_state(|state| state.info_index.get(&info_addr).copied()) {
        Some(allocation) => Some(allocation),
        None => critical_error(NOT_MANAGED_MESSAGE),
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Allocate a managed object and return a root pointer to it.
///
/// `T` must be `Send` because the sweep phase destroys payloads on
/// whichever thread runs the collection. Allocation failure is routed
/// through the critical-error callback.
pub fn make_gc<T: Trace + Send + 'static>(value: T) -> Gc<T> {
    match try_make_gc(value) {
        Ok(ptr) => ptr,
        Err(error) => critical_error(&error.to_string()),
    }
}

/// Allocate a managed object, returning an error instead of invoking the
/// critical-error callback when the underlying allocation fails.
pub fn try_make_gc<T: Trace + Send + 'static>(value: T) -> AllocResult<Gc<T>> {
    let collector = collector();
    let _guard = collector.lock();

    #[cfg(feature = "gc_stress_test")]
    {
        if collector.with_state(|state| state.constructing.is_empty()) {
            collect_garbage();
        }
    }

    let type_info = TypeInfo::of::<T>();
    let allocation = allocation::allocate_block(type_info)?;

    collector.with_state(|state| {
        state.allocations.insert(allocation);
        state.info_index.insert(allocation.info_addr(), allocation);
    });
    log::debug!(
        "allocation with payload {:#x} of type {} registered",
        allocation.payload_addr(),
        type_info.type_name()
    );

    {
        let construction_guard = ConstructionGuard::new(allocation);
        let construct = AssertUnwindSafe(move || unsafe {
            (allocation.payload_ptr() as *mut T).write(value);
            adopt_payload_nodes(allocation);
        });
        if let Err(panic) = catch_unwind(construct) {
            // Keep the collector consistent before propagating: pop the
            // constructing entry, unregister and free the block. The payload
            // move itself cannot fail, so the payload is initialized here.
            drop(construction_guard);
            collector.with_state(|state| {
                state.allocations.remove(&allocation);
                state.info_index.remove(&allocation.info_addr());
            });
            unsafe { allocation::destroy(allocation) };
            resume_unwind(panic);
        }
    }

    // Offsets are complete once one construction has fully succeeded. A
    // construction that panicked above never reaches this point, leaving the
    // type open for another discovery pass.
    if !type_info.offsets_frozen() {
        type_info.mark_offsets_frozen();
    }

    Ok(Gc::<T>::from_parts(Some(allocation)))
}

/// Classify the nodes embedded in a freshly written payload.
///
/// Every embedded node registered itself as a root while the value was built
/// on the mutator's stack; adoption demotes each one to a non-root child of
/// the allocation. The first construction of a type discovers the nodes
/// through its `Trace` impl and records their offsets; later constructions
/// walk the cached offsets.
fn adopt_payload_nodes(allocation: Allocation) {
    let type_info = allocation.type_info();
    let payload_addr = allocation.payload_addr();

    if type_info.offsets_frozen() {
        collector().with_state(|state| {
            let fields = type_info.fields();
            for &offset in &fields.ptr_offsets {
                demote_node(state, payload_addr + offset as usize, NodeKind::Pointer);
            }
            for &offset in &fields.container_offsets {
                demote_node(state, payload_addr + offset as usize, NodeKind::Container);
            }
        });
        return;
    }

    // A first construction that failed partway may have left offsets behind
    // without freezing; discovery restarts from an empty table.
    type_info.reset_fields();

    let mut nodes: Vec<(usize, NodeKind)> = Vec::new();
    unsafe {
        (type_info.trace_payload())(allocation.payload_ptr(), &mut Tracer::new(&mut nodes));
    }

    collector().with_state(|state| {
        for (node_addr, kind) in nodes {
            // Search the constructing stack newest-first: a node created by
            // a nested construction belongs to the innermost in-flight
            // allocation whose payload contains it.
            let claimed = state.constructing.iter().rev().any(|candidate| {
                candidate
                    .type_info()
                    .try_register_node_field(node_addr, kind, candidate.payload_addr())
            });
            if claimed {
                demote_node(state, node_addr, kind);
            }
        }
    });
}

/// Turn a root node embedded in a payload into a non-root child.
fn demote_node(state: &mut CollectorState, node_addr: usize, kind: NodeKind) {
    let node = unsafe { &mut *(node_addr as *mut NodeBase) };
    if !node.is_root() {
        return;
    }
    match kind {
        NodeKind::Pointer => {
            state.roots.ptr_roots.remove(&node.id());
        }
        NodeKind::Container => {
            state.roots.container_roots.remove(&node.id());
        }
    }
    node.set_is_root(false);
}

// ============================================================================
// Collection
// ============================================================================

/// Run one full mark-and-sweep collection.
///
/// Returns the number of user objects freed. Holds the collector mutex for
/// the whole collection; mutators block until it finishes.
pub fn collect_garbage() -> usize {
    let collector = collector();
    let _guard = collector.lock();
    log::debug!("garbage collection started");

    // Reset phase: presume every allocation dead.
    collector.with_state(|state| {
        for allocation in &state.allocations {
            allocation.set_color(AllocationColor::White);
        }
    });

    // Mark phase. Root targets are snapshotted from the root sets; pointer
    // roots first, container roots second, draining the gray buffer after
    // each root so the buffer stays small.
    let mut gray = collector.with_state(|state| mem::take(&mut state.gray));
    let (root_targets, root_containers) = collector.with_state(|state| {
        let targets: Vec<Allocation> = state.roots.ptr_roots.values().copied().flatten().collect();
        let containers: Vec<(NonNull<()>, EnumerateItems)> = state
            .roots
            .container_roots
            .values()
            .map(|entry| (entry.inner, entry.enumerate))
            .collect();
        (targets, containers)
    });

    for target in root_targets {
        if target.color() == AllocationColor::White {
            mark_allocation(target, &mut gray);
            drain_gray(&mut gray);
        }
    }
    for (inner, enumerate) in root_containers {
        unsafe { enumerate(inner, &mut |info| push_if_white(info, &mut gray)) };
        drain_gray(&mut gray);
    }

    // Sweep phase: unregister every white allocation, then run destructors.
    // Destructors run after the state borrow is released because they may
    // reenter the collector to deregister nodes of their own.
    let (dead, index_misses) = collector.with_state(|state| {
        let dead: Vec<Allocation> = state
            .allocations
            .iter()
            .filter(|allocation| allocation.color() == AllocationColor::White)
            .copied()
            .collect();
        let mut index_misses = 0usize;
        for allocation in &dead {
            state.allocations.remove(allocation);
            if state.info_index.remove(&allocation.info_addr()).is_none() {
                index_misses += 1;
            }
        }
        (dead, index_misses)
    });
    for _ in 0..index_misses {
        emit_warning("allocation info was missing from the info index during sweep");
    }

    let deleted_count = dead.len();
    for allocation in dead {
        unsafe { allocation::destroy(allocation) };
    }

    collector.with_state(|state| {
        state.gray = gray;
        state.stats.collections_run += 1;
        state.stats.total_objects_freed += deleted_count as u64;
        state.stats.last_objects_freed = deleted_count as u64;
    });

    log::debug!("garbage collection finished, {deleted_count} objects freed");
    deleted_count
}

fn push_if_white(info: *mut AllocationInfo, gray: &mut GrayQueue) {
    if let Some(info) = NonNull::new(info) {
        let allocation = Allocation::from_info(info);
        if allocation.color() == AllocationColor::White {
            gray.push(allocation);
        }
    }
}

fn drain_gray(gray: &mut GrayQueue) {
    while let Some(allocation) = gray.pop() {
        // The buffer may hold duplicates when several fields reference the
        // same target; a black entry has already been scanned.
        if allocation.color() != AllocationColor::Black {
            mark_allocation(allocation, gray);
        }
    }
}

/// Mark one allocation black and push its white children onto the gray
/// buffer, reading embedded pointers and containers at the learned offsets.
fn mark_allocation(allocation: Allocation, gray: &mut GrayQueue) {
    allocation.set_color(AllocationColor::Black);

    let type_info = allocation.type_info();
    if !type_info.offsets_frozen() {
        critical_error("tracer reached an allocation whose type never completed a construction");
    }

    let payload_addr = allocation.payload_addr();
    let fields = type_info.fields();
    for &offset in &fields.ptr_offsets {
        let target = unsafe { pointer::read_target_at(payload_addr + offset as usize) };
        if let Some(target) = target {
            if target.color() == AllocationColor::White {
                gray.push(target);
            }
        }
    }
    for &offset in &fields.container_offsets {
        unsafe {
            container::enumerate_container_at(payload_addr + offset as usize, &mut |info| {
                push_if_white(info, gray)
            });
        }
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Total number of live (not yet freed) managed allocations.
pub fn alive_allocation_count() -> usize {
    collector().with_state(|state| state.allocations.len())
}

/// Inspect the root sets under the collector mutex.
///
/// The closure must not call back into the collector (no allocation, no
/// collection, no node construction or destruction).
pub fn with_root_nodes<R>(f: impl FnOnce(&RootNodes) -> R) -> R {
    let guard = collector().lock();
    let state = guard.borrow();
    f(&state.roots)
}

/// Snapshot of the collection counters.
pub fn collector_stats() -> CollectorStats {
    collector().with_state(|state| state.stats)
}

/// Handle to the collector mutex, held while the guard is alive.
///
/// For callers that must synchronize with the collector externally, such as
/// container implementations outside this crate.
pub struct CollectorLockGuard {
    _guard: ReentrantMutexGuard<'static, RefCell<CollectorState>>,
}

/// Acquire the collector mutex.
pub fn collector_lock() -> CollectorLockGuard {
    CollectorLockGuard { _guard: COLLECTOR.state.lock() }
}
