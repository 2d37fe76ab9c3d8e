//! TGC Garbage Collector
//!
//! An embeddable mark-and-sweep garbage collector for otherwise manually
//! managed programs. User code allocates through [`make_gc`], which returns
//! a managed pointer; managed pointers embedded inside managed objects form
//! a traced graph, and [`collect_garbage`] frees everything unreachable from
//! the dynamically maintained root set, cycles included.
//!
//! Key types:
//! - [`Gc<T>`]: a traced, non-counting managed pointer
//! - [`GcVec<T>`]: a managed vector whose stored pointers participate in
//!   tracing instead of being mistaken for roots
//! - [`Trace`]: implemented by managed types to report their managed fields
//!
//! Roots are discovered automatically: a free-standing pointer or container
//! registers itself as a root when created, and is demoted to a non-root
//! child when it turns out to be a field of an allocation made by
//! [`make_gc`]. Field positions are learned once per type and cached, so
//! only the first construction of a type pays for discovery.
//!
//! Collection is explicit. There is no background thread; mutators on other
//! threads block on the collector mutex for the duration of a collection.

mod allocation;
mod callbacks;
mod collector;
mod container;
mod gray_queue;
mod guard;
mod node;
mod pointer;
mod stats;
mod trace;
mod type_info;
mod vector;

pub use allocation::{AllocError, AllocResult, AllocationInfo};
pub use callbacks::{set_diagnostic_callbacks, GcCriticalErrorCallback, GcWarningCallback};
pub use collector::{
    alive_allocation_count, collect_garbage, collector_lock, collector_stats, make_gc,
    try_make_gc, with_root_nodes, CollectorLockGuard, RootNodes,
};
pub use container::{ContainerBase, EnumerateItems};
pub use pointer::Gc;
pub use stats::CollectorStats;
pub use trace::{Trace, Tracer};
pub use type_info::{NodeFieldOffset, TypeInfo};
pub use vector::GcVec;
