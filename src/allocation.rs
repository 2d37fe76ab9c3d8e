//! Allocation blocks and their info headers.
//!
//! Every managed object lives in one contiguous heap block laid out as
//! `| padding | AllocationInfo | payload |`, where the padding exists only
//! for over-aligned payload types. The info header always sits immediately
//! before the payload, so a payload address converts to its header address
//! by subtracting a fixed header size. That subtraction is also how
//! raw-pointer binding validates candidate pointers against the info index.

use core::ptr::NonNull;
use std::alloc;

use thiserror::Error;

use crate::type_info::TypeInfo;

/// Color of an allocation in the mark-and-sweep algorithm.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum AllocationColor {
    /// Not reached by the tracer; freed by the sweep phase.
    White = 0,
    /// Reached by the tracer; kept.
    Black = 1,
}

/// Header co-located with every payload.
#[repr(C)]
pub struct AllocationInfo {
    pub(crate) color: AllocationColor,
    pub(crate) type_info: &'static TypeInfo,
}

impl AllocationInfo {
    /// Size of the info header. The payload begins this many bytes after
    /// the header's address.
    pub(crate) const SIZE: usize = core::mem::size_of::<AllocationInfo>();
}

/// Allocation error returned by the fallible allocation path.
#[derive(Debug, Error)]
#[error("failed to allocate memory for a new managed object")]
pub struct AllocError;

/// Result type for allocations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Handle to one live allocation block, addressed through its info header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Allocation(NonNull<AllocationInfo>);

// The handle is a plain address; all dereferences happen under the
// collector mutex.
unsafe impl Send for Allocation {}

impl Allocation {
    #[inline]
    pub(crate) fn from_info(info: NonNull<AllocationInfo>) -> Allocation {
        Allocation(info)
    }

    #[inline]
    pub(crate) fn info_ptr(&self) -> *mut AllocationInfo {
        self.0.as_ptr()
    }

    #[inline]
    pub(crate) fn info_addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn type_info(&self) -> &'static TypeInfo {
        unsafe { (*self.0.as_ptr()).type_info }
    }

    /// Address of the user object stored in this block.
    #[inline]
    pub(crate) fn payload_ptr(&self) -> *mut u8 {
        unsafe { (self.0.as_ptr() as *mut u8).add(AllocationInfo::SIZE) }
    }

    #[inline]
    pub(crate) fn payload_addr(&self) -> usize {
        self.payload_ptr() as usize
    }

    /// Base address of the heap block, used for deallocation.
    #[inline]
    fn block_ptr(&self) -> *mut u8 {
        let header_offset = self.type_info().payload_offset() - AllocationInfo::SIZE;
        unsafe { (self.0.as_ptr() as *mut u8).sub(header_offset) }
    }

    #[inline]
    pub(crate) fn color(&self) -> AllocationColor {
        unsafe { (*self.0.as_ptr()).color }
    }

    #[inline]
    pub(crate) fn set_color(&self, color: AllocationColor) {
        unsafe { (*self.0.as_ptr()).color = color }
    }

    /// Whether `addr` lies inside this allocation's payload.
    #[inline]
    #[allow(dead_code)]
    pub(crate) fn payload_contains(&self, addr: usize) -> bool {
        let payload = self.payload_addr();
        addr >= payload && addr < payload + self.type_info().size()
    }
}

/// Allocate and header-initialize a block for one object of the given type.
///
/// The payload is left uninitialized; the caller constructs the object in
/// place and registers the allocation with the collector.
pub(crate) fn allocate_block(type_info: &'static TypeInfo) -> AllocResult<Allocation> {
    let layout = type_info.block_layout();

    unsafe {
        let block = alloc::alloc(layout);
        if block.is_null() {
            return Err(AllocError);
        }

        let info = block.add(type_info.payload_offset() - AllocationInfo::SIZE)
            as *mut AllocationInfo;
        info.write(AllocationInfo { color: AllocationColor::White, type_info });

        Ok(Allocation(NonNull::new_unchecked(info)))
    }
}

/// Run the payload destructor and free the block.
///
/// Only the sweep phase (and the cleanup path of a failed construction)
/// destroys allocations; user code never frees a managed object directly.
///
/// # Safety
/// The payload must be fully initialized and must not be referenced again.
pub(crate) unsafe fn destroy(allocation: Allocation) {
    let type_info = allocation.type_info();
    log::debug!(
        "destroying allocation with payload {:#x} of type {}",
        allocation.payload_addr(),
        type_info.type_name()
    );

    (type_info.drop_payload())(allocation.payload_ptr());
    alloc::dealloc(allocation.block_ptr(), type_info.block_layout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_header_size_is_aligned() {
        assert_eq!(AllocationInfo::SIZE % core::mem::align_of::<AllocationInfo>(), 0);
    }

    #[test]
    fn test_block_round_trip() {
        let info = TypeInfo::of::<u64>();
        let allocation = allocate_block(info).unwrap();

        assert_eq!(allocation.color(), AllocationColor::White);
        assert_eq!(allocation.payload_addr(), allocation.info_addr() + AllocationInfo::SIZE);
        assert_eq!(allocation.payload_addr() % core::mem::align_of::<u64>(), 0);
        assert!(allocation.payload_contains(allocation.payload_addr()));
        assert!(!allocation.payload_contains(allocation.payload_addr() + 8));

        allocation.set_color(AllocationColor::Black);
        assert_eq!(allocation.color(), AllocationColor::Black);

        unsafe {
            (allocation.payload_ptr() as *mut u64).write(7);
            destroy(allocation);
        }
    }
}
