//! This crate implements a first-fit, address-ordered free-list dynamic
//! memory allocator.
//!
//!  - **The memory pool is provided by an application.** Examples of potential
//!    memory pool sources include: a `static` array for global memory
//!    allocation, a linker-defined RAM region on a microcontroller, a memory
//!    block allocated by another memory allocator for arena allocation.
//!
//!  - **Free blocks are coalesced eagerly.** The free list is kept sorted by
//!    address, so every deallocation merges the released block with its free
//!    neighbors, and releasing everything always recovers the original
//!    capacity.
//!
//!  - **Aligned allocations carry no wrapper header.** The slack in front of
//!    an aligned payload is split off as a free block, so aligned
//!    allocations are released just like any other.
//!
//!  - **Locking is up to the application.** [`Heap`] brackets every access to
//!    the free list with a [`MallocLock`], which can be a no-op, a spinlock,
//!    or an RTOS primitive.
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal and
//!    RTOS-based applications.
//!
//! # Examples
//!
//! ## `FreeList`: Core API
//!
//! ```rust
//! use flmalloc::FreeList;
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//!
//! // `'pool` represents the memory pool's lifetime (`pool` in this case).
//! let mut list: FreeList<'_> = FreeList::INIT;
//! list.insert_free_block(&mut pool);
//!
//! unsafe {
//!     let mut ptr1 = list.allocate(8).unwrap().cast::<u64>();
//!     let mut ptr2 = list.allocate_aligned(64, 8).unwrap().cast::<u64>();
//!     assert_eq!(ptr2.as_ptr() as usize % 64, 0);
//!     *ptr1.as_mut() = 42;
//!     *ptr2.as_mut() = 56;
//!     assert_eq!(*ptr1.as_ref(), 42);
//!     assert_eq!(*ptr2.as_ref(), 56);
//!     list.deallocate(ptr1.cast());
//!     list.deallocate(ptr2.cast());
//! }
//! ```
//!
//! ## `Heap`: Shared Allocator
//!
//! ```rust
//! use flmalloc::{errno, Heap, SpinLock};
//! use std::mem::MaybeUninit;
//!
//! let pool = Box::leak(Box::new([MaybeUninit::uninit(); 65536]));
//! let heap: Heap<'_, SpinLock> = Heap::INIT;
//! heap.add_pool(pool);
//!
//! let mut out = None;
//! assert_eq!(heap.posix_memalign(&mut out, 256, 100), 0);
//! assert_eq!(out.unwrap().as_ptr() as usize % 256, 0);
//! assert_eq!(heap.posix_memalign(&mut out, 3, 100), errno::EINVAL);
//! ```
//!
//! # Details
//!
//!  - Every block is preceded by a [`HEADER_SIZE`]-byte header. Block
//!    addresses and sizes are multiples of [`GRANULARITY`].
//!
//!  - Allocation scans the free list from the lowest address and takes the
//!    first block that fits, so its cost grows with the number of free
//!    blocks. This crate doesn't provide bounded response times.
//!
//!  - Memory is never returned to the system. Pools live as long as the
//!    allocator using them.
//!
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

/// Emits a log record on setup paths. Expands to nothing unless the `log`
/// feature is enabled.
macro_rules! debug {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!($($tt)*);
    };
}

mod backend;
mod error;
mod free_list;
mod heap;
mod init;
mod lock;
mod offset;
pub use self::{
    backend::*,
    error::{errno, AllocError},
    free_list::{
        FreeBlockInfo, FreeBlocks, FreeList, Stats, GRANULARITY, HEADER_SIZE, MIN_ALLOC_SIZE,
    },
    heap::*,
    init::*,
    lock::*,
    offset::*,
};

#[cfg(any(test, feature = "std"))]
extern crate std;
