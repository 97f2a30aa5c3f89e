//! The free-list allocator core
use core::{
    fmt,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::Init;

/// The allocation granularity, which is the machine pointer width.
///
/// Every block starts at a multiple of `GRANULARITY` and every block size is
/// a multiple of `GRANULARITY`.
pub const GRANULARITY: usize = mem::size_of::<usize>();

/// The size of the header preceding every payload.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHdr>();

/// The smallest block worth creating: a header plus one word of payload.
/// This is the default split floor of [`FreeList`].
pub const MIN_ALLOC_SIZE: usize = HEADER_SIZE + GRANULARITY;

/// An address-ordered, first-fit free list over application-provided memory
/// pools.
///
/// # Data Structure Overview
///
#[doc = svgbobdoc::transform!(
/// <center>
/// ```svgbob
///   head
///    |
///    v   free block                      used block             free block
///  ,-----+-----+------+-----------,   ,-------------+---------,   ,-----+-----+------+-------,
///  |next |prev | size |  (unused) |   | header      | payload |   |next |prev | size |       |
///  '--+--+-----+------+-----------'   '-------------+---------'   '-----+--+--+------+-------'
///     |    ^                                                         ^   |
///     |    '---------------------------------------------------------+---'
///     '--------------------------------------------------------------'
///  low address                                                               high address
/// ```
/// </center>
)]
///
/// Free blocks are kept in strictly increasing address order, and no two
/// free blocks are adjacent in memory: every deallocation reinserts the block
/// at its address-ordered position and then merges neighbors.
///
/// # Properties
///
/// The header is [`HEADER_SIZE`] bytes long and directly precedes the
/// payload. Payloads are aligned to at least [`GRANULARITY`] bytes.
///
/// `MIN_SPLIT` is the split floor: when a free block is larger than
/// requested, the excess is split off into a new free block only if it is at
/// least `MIN_SPLIT` bytes long (header included). Otherwise the whole block
/// is handed out. Values below [`MIN_ALLOC_SIZE`] are raised to it, and the
/// floor is rounded up to [`GRANULARITY`]. See [`Self::SPLIT_FLOOR`].
///
pub struct FreeList<'pool, const MIN_SPLIT: usize = { MIN_ALLOC_SIZE }> {
    head: Option<NonNull<BlockHdr>>,
    _phantom: PhantomData<&'pool mut ()>,
}

// Safety: All memory block headers directly or indirectly referenced by a
//         particular instance of `FreeList` are logically owned by that
//         `FreeList` and have no interior mutability, so these are safe.
unsafe impl<const MIN_SPLIT: usize> Send for FreeList<'_, MIN_SPLIT> {}

unsafe impl<const MIN_SPLIT: usize> Sync for FreeList<'_, MIN_SPLIT> {}

/// The header of a memory block.
///
/// The links are only meaningful while the block is on the free list. They
/// are left as they are when the block is handed out.
#[repr(C)]
#[derive(Debug)]
struct BlockHdr {
    next_free: Option<NonNull<BlockHdr>>,
    prev_free: Option<NonNull<BlockHdr>>,
    /// The payload size, excluding this header.
    size: usize,
}

impl BlockHdr {
    /// Get the payload address of a block.
    #[inline]
    fn payload(block: NonNull<BlockHdr>) -> NonNull<u8> {
        // Safety: A block header is never located at the end of the address
        //         space because a payload always follows it.
        unsafe { NonNull::new_unchecked((block.as_ptr() as *mut u8).wrapping_add(HEADER_SIZE)) }
    }

    /// Find the header of an allocation. This is the only place where a
    /// header is recovered from a payload pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload address returned by a [`FreeList`].
    #[inline]
    unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<BlockHdr> {
        NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE)).cast()
    }

    /// Get the one-past-end address of a block.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    unsafe fn end(block: NonNull<BlockHdr>) -> usize {
        block.as_ptr() as usize + HEADER_SIZE + block.as_ref().size
    }
}

/// A free block, as reported by [`FreeList::free_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlockInfo {
    start: NonNull<u8>,
    size: usize,
}

impl FreeBlockInfo {
    /// The address of the block header.
    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    /// The address where the payload would begin.
    #[inline]
    pub fn payload(&self) -> NonNull<u8> {
        BlockHdr::payload(self.start.cast())
    }

    /// The usable size of the block, excluding its header.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The one-past-end address of the block.
    #[inline]
    pub fn end(&self) -> usize {
        self.start.as_ptr() as usize + HEADER_SIZE + self.size
    }
}

/// An iterator over the blocks of a [`FreeList`] in address order.
#[derive(Debug, Clone)]
pub struct FreeBlocks<'a> {
    cursor: Option<NonNull<BlockHdr>>,
    _phantom: PhantomData<&'a ()>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = FreeBlockInfo;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let block = self.cursor?;
        // Safety: The iterator borrows the free list, so the headers can't
        //         change under us.
        let (size, next_free) = unsafe { (block.as_ref().size, block.as_ref().next_free) };
        self.cursor = next_free;
        Some(FreeBlockInfo {
            start: block.cast(),
            size,
        })
    }
}

/// A summary of the free list's state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// The number of free blocks.
    pub free_blocks: usize,
    /// The total usable size of all free blocks.
    pub free_bytes: usize,
    /// The usable size of the largest free block.
    pub largest_free_block: usize,
}

impl<const MIN_SPLIT: usize> Default for FreeList<'_, MIN_SPLIT> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<const MIN_SPLIT: usize> Init for FreeList<'_, MIN_SPLIT> {
    const INIT: Self = Self::INIT;
}

impl<const MIN_SPLIT: usize> const_default1::ConstDefault for FreeList<'_, MIN_SPLIT> {
    const DEFAULT: Self = Self::INIT;
}

impl<const MIN_SPLIT: usize> fmt::Debug for FreeList<'_, MIN_SPLIT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.free_blocks()).finish()
    }
}

impl<'pool, const MIN_SPLIT: usize> FreeList<'pool, MIN_SPLIT> {
    /// An empty free list.
    pub const INIT: Self = Self {
        head: None,
        _phantom: PhantomData,
    };

    /// The effective split floor, including the header of the split-off
    /// block.
    pub const SPLIT_FLOOR: usize = {
        let floor = if MIN_SPLIT < MIN_ALLOC_SIZE {
            MIN_ALLOC_SIZE
        } else {
            MIN_SPLIT
        };
        (floor + GRANULARITY - 1) & !(GRANULARITY - 1)
    };

    /// Construct an empty free list.
    #[inline]
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Insert `block` right after `prev`, or at the head if `prev` is `None`.
    ///
    /// # Safety
    ///
    ///  - `block` must be an initialized header owned by `self` that is not
    ///    currently linked.
    ///  - `prev`, if any, must be linked, and the insertion must preserve the
    ///    address order.
    ///
    unsafe fn link_after(
        &mut self,
        prev: Option<NonNull<BlockHdr>>,
        mut block: NonNull<BlockHdr>,
    ) {
        let next = match prev {
            Some(prev) => prev.as_ref().next_free,
            None => self.head,
        };

        block.as_mut().prev_free = prev;
        block.as_mut().next_free = next;

        if let Some(mut next) = next {
            debug_assert!(next > block);
            next.as_mut().prev_free = Some(block);
        }

        match prev {
            Some(mut prev) => {
                debug_assert!(prev < block);
                prev.as_mut().next_free = Some(block);
            }
            None => self.head = Some(block),
        }
    }

    /// Insert `block` before the first free block located at a higher
    /// address, or at the tail if there's none.
    ///
    /// # Safety
    ///
    /// `block` must be an initialized header owned by `self` that is not
    /// currently linked.
    unsafe fn link_ordered(&mut self, block: NonNull<BlockHdr>) {
        let mut prev = None;
        let mut cursor = self.head;

        while let Some(next) = cursor {
            debug_assert_ne!(next, block, "the block is already free");
            if next > block {
                break;
            }
            prev = cursor;
            cursor = next.as_ref().next_free;
        }

        self.link_after(prev, block);
    }

    /// Remove the specified block from the free list.
    ///
    /// # Safety
    ///
    /// The block must be currently included in the free list.
    unsafe fn unlink(&mut self, block: NonNull<BlockHdr>) {
        let next_free = block.as_ref().next_free;
        let prev_free = block.as_ref().prev_free;

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = prev_free;
        }

        if let Some(mut prev_free) = prev_free {
            prev_free.as_mut().next_free = next_free;
        } else {
            debug_assert_eq!(self.head, Some(block));
            self.head = next_free;
        }
    }

    /// Merge every pair of adjacent free blocks in a single forward pass.
    ///
    /// The free list must be address-ordered. A block that absorbed its
    /// successor stays the merge candidate, so runs of adjacent blocks
    /// collapse into one.
    unsafe fn coalesce(&mut self) {
        let mut last: Option<NonNull<BlockHdr>> = None;
        let mut cursor = self.head;

        while let Some(block) = cursor {
            cursor = block.as_ref().next_free;

            if let Some(mut last_block) = last {
                if BlockHdr::end(last_block) == block.as_ptr() as usize {
                    last_block.as_mut().size += HEADER_SIZE + block.as_ref().size;
                    self.unlink(block);
                    continue;
                }
            }

            last = Some(block);
        }
    }

    /// Shrink `block` to `size` bytes if the excess reaches the split floor.
    /// Returns the split-off tail, which is initialized but not linked.
    ///
    /// # Safety
    ///
    /// `block` must be an initialized header owned by `self` whose size is
    /// at least `size`. `size` must be a multiple of `GRANULARITY`.
    unsafe fn carve_tail(
        &mut self,
        mut block: NonNull<BlockHdr>,
        size: usize,
    ) -> Option<NonNull<BlockHdr>> {
        let block_size = block.as_ref().size;
        debug_assert!(block_size >= size);
        debug_assert_eq!(size % GRANULARITY, 0);

        if block_size - size < Self::SPLIT_FLOOR {
            // Too small to be worth tracking; the caller gets all of it
            return None;
        }

        let tail: NonNull<BlockHdr> =
            NonNull::new_unchecked(BlockHdr::payload(block).as_ptr().add(size)).cast();
        tail.as_ptr().write(BlockHdr {
            next_free: None,
            prev_free: None,
            size: block_size - size - HEADER_SIZE,
        });
        block.as_mut().size = size;

        Some(tail)
    }

    /// Calculate how far a payload starting at `start` must be moved forward
    /// to be aligned to `align` bytes.
    ///
    /// A nonzero slack must be large enough to hold the leading block that
    /// will be split off, so it's at least [`Self::SPLIT_FLOOR`] bytes.
    /// Returns `None` on overflow.
    #[inline]
    fn alignment_slack(start: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        let aligned = start.checked_add(align - 1)? & !(align - 1);
        let slack = aligned - start;

        if slack == 0 || slack >= Self::SPLIT_FLOOR {
            Some(slack)
        } else {
            // Skip ahead by whole alignment units until the leading block fits
            let shortfall = Self::SPLIT_FLOOR - slack;
            slack.checked_add(shortfall.checked_add(align - 1)? & !(align - 1))
        }
    }

    /// Find the first free block that can hold `size` bytes at an
    /// `align`-byte boundary. Returns the block and its alignment slack.
    fn search_first_fit(&self, size: usize, align: usize) -> Option<(NonNull<BlockHdr>, usize)> {
        let mut cursor = self.head;

        while let Some(block) = cursor {
            // Safety: `block` is linked, so its header is initialized
            let (block_size, next_free) = unsafe { (block.as_ref().size, block.as_ref().next_free) };
            let start = BlockHdr::payload(block).as_ptr() as usize;

            if let Some(slack) = Self::alignment_slack(start, align) {
                if matches!(size.checked_add(slack), Some(needed) if block_size >= needed) {
                    return Some((block, slack));
                }
            }

            cursor = next_free;
        }

        None
    }

    /// Register a new memory pool specified by its starting address and
    /// length.
    ///
    /// The starting address is rounded up to [`GRANULARITY`] bytes, and the
    /// header and the rounding are subtracted from the length. The pool is
    /// then inserted in address order and merged with any adjacent free
    /// block.
    ///
    /// Returns the usable size of the new free block, or `None` if the pool
    /// is too small to hold a header and one word of payload (in which case
    /// nothing is inserted).
    ///
    /// # Safety
    ///
    /// The memory block will be considered owned by `self`. The memory block
    /// must outlive `self` and must not overlap any other registered pool.
    ///
    /// # Panics
    ///
    /// This method never panics.
    pub unsafe fn insert_free_block_ptr(
        &mut self,
        start: NonNull<u8>,
        len: usize,
    ) -> Option<NonZeroUsize> {
        let unaligned_start = start.as_ptr() as usize;
        let correction =
            (unaligned_start.checked_add(GRANULARITY - 1)? & !(GRANULARITY - 1)) - unaligned_start;

        let size = len.checked_sub(correction)?.checked_sub(HEADER_SIZE)? & !(GRANULARITY - 1);
        if size == 0 {
            return None;
        }

        let block: NonNull<BlockHdr> = NonNull::new_unchecked(start.as_ptr().add(correction)).cast();
        block.as_ptr().write(BlockHdr {
            next_free: None,
            prev_free: None,
            size,
        });

        self.link_ordered(block);
        self.coalesce();

        NonZeroUsize::new(size)
    }

    /// Register a new memory pool specified by a slice.
    ///
    /// # Examples
    ///
    /// ```
    /// use flmalloc::FreeList;
    /// use std::mem::MaybeUninit;
    /// let mut pool = [MaybeUninit::uninit(); 1024];
    /// let mut list: FreeList<'_> = FreeList::INIT;
    /// list.insert_free_block(&mut pool);
    /// ```
    ///
    /// The inserted memory block must outlive `self`:
    ///
    /// ```rust,compile_fail
    /// use flmalloc::FreeList;
    /// use std::mem::MaybeUninit;
    /// let mut list: FreeList<'_> = FreeList::INIT;
    /// let mut pool = [MaybeUninit::uninit(); 1024];
    /// list.insert_free_block(&mut pool);
    /// drop(pool); // dropping the memory block first is not allowed
    /// drop(list);
    /// ```
    #[inline]
    pub fn insert_free_block(&mut self, block: &'pool mut [MaybeUninit<u8>]) -> Option<NonZeroUsize> {
        let len = block.len();
        // Safety: `block` is a mutable reference, which guarantees the absence
        // of aliasing references. Being `'pool` means it will outlive `self`.
        unsafe { self.insert_free_block_ptr(NonNull::from(block).cast(), len) }
    }

    /// Attempt to allocate `size` bytes aligned to [`GRANULARITY`] bytes.
    ///
    /// Returns `None` if `size` is zero or there's no free block large enough.
    /// The free list is left untouched in that case.
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned(GRANULARITY, size)
    }

    /// Attempt to allocate `size` bytes aligned to `align` bytes.
    ///
    /// `align` must be a power of two. Alignments below [`GRANULARITY`] are
    /// raised to it.
    ///
    /// Returns `None` if `size` is zero, `align` is zero or not a power of
    /// two, or there's no free block large enough to hold the payload and
    /// its alignment slack. The free list is left untouched in that case.
    ///
    /// The slack in front of an aligned payload is turned into a separate
    /// free block, so the allocation can be released by
    /// [`Self::deallocate`] just like any other.
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }

        let align = align.max(GRANULARITY);
        let size = size.checked_add(GRANULARITY - 1)? & !(GRANULARITY - 1);

        let (mut block, slack) = self.search_first_fit(size, align)?;

        unsafe {
            if slack > 0 {
                // Split the leading slack off as a free block so that the
                // payload of the remainder lands on the boundary
                let block_size = block.as_ref().size;
                let aligned_block: NonNull<BlockHdr> =
                    NonNull::new_unchecked(block.cast::<u8>().as_ptr().add(slack)).cast();
                aligned_block.as_ptr().write(BlockHdr {
                    next_free: None,
                    prev_free: None,
                    size: block_size - slack,
                });
                block.as_mut().size = slack - HEADER_SIZE;
                self.link_after(Some(block), aligned_block);
                block = aligned_block;
            }

            if let Some(tail) = self.carve_tail(block, size) {
                self.link_after(Some(block), tail);
            }

            self.unlink(block);

            let ptr = BlockHdr::payload(block);
            debug_assert_eq!(ptr.as_ptr() as usize % align, 0);
            Some(ptr)
        }
    }

    /// Deallocate a previously allocated memory block.
    ///
    /// The block is reinserted in address order, and then adjacent free
    /// blocks are merged.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via `self`.
    ///  - The memory block must not have been deallocated already.
    ///
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let block = BlockHdr::from_payload(ptr);
        self.link_ordered(block);
        self.coalesce();
    }

    /// Get the usable size of a previously allocated memory block. This may
    /// be larger than the requested size.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated via `self`.
    #[inline]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        BlockHdr::from_payload(ptr).as_ref().size
    }

    /// Shrink or grow a previously allocated memory block.
    ///
    /// Shrinking happens in place; the released tail goes back to the free
    /// list if it reaches the split floor. Growing allocates a new block
    /// aligned to `align` bytes, copies the contents, and deallocates the old
    /// block.
    ///
    /// Returns the new starting address of the memory block on success;
    /// `None` otherwise, in which case the original block is left intact.
    /// A `new_size` of zero fails.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via `self`.
    ///  - `align` must be a power of two no smaller than the block's original
    ///    alignment.
    ///
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        align: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if new_size == 0 {
            return None;
        }

        let new_size = new_size.checked_add(GRANULARITY - 1)? & !(GRANULARITY - 1);
        let block = BlockHdr::from_payload(ptr);
        let old_size = block.as_ref().size;

        if new_size <= old_size {
            if let Some(tail) = self.carve_tail(block, new_size) {
                self.link_ordered(tail);
                self.coalesce();
            }
            return Some(ptr);
        }

        let new_ptr = self.allocate_aligned(align, new_size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size);
        self.deallocate(ptr);

        Some(new_ptr)
    }

    /// Iterate over the free blocks in address order.
    #[inline]
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            cursor: self.head,
            _phantom: PhantomData,
        }
    }

    /// Summarize the free list.
    pub fn stats(&self) -> Stats {
        self.free_blocks().fold(Stats::default(), |stats, block| Stats {
            free_blocks: stats.free_blocks + 1,
            free_bytes: stats.free_bytes + block.size(),
            largest_free_block: stats.largest_free_block.max(block.size()),
        })
    }
}
