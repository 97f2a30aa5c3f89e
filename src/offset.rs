use core::{mem, ptr::NonNull};

use crate::{Backend, Init};

/// The type of the offset stored behind each aligned pointer.
type Offset = u16;

const OFFSET_SIZE: usize = mem::size_of::<Offset>();

/// Aligned allocation on top of a [`Backend`] that only provides plain
/// allocation.
///
/// Each request is over-allocated by the alignment plus the size of a `u16`.
/// The returned pointer is aligned within that block, and the distance back
/// to the block's start is stored in the two bytes right behind it.
///
/// This is for black-box backends. [`Heap`](crate::Heap) aligns allocations
/// natively and doesn't waste the slack.
///
/// ```rust
/// use flmalloc::{Heap, OffsetAligned};
/// use std::mem::MaybeUninit;
///
/// let mut pool = [MaybeUninit::uninit(); 4096];
/// let heap: Heap<'_> = Heap::INIT;
/// heap.add_pool(&mut pool);
///
/// let aligned = OffsetAligned::new(&heap);
/// let ptr = aligned.aligned_alloc(256, 100).unwrap();
/// assert_eq!(ptr.as_ptr() as usize % 256, 0);
/// unsafe { aligned.aligned_free(Some(ptr)) };
/// ```
#[derive(Debug)]
pub struct OffsetAligned<B> {
    backend: B,
}

impl<B: Init> Init for OffsetAligned<B> {
    const INIT: Self = Self::new(B::INIT);
}

impl<B> OffsetAligned<B> {
    /// Wrap `backend`.
    #[inline]
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Get a reference to the underlying backend.
    #[inline]
    pub fn get_ref(&self) -> &B {
        &self.backend
    }

    /// Unwrap the underlying backend.
    #[inline]
    pub fn into_inner(self) -> B {
        self.backend
    }
}

impl<B: Backend> OffsetAligned<B> {
    /// Allocate `size` bytes aligned to `align` bytes.
    ///
    /// Returns `None` if `size` is zero, `align` is zero or not a power of
    /// two, `align` is too large for the offset to fit in a `u16`, or the
    /// backend is exhausted.
    pub fn aligned_alloc(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }

        let max_offset = OFFSET_SIZE + (align - 1);
        if max_offset > Offset::MAX as usize {
            return None;
        }

        let block = self.backend.alloc(size.checked_add(max_offset)?)?;
        let start = block.as_ptr() as usize;
        let offset = ((start + max_offset) & !(align - 1)) - start;
        debug_assert!((OFFSET_SIZE..=max_offset).contains(&offset));

        // Safety: `offset + size` doesn't exceed the allocated size, and the
        //         offset field lies between `block` and the returned pointer
        unsafe {
            let ptr = block.as_ptr().add(offset);
            ptr.sub(OFFSET_SIZE)
                .cast::<Offset>()
                .write_unaligned(offset as Offset);
            Some(NonNull::new_unchecked(ptr))
        }
    }

    /// Deallocate a memory block allocated by [`Self::aligned_alloc`]. `None`
    /// is ignored.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via
    ///    `self.aligned_alloc`.
    ///  - The memory block must not have been deallocated already.
    ///
    pub unsafe fn aligned_free(&self, ptr: Option<NonNull<u8>>) {
        if let Some(ptr) = ptr {
            let offset = ptr.as_ptr().sub(OFFSET_SIZE).cast::<Offset>().read_unaligned();
            let block = NonNull::new_unchecked(ptr.as_ptr().sub(offset as usize));
            self.backend.free(Some(block));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem::MaybeUninit;

    use super::*;
    use crate::{tests::Align, Heap};

    #[test]
    fn alignments() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut pool = Align([MaybeUninit::uninit(); 65536]);
        let heap: Heap<'_> = Heap::INIT;
        heap.add_pool(&mut pool.0);
        let stats = heap.stats();

        let aligned = OffsetAligned::new(&heap);

        for align in (0..13).map(|i| 1usize << i) {
            let ptr = aligned.aligned_alloc(align, 100).unwrap();
            log::trace!("align = {}, ptr = {:?}", align, ptr);
            assert_eq!(ptr.as_ptr() as usize % align, 0);

            unsafe {
                ptr.as_ptr().write_bytes(0xa5, 100);

                let offset = ptr.as_ptr().sub(OFFSET_SIZE).cast::<u16>().read_unaligned() as usize;
                assert!(offset >= OFFSET_SIZE && offset < OFFSET_SIZE + align);

                // The block handed out by the heap covers the whole request
                let block = NonNull::new(ptr.as_ptr().sub(offset));
                assert!(heap.usable_size(block) >= offset + 100);

                aligned.aligned_free(Some(ptr));
            }

            assert_eq!(heap.stats(), stats);
        }
    }

    #[test]
    fn invalid_arguments() {
        let mut pool = [MaybeUninit::uninit(); 4096];
        let heap: Heap<'_> = Heap::INIT;
        heap.add_pool(&mut pool);
        let stats = heap.stats();

        let aligned = OffsetAligned::new(&heap);
        assert_eq!(aligned.aligned_alloc(0, 8), None);
        assert_eq!(aligned.aligned_alloc(3, 8), None);
        assert_eq!(aligned.aligned_alloc(8, 0), None);
        assert_eq!(aligned.aligned_alloc(1 << 16, 8), None);
        assert_eq!(aligned.aligned_alloc(8, usize::MAX), None);
        assert_eq!(heap.stats(), stats);

        unsafe { aligned.aligned_free(None) };
        assert_eq!(heap.stats(), stats);
    }

    #[test]
    fn exhaustion() {
        let mut pool = [MaybeUninit::uninit(); 1024];
        let heap: Heap<'_> = Heap::INIT;
        heap.add_pool(&mut pool);

        let aligned = OffsetAligned::new(&heap);
        assert_eq!(aligned.aligned_alloc(8, 1024), None);
        assert!(aligned.aligned_alloc(8, 256).is_some());
    }
}
