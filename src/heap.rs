use core::{
    alloc,
    cell::UnsafeCell,
    fmt,
    mem::MaybeUninit,
    num::NonZeroUsize,
    ops,
    ptr::{self, NonNull},
};

use crate::{
    free_list::{FreeList, Stats, GRANULARITY, MIN_ALLOC_SIZE},
    AllocError, Backend, ExclusiveLock, Init, MallocLock, NoLock,
};

/// A [`FreeList`] shared through `&self`, with every access bracketed by a
/// [`MallocLock`].
///
/// This provides the conventional `malloc`-style interface on top of the
/// free list. Arguments that can be rejected without looking at the free
/// list are rejected before the lock is taken.
///
/// `Heap` is [`Sync`] only if the lock is an [`ExclusiveLock`]. With such a
/// lock, `Heap<'static, _>` can also be used as a global allocator:
///
/// ```rust,no_run
/// use flmalloc::{Heap, SpinLock};
///
/// #[global_allocator]
/// static HEAP: Heap<'static, SpinLock> = Heap::INIT;
///
/// fn main() {
///     static mut POOL: [std::mem::MaybeUninit<u8>; 1 << 20] =
///         [std::mem::MaybeUninit::uninit(); 1 << 20];
///     // Safety: `POOL` is only referenced here
///     HEAP.add_pool(unsafe { &mut *std::ptr::addr_of_mut!(POOL) });
///     // ...
/// }
/// ```
pub struct Heap<'pool, L = NoLock, const MIN_SPLIT: usize = { MIN_ALLOC_SIZE }> {
    inner: UnsafeCell<FreeList<'pool, MIN_SPLIT>>,
    lock: L,
}

// Safety: `inner` is only accessed while `lock` is held, and an
//         `ExclusiveLock` admits one thread at a time
unsafe impl<L: ExclusiveLock + Sync, const MIN_SPLIT: usize> Sync for Heap<'_, L, MIN_SPLIT> {}

impl<L: Init, const MIN_SPLIT: usize> Init for Heap<'_, L, MIN_SPLIT> {
    const INIT: Self = Self::new(L::INIT);
}

impl<L: const_default1::ConstDefault, const MIN_SPLIT: usize> const_default1::ConstDefault
    for Heap<'_, L, MIN_SPLIT>
{
    const DEFAULT: Self = Self::new(L::DEFAULT);
}

impl<L: Default, const MIN_SPLIT: usize> Default for Heap<'_, L, MIN_SPLIT> {
    fn default() -> Self {
        Self::new(L::default())
    }
}

impl<L: fmt::Debug, const MIN_SPLIT: usize> fmt::Debug for Heap<'_, L, MIN_SPLIT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The free list isn't shown; that would require taking the lock
        f.debug_struct("Heap")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl<'pool, L: Init, const MIN_SPLIT: usize> Heap<'pool, L, MIN_SPLIT> {
    /// An empty heap with the lock's default value.
    pub const INIT: Self = Self::new(L::INIT);
}

impl<'pool, L, const MIN_SPLIT: usize> Heap<'pool, L, MIN_SPLIT> {
    /// Construct an empty heap guarded by `lock`.
    #[inline]
    pub const fn new(lock: L) -> Self {
        Self {
            inner: UnsafeCell::new(FreeList::INIT),
            lock,
        }
    }

    /// Get a mutable reference to the underlying free list. No locking is
    /// needed because `&mut self` proves exclusive access.
    #[inline]
    pub fn get_mut(&mut self) -> &mut FreeList<'pool, MIN_SPLIT> {
        self.inner.get_mut()
    }

    /// Unwrap the underlying free list.
    #[inline]
    pub fn into_inner(self) -> FreeList<'pool, MIN_SPLIT> {
        self.inner.into_inner()
    }
}

struct LockGuard<'a, 'pool, L: MallocLock, const MIN_SPLIT: usize>(&'a Heap<'pool, L, MIN_SPLIT>);

impl<'pool, L: MallocLock, const MIN_SPLIT: usize> ops::Deref for LockGuard<'_, 'pool, L, MIN_SPLIT> {
    type Target = FreeList<'pool, MIN_SPLIT>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: Protected by `lock`
        unsafe { &*self.0.inner.get() }
    }
}

impl<L: MallocLock, const MIN_SPLIT: usize> ops::DerefMut for LockGuard<'_, '_, L, MIN_SPLIT> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: Protected by `lock`
        unsafe { &mut *self.0.inner.get() }
    }
}

impl<L: MallocLock, const MIN_SPLIT: usize> Drop for LockGuard<'_, '_, L, MIN_SPLIT> {
    #[inline]
    fn drop(&mut self) {
        self.0.lock.unlock();
    }
}

impl<'pool, L: MallocLock, const MIN_SPLIT: usize> Heap<'pool, L, MIN_SPLIT> {
    #[inline]
    fn lock_inner(&self) -> LockGuard<'_, 'pool, L, MIN_SPLIT> {
        self.lock.lock();
        LockGuard(self)
    }

    /// Prepare the heap for use.
    ///
    /// The free list needs no preparation, so this does nothing besides
    /// logging. It exists so that `Heap` can stand in for backends that do
    /// need it.
    #[inline]
    pub fn init(&self) {
        debug!("heap initialized");
    }

    /// Register a memory pool specified by its starting address and length.
    ///
    /// The pool is inserted in address order and merged with any adjacent
    /// free block. Pools can be added at any time, in any order.
    ///
    /// Returns the usable size added to the heap, or `None` if the pool was
    /// too small to be used (in which case it's ignored).
    ///
    /// # Safety
    ///
    /// The memory block will be considered owned by `self`. The memory block
    /// must outlive `self` and must not overlap any other registered pool.
    pub unsafe fn add_block(&self, addr: NonNull<u8>, size: usize) -> Option<NonZeroUsize> {
        let added = self.lock_inner().insert_free_block_ptr(addr, size);
        debug!("add_block({:p}, {}) added {:?} bytes", addr, size, added);
        added
    }

    /// Register a memory pool specified by a slice.
    ///
    /// This is the safe counterpart of [`Self::add_block`]. The borrow
    /// checker ensures the pool outlives `self`.
    #[inline]
    pub fn add_pool(&self, pool: &'pool mut [MaybeUninit<u8>]) -> Option<NonZeroUsize> {
        let len = pool.len();
        // Safety: `pool` is a mutable reference, which guarantees the absence
        // of aliasing references. Being `'pool` means it will outlive `self`.
        unsafe { self.add_block(NonNull::from(pool).cast(), len) }
    }

    /// Allocate `size` bytes aligned to [`GRANULARITY`] bytes.
    ///
    /// Returns `None` if `size` is zero or the heap is exhausted.
    #[inline]
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        self.lock_inner().allocate(size)
    }

    /// Deallocate a memory block. `None` is ignored.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via `self`.
    ///  - The memory block must not have been deallocated already.
    ///
    #[inline]
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        if let Some(ptr) = ptr {
            self.lock_inner().deallocate(ptr);
        }
    }

    /// Allocate `size` bytes aligned to `align` bytes.
    ///
    /// Returns `None` if `size` is zero, `align` is zero or not a power of
    /// two, or the heap is exhausted. See [`Self::try_aligned_malloc`] to
    /// tell these apart.
    #[inline]
    pub fn aligned_malloc(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        self.try_aligned_malloc(align, size).ok()
    }

    /// Same as [`Self::aligned_malloc`].
    #[inline]
    pub fn memalign(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        self.aligned_malloc(align, size)
    }

    /// Allocate `size` bytes aligned to `align` bytes, reporting the reason of
    /// failure.
    pub fn try_aligned_malloc(&self, align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(AllocError::InvalidArgument);
        }
        self.lock_inner()
            .allocate_aligned(align, size)
            .ok_or(AllocError::OutOfMemory)
    }

    /// Deallocate a memory block allocated by [`Self::aligned_malloc`].
    ///
    /// Aligned allocations don't carry any extra header, so this is the same
    /// as [`Self::free`].
    ///
    /// # Safety
    ///
    /// See [`Self::free`].
    #[inline]
    pub unsafe fn aligned_free(&self, ptr: Option<NonNull<u8>>) {
        self.free(ptr)
    }

    /// The POSIX `posix_memalign` interface.
    ///
    /// On success, stores the allocated block in `out` and returns zero.
    /// Otherwise stores `None` and returns [`errno::EINVAL`] if `align` is
    /// zero or not a power of two or `size` is zero, or [`errno::ENOMEM`] if
    /// the heap is exhausted.
    ///
    /// [`errno::EINVAL`]: crate::errno::EINVAL
    /// [`errno::ENOMEM`]: crate::errno::ENOMEM
    pub fn posix_memalign(&self, out: &mut Option<NonNull<u8>>, align: usize, size: usize) -> i32 {
        match self.try_aligned_malloc(align, size) {
            Ok(ptr) => {
                *out = Some(ptr);
                0
            }
            Err(e) => {
                *out = None;
                e.errno()
            }
        }
    }

    /// Allocate zero-initialized memory for an array of `count` elements of
    /// `size` bytes each.
    ///
    /// Returns `None` if the total size is zero or overflows, or the heap is
    /// exhausted.
    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let len = count.checked_mul(size)?;
        let ptr = self.malloc(len)?;
        // Safety: `ptr` points to at least `len` bytes we now own
        unsafe { ptr.as_ptr().write_bytes(0, len) };
        Some(ptr)
    }

    /// Resize a memory block, preserving its contents up to the smaller of
    /// the old and new sizes.
    ///
    /// `None` makes this behave like [`Self::malloc`]. A `size` of zero
    /// deallocates the block and returns `None`. On exhaustion, returns
    /// `None` and leaves the original block intact.
    ///
    /// The new block is aligned to [`GRANULARITY`] bytes. A stricter
    /// alignment of the original block isn't preserved.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated via `self`.
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.malloc(size),
        };

        if size == 0 {
            self.free(Some(ptr));
            return None;
        }

        self.aligned_realloc(ptr, GRANULARITY, size)
    }

    /// Resize a memory block, keeping it aligned to `align` bytes.
    ///
    /// Shrinking happens in place. Returns `None` if `size` is zero or the
    /// heap is exhausted, leaving the original block intact.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via `self`.
    ///  - `align` must be a power of two no smaller than the block's original
    ///    alignment.
    ///
    #[inline]
    pub unsafe fn aligned_realloc(
        &self,
        ptr: NonNull<u8>,
        align: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        self.lock_inner().reallocate(ptr, align, size)
    }

    /// Get the usable size of a memory block, which may be larger than
    /// requested. Returns zero for `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated via `self`.
    #[inline]
    pub unsafe fn usable_size(&self, ptr: Option<NonNull<u8>>) -> usize {
        match ptr {
            Some(ptr) => self.lock_inner().usable_size(ptr),
            None => 0,
        }
    }

    /// Summarize the free list.
    #[inline]
    pub fn stats(&self) -> Stats {
        self.lock_inner().stats()
    }
}

unsafe impl<L: MallocLock, const MIN_SPLIT: usize> Backend for Heap<'_, L, MIN_SPLIT> {
    #[inline]
    fn init(&self) {
        Heap::init(self)
    }

    #[inline]
    unsafe fn add_block(&self, addr: NonNull<u8>, size: usize) {
        Heap::add_block(self, addr, size);
    }

    #[inline]
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.malloc(size)
    }

    #[inline]
    unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        Heap::free(self, ptr)
    }
}

unsafe impl<L: ExclusiveLock, const MIN_SPLIT: usize> alloc::GlobalAlloc
    for Heap<'static, L, MIN_SPLIT>
{
    #[inline]
    unsafe fn alloc(&self, layout: alloc::Layout) -> *mut u8 {
        self.aligned_malloc(layout.align(), layout.size())
            .map(NonNull::as_ptr)
            .unwrap_or(ptr::null_mut())
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: alloc::Layout) {
        self.free(NonNull::new(ptr));
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: alloc::Layout, new_size: usize) -> *mut u8 {
        // Safety: All allocations are non-null
        let ptr = NonNull::new_unchecked(ptr);
        // Safety: `ptr` denotes a previous allocation with alignment
        //         `layout.align()`
        self.aligned_realloc(ptr, layout.align(), new_size)
            .map(NonNull::as_ptr)
            .unwrap_or(ptr::null_mut())
    }
}
