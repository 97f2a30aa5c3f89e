//! C memory allocation functions backed by [`::flmalloc`].
//!
//! The embedder registers memory with `malloc_addblock` and provides
//! `malloc_lock` and `malloc_unlock`, which must serialize calls into the
//! allocator (they can do nothing on a single-threaded system).
//!
//! `malloc_addblock`, `malloc_init`, `aligned_malloc`, and `aligned_free` are
//! always exported. The standard functions (`malloc`, `free`, `calloc`,
//! `realloc`, `posix_memalign`, `memalign`, `aligned_alloc`, and
//! `malloc_usable_size`) are exported under their C names only if the
//! `override` feature is enabled, so that merely linking this crate doesn't
//! replace the system allocator.
use flmalloc::{ExclusiveLock, Heap, MallocLock};
use std::{
    os::raw::{c_int, c_void},
    ptr::{null_mut, NonNull},
};

extern "C" {
    fn malloc_lock();
    fn malloc_unlock();
}

/// Calls the embedder's locking hooks.
struct HookLock;

impl MallocLock for HookLock {
    #[inline]
    fn lock(&self) {
        unsafe { malloc_lock() }
    }

    #[inline]
    fn unlock(&self) {
        unsafe { malloc_unlock() }
    }
}

// Safety: Required of the embedder's hooks
unsafe impl ExclusiveLock for HookLock {}

static HEAP: Heap<'static, HookLock> = Heap::new(HookLock);

/// The alignment guaranteed by `malloc`.
const MIN_ALIGN: usize = match () {
    #[cfg(any(
        target_arch = "x86",
        target_arch = "arm",
        target_arch = "mips",
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "sparc",
        target_arch = "asmjs",
        target_arch = "wasm32",
        target_arch = "hexagon",
        target_arch = "riscv32"
    ))]
    () => 8,
    #[cfg(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "mips64",
        target_arch = "s390x",
        target_arch = "sparc64",
        target_arch = "riscv64"
    ))]
    () => 16,
};

#[inline]
fn into_raw(ptr: Option<NonNull<u8>>) -> *mut c_void {
    ptr.map_or(null_mut(), |ptr| ptr.as_ptr() as *mut c_void)
}

/// Register a memory region. A null `addr` is ignored, and so is a region
/// too small to be used.
///
/// # Safety
///
/// The region must stay valid for the rest of the program and must not
/// overlap any other registered region.
#[no_mangle]
pub unsafe extern "C" fn malloc_addblock(addr: *mut c_void, size: usize) {
    if let Some(addr) = NonNull::new(addr) {
        HEAP.add_block(addr.cast(), size);
    }
}

#[no_mangle]
pub extern "C" fn malloc_init() {
    HEAP.init();
}

#[no_mangle]
pub extern "C" fn aligned_malloc(align: usize, size: usize) -> *mut c_void {
    into_raw(HEAP.aligned_malloc(align, size))
}

/// # Safety
///
/// `ptr` must be null or a live block returned by this crate.
#[no_mangle]
pub unsafe extern "C" fn aligned_free(ptr: *mut c_void) {
    HEAP.aligned_free(NonNull::new(ptr.cast()));
}

#[cfg_attr(feature = "override", no_mangle)]
pub extern "C" fn malloc(size: usize) -> *mut c_void {
    aligned_malloc(MIN_ALIGN, size)
}

/// # Safety
///
/// `ptr` must be null or a live block returned by this crate.
#[cfg_attr(feature = "override", no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    HEAP.free(NonNull::new(ptr.cast()));
}

#[cfg_attr(feature = "override", no_mangle)]
pub extern "C" fn calloc(number: usize, size: usize) -> *mut c_void {
    let ptr = number
        .checked_mul(size)
        .and_then(|len| HEAP.aligned_malloc(MIN_ALIGN, len).map(|ptr| (ptr, len)));
    match ptr {
        Some((ptr, len)) => {
            // Safety: `ptr` points to at least `len` bytes we now own
            unsafe { ptr.as_ptr().write_bytes(0, len) };
            ptr.as_ptr() as *mut c_void
        }
        None => null_mut(),
    }
}

/// # Safety
///
/// `ptr` must be null or a live block returned by this crate.
#[cfg_attr(feature = "override", no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match NonNull::new(ptr.cast::<u8>()) {
        None => malloc(size),
        Some(ptr) if size == 0 => {
            HEAP.free(Some(ptr));
            null_mut()
        }
        // `realloc` doesn't preserve the allocation's original alignment
        // <https://stackoverflow.com/a/9078627>
        Some(ptr) => into_raw(HEAP.aligned_realloc(ptr, MIN_ALIGN, size)),
    }
}

/// # Safety
///
/// `out_ptr` must be valid for writes.
#[cfg_attr(feature = "override", no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    out_ptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    let mut out = None;
    let result = HEAP.posix_memalign(&mut out, alignment, size);
    *out_ptr = into_raw(out);
    result
}

#[cfg_attr(feature = "override", no_mangle)]
pub extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    aligned_malloc(alignment, size)
}

#[cfg_attr(feature = "override", no_mangle)]
pub extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    aligned_malloc(alignment, size)
}

/// # Safety
///
/// `ptr` must be null or a live block returned by this crate.
#[cfg_attr(feature = "override", no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    HEAP.usable_size(NonNull::new(ptr.cast()))
}
