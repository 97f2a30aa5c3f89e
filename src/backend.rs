//! Interchangeable allocation backends
use core::{
    fmt,
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};
use spin::relax::{RelaxStrategy, Spin};

use crate::Init;

/// The operations every allocation backend provides.
///
/// A backend is selected at build time, typically as a type parameter or a
/// `static`. Two backends never manage the same pool.
///
/// # Safety
///
/// A block returned by `alloc` must be valid for reads and writes of the
/// requested size, aligned to at least [`GRANULARITY`] bytes, and must not
/// overlap any other block that hasn't been passed to `free` yet.
///
/// [`GRANULARITY`]: crate::GRANULARITY
pub unsafe trait Backend {
    /// Finish setting up the backend. Pools should be registered before
    /// this is called.
    fn init(&self);

    /// Register a memory pool.
    ///
    /// # Safety
    ///
    /// The memory block will be considered owned by `self`. The memory block
    /// must outlive `self` and must not overlap any other registered pool.
    unsafe fn add_block(&self, addr: NonNull<u8>, size: usize);

    /// Allocate `size` bytes. Returns `None` if `size` is zero or the
    /// backend is exhausted.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Deallocate a memory block. `None` is ignored.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via `self`.
    ///  - The memory block must not have been deallocated already.
    ///
    unsafe fn free(&self, ptr: Option<NonNull<u8>>);
}

unsafe impl<T: Backend + ?Sized> Backend for &T {
    #[inline]
    fn init(&self) {
        (**self).init()
    }

    #[inline]
    unsafe fn add_block(&self, addr: NonNull<u8>, size: usize) {
        (**self).add_block(addr, size)
    }

    #[inline]
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        (**self).alloc(size)
    }

    #[inline]
    unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        (**self).free(ptr)
    }
}

/// Wraps a [`Backend`] so that allocation waits for [`Backend::init`].
///
/// Threads calling [`alloc`](Backend::alloc) before initialization completes
/// wait using the relax strategy `R` (busy spinning by default; an RTOS
/// would yield or sleep for a tick here). Calling
/// [`free`](Backend::free) before initialization is a bug and panics.
///
/// Pools can be registered before initialization.
pub struct Gated<B, R = Spin> {
    inner: B,
    initialized: AtomicBool,
    _relax: PhantomData<fn() -> R>,
}

impl<B, R> Gated<B, R> {
    /// Wrap `inner`. The new backend is uninitialized.
    #[inline]
    pub const fn new(inner: B) -> Self {
        Self {
            inner,
            initialized: AtomicBool::new(false),
            _relax: PhantomData,
        }
    }

    /// Check whether [`Backend::init`] has completed.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Get a reference to the wrapped backend.
    #[inline]
    pub fn get_ref(&self) -> &B {
        &self.inner
    }
}

impl<B: Init, R> Init for Gated<B, R> {
    const INIT: Self = Self::new(B::INIT);
}

impl<B: fmt::Debug, R> fmt::Debug for Gated<B, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gated")
            .field("inner", &self.inner)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

unsafe impl<B: Backend, R: RelaxStrategy> Backend for Gated<B, R> {
    fn init(&self) {
        self.inner.init();
        let was_initialized = self.initialized.swap(true, Ordering::Release);
        debug_assert!(!was_initialized, "the backend was initialized twice");
        debug!("gated backend initialized");
    }

    #[inline]
    unsafe fn add_block(&self, addr: NonNull<u8>, size: usize) {
        self.inner.add_block(addr, size)
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        while !self.is_initialized() {
            R::relax();
        }

        if size == 0 {
            return None;
        }
        self.inner.alloc(size)
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        assert!(
            self.is_initialized(),
            "memory was deallocated before the allocator was initialized"
        );
        self.inner.free(ptr)
    }
}

/// A [`Backend`] for builds where dynamic memory allocation is forbidden.
/// Every operation panics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Unsupported;

impl Init for Unsupported {
    const INIT: Self = Self;
}

#[cold]
#[track_caller]
fn unsupported() -> ! {
    panic!("memory allocation is not supported")
}

unsafe impl Backend for Unsupported {
    fn init(&self) {
        unsupported()
    }

    unsafe fn add_block(&self, _addr: NonNull<u8>, _size: usize) {
        unsupported()
    }

    fn alloc(&self, _size: usize) -> Option<NonNull<u8>> {
        unsupported()
    }

    unsafe fn free(&self, _ptr: Option<NonNull<u8>>) {
        unsupported()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        boxed::Box,
        mem::MaybeUninit,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{tests::Align, Heap, SpinLock};

    struct YieldNow;

    impl RelaxStrategy for YieldNow {
        fn relax() {
            thread::yield_now();
        }
    }

    type TheBackend = Gated<Heap<'static, SpinLock>, YieldNow>;

    fn leak_gated() -> &'static TheBackend {
        let backend: &'static TheBackend = Box::leak(Box::new(Gated::INIT));
        let pool = Box::leak(Box::new(Align([MaybeUninit::<u8>::uninit(); 4096])));
        unsafe { backend.add_block(NonNull::from(&mut pool.0).cast(), pool.0.len()) };
        backend
    }

    #[test]
    fn gated_blocks_until_init() {
        let _ = env_logger::builder().is_test(true).try_init();

        let backend = leak_gated();
        let done = Arc::new(AtomicBool::new(false));

        let waiter = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let ptr = backend.alloc(64);
                done.store(true, Ordering::SeqCst);
                ptr.map(|ptr| ptr.as_ptr() as usize)
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "allocation didn't wait");
        assert!(!backend.is_initialized());

        backend.init();

        let ptr = waiter.join().unwrap().expect("allocation failed");
        assert!(done.load(Ordering::SeqCst));
        unsafe { backend.free(NonNull::new(ptr as *mut u8)) };
        assert_eq!(backend.get_ref().stats().free_blocks, 1);
    }

    #[test]
    fn gated_zero_size() {
        let backend = leak_gated();
        backend.init();
        assert_eq!(backend.alloc(0), None);
        unsafe { backend.free(None) };
    }

    #[test]
    #[should_panic(expected = "before the allocator was initialized")]
    fn gated_free_before_init() {
        let backend = leak_gated();
        unsafe { backend.free(None) };
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn unsupported_alloc() {
        Unsupported.alloc(16);
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn unsupported_init() {
        Unsupported::INIT.init();
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn unsupported_free() {
        unsafe { Unsupported.free(None) };
    }
}
