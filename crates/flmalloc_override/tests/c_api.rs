use flmalloc::errno;
use flmalloc_override::{
    aligned_free, aligned_malloc, calloc, free, malloc, malloc_addblock, malloc_init,
    malloc_usable_size, posix_memalign, realloc,
};
use std::{
    hint::spin_loop,
    os::raw::c_void,
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard, Once,
    },
};

static LOCKED: AtomicBool = AtomicBool::new(false);
static LOCKS: AtomicUsize = AtomicUsize::new(0);
static UNLOCKS: AtomicUsize = AtomicUsize::new(0);

#[no_mangle]
extern "C" fn malloc_lock() {
    while LOCKED
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        spin_loop();
    }
    LOCKS.fetch_add(1, Ordering::Relaxed);
}

#[no_mangle]
extern "C" fn malloc_unlock() {
    UNLOCKS.fetch_add(1, Ordering::Relaxed);
    LOCKED.store(false, Ordering::Release);
}

const POOL_LEN: usize = 1 << 20;

/// Serializes the tests so that lock counts can be compared, and registers
/// the pool on first use.
fn setup() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    static POOL_ADDED: Once = Once::new();

    let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    POOL_ADDED.call_once(|| {
        let pool: &'static mut [u8] = Box::leak(vec![0u8; POOL_LEN].into_boxed_slice());
        unsafe { malloc_addblock(pool.as_mut_ptr().cast(), pool.len()) };
        malloc_init();
    });
    guard
}

fn lock_counts() -> (usize, usize) {
    (LOCKS.load(Ordering::Relaxed), UNLOCKS.load(Ordering::Relaxed))
}

#[test]
fn addblock_ignores_null() {
    let _guard = setup();
    unsafe { malloc_addblock(null_mut(), 4096) };
}

#[test]
fn aligned_malloc_round_trip() {
    let _guard = setup();

    for align in (0..13).map(|i| 1usize << i) {
        let ptr = aligned_malloc(align, 100);
        assert!(!ptr.is_null(), "aligned_malloc({}, 100) failed", align);
        assert_eq!(ptr as usize % align, 0);
        unsafe {
            ptr.cast::<u8>().write_bytes(0xcc, 100);
            aligned_free(ptr);
        }
    }

    unsafe { aligned_free(null_mut()) };
}

#[test]
fn invalid_arguments_skip_the_lock() {
    let _guard = setup();
    let before = lock_counts();

    assert!(aligned_malloc(3, 8).is_null());
    assert!(aligned_malloc(0, 8).is_null());
    assert!(aligned_malloc(8, 0).is_null());
    assert!(malloc(0).is_null());
    unsafe { free(null_mut()) };

    assert_eq!(lock_counts(), before);
}

#[test]
fn lock_balance() {
    let _guard = setup();
    let (locks, unlocks) = lock_counts();
    assert_eq!(locks, unlocks);

    unsafe {
        let p1 = malloc(64);
        let p2 = aligned_malloc(256, 64);
        let p3 = realloc(p1, 1000);
        assert!(!p2.is_null() && !p3.is_null());
        free(p3);
        aligned_free(p2);
    }

    let (locks2, unlocks2) = lock_counts();
    assert_eq!(locks2, unlocks2);
    assert!(locks2 > locks);
    assert!(!LOCKED.load(Ordering::Relaxed));
}

#[test]
fn posix_memalign_codes() {
    let _guard = setup();

    unsafe {
        let mut out: *mut c_void = null_mut();
        assert_eq!(posix_memalign(&mut out, 64, 100), 0);
        assert!(!out.is_null());
        assert_eq!(out as usize % 64, 0);
        free(out);

        for &(align, size, expected) in &[
            (3, 100, errno::EINVAL),
            (0, 100, errno::EINVAL),
            (64, 0, errno::EINVAL),
            (64, POOL_LEN * 2, errno::ENOMEM),
        ] {
            let mut out = 1usize as *mut c_void;
            assert_eq!(posix_memalign(&mut out, align, size), expected);
            assert!(out.is_null());
        }
    }
}

#[test]
fn malloc_family() {
    let _guard = setup();

    unsafe {
        let p = malloc(100);
        assert!(!p.is_null());
        assert!(malloc_usable_size(p) >= 100);
        assert_eq!(malloc_usable_size(null_mut()), 0);

        let bytes = p.cast::<u8>();
        for i in 0..100 {
            *bytes.add(i) = i as u8;
        }

        let q = realloc(p, 5000);
        assert!(!q.is_null());
        for i in 0..100 {
            assert_eq!(*q.cast::<u8>().add(i), i as u8);
        }
        assert!(realloc(q, 0).is_null());

        let z = calloc(16, 16);
        assert!(!z.is_null());
        assert!(std::slice::from_raw_parts(z.cast::<u8>(), 256)
            .iter()
            .all(|&b| b == 0));
        free(z);

        assert!(calloc(usize::MAX, 2).is_null());

        let r = realloc(null_mut(), 32);
        assert!(!r.is_null());
        free(r);
    }
}
