// Adopted from
// https://github.com/alexcrichton/dlmalloc-rs/blob/master/tests/global.rs
use flmalloc::{Heap, SpinLock};
use std::{
    alloc::{GlobalAlloc, Layout},
    collections::HashMap,
    mem::MaybeUninit,
    ptr::addr_of_mut,
};

const POOL_LEN: usize = 16 << 20;

static mut POOL: [MaybeUninit<u8>; POOL_LEN] = [MaybeUninit::uninit(); POOL_LEN];
static POOL_ADDED: spin::Once = spin::Once::new();
static HEAP: Heap<'static, SpinLock> = Heap::INIT;

/// Registers `POOL` on first use, before any allocation can reach `HEAP`.
struct Bootstrapped;

impl Bootstrapped {
    #[inline]
    fn heap(&self) -> &'static Heap<'static, SpinLock> {
        POOL_ADDED.call_once(|| {
            // Safety: `call_once` runs this at most once, and nothing else
            //         refers to `POOL`
            HEAP.add_pool(unsafe { &mut *addr_of_mut!(POOL) });
        });
        &HEAP
    }
}

unsafe impl GlobalAlloc for Bootstrapped {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        GlobalAlloc::alloc(self.heap(), layout)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        GlobalAlloc::dealloc(self.heap(), ptr, layout)
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        GlobalAlloc::realloc(self.heap(), ptr, layout, new_size)
    }
}

#[global_allocator]
static A: Bootstrapped = Bootstrapped;

#[test]
fn foo() {
    println!("hello");
}

#[test]
fn map() {
    let mut m = HashMap::new();
    m.insert(1, 2);
    m.insert(5, 3);
    drop(m);
}

#[test]
fn strings() {
    format!("foo, bar, {}", "baz");
}

#[test]
fn threads() {
    assert!(std::thread::spawn(|| panic!()).join().is_err());
}

#[test]
fn many_threads() {
    let workers: Vec<_> = (0..8)
        .map(|i| {
            std::thread::spawn(move || {
                let mut v = Vec::new();
                for j in 0..1000 {
                    v.push(format!("{}-{}", i, j));
                }
                v.iter().map(|s| s.len()).sum::<usize>()
            })
        })
        .collect();

    for worker in workers {
        assert!(worker.join().unwrap() > 0);
    }
}

#[test]
fn test_larger_than_word_alignment() {
    use std::mem;

    // Align to 32 bytes.
    #[repr(align(32))]
    struct Align32(u8);

    assert_eq!(mem::align_of::<Align32>(), 32);

    for _ in 0..1000 {
        let b = Box::new(Align32(42));

        let p = Box::into_raw(b);
        assert_eq!(p as usize % 32, 0, "{:p} should be aligned to 32", p);

        unsafe {
            let b = Box::from_raw(p);
            assert_eq!(b.0, 42);
        }
    }
}

#[test]
fn growing_vec() {
    let mut v: Vec<u32> = Vec::new();
    for i in 0..(1 << 18) {
        v.push(i);
    }
    assert!(v.iter().enumerate().all(|(i, &x)| i as u32 == x));
}

#[test]
fn cannot_alloc_max_isize_minus_some() {
    // The test should complete without causing OOM
    for offset in (0..64).step_by(8) {
        let layout = Layout::from_size_align(isize::MAX as usize - offset, 1).unwrap();
        for _ in 0..1000 {
            let result = unsafe { A.alloc(layout) };
            assert!(result.is_null());
        }
    }
}
