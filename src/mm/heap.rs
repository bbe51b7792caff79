//! Kernel heap (L5): a `linked_list_allocator` arena backs ordinary
//! `Box`/`Vec`-style allocations from a static bootstrap region, so `alloc`
//! works before `frame_alloc`/`vmalloc` have anywhere to get memory from.
//! Allocations at or above `LARGE_ALLOC_THRESHOLD` instead go straight to
//! `frame_alloc::alloc_pages` + `vmalloc::vmap_anon`, so a handful of
//! multi-page requests don't fragment the small-object arena.
//!
//! This is the only `mm` module that may call up into all the others —
//! everything else in `mm` stays layered strictly bottom-up.

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicUsize, Ordering};

use linked_list_allocator::LockedHeap;

use crate::mm::page::{page_align_up, PageFlags, PAGE_SIZE};

const BOOTSTRAP_HEAP_SIZE: usize = 4 * 1024 * 1024;
const LARGE_ALLOC_THRESHOLD: usize = 64 * 1024;

#[repr(align(16))]
struct BootstrapArena([u8; BOOTSTRAP_HEAP_SIZE]);
static mut BOOTSTRAP_ARENA: BootstrapArena = BootstrapArena([0; BOOTSTRAP_HEAP_SIZE]);

static ARENA: LockedHeap = LockedHeap::empty();

static TOTAL_ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static LARGE_ALLOC_COUNT: AtomicUsize = AtomicUsize::new(0);
static ALLOC_FAILURES: AtomicUsize = AtomicUsize::new(0);

/// # Safety
/// Must run exactly once, before any `alloc`-crate type is touched.
pub unsafe fn init() {
    let base = core::ptr::addr_of_mut!(BOOTSTRAP_ARENA) as *mut u8;
    ARENA.lock().init(base, BOOTSTRAP_HEAP_SIZE);
    crate::info!("heap: {} KiB bootstrap arena online", BOOTSTRAP_HEAP_SIZE / 1024);
}

/// Call once `frame_alloc`/`vmalloc` are both initialized, so large
/// allocations can start using them instead of falling back to the (much
/// smaller) bootstrap arena.
pub fn mark_vmalloc_ready() {
    VMALLOC_READY.store(true, Ordering::Release);
}

static VMALLOC_READY: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

struct KernelHeapAllocator;

unsafe impl GlobalAlloc for KernelHeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = if layout.size() >= LARGE_ALLOC_THRESHOLD && VMALLOC_READY.load(Ordering::Acquire) {
            large_alloc(layout).unwrap_or_else(|| ARENA.alloc(layout))
        } else {
            ARENA.alloc(layout)
        };
        if ptr.is_null() {
            ALLOC_FAILURES.fetch_add(1, Ordering::Relaxed);
        } else {
            TOTAL_ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        TOTAL_ALLOCATED.fetch_sub(layout.size(), Ordering::Relaxed);
        if layout.size() >= LARGE_ALLOC_THRESHOLD && large_dealloc(ptr, layout) {
            return;
        }
        ARENA.dealloc(ptr, layout)
    }
}

fn large_alloc(layout: Layout) -> Option<*mut u8> {
    let size = page_align_up(layout.size() as u64) as usize;
    let count = size / PAGE_SIZE as usize;
    let pages = crate::mm::frame_alloc::alloc_pages(count, PageFlags::WRITE).ok()?;
    let virt = crate::mm::vmalloc::vmap_pages(&pages, crate::mm::vmalloc::KERNEL_SPACE_START, false, "heap-large").ok()?;
    LARGE_ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
    Some(virt as *mut u8)
}

/// Returns whether `ptr` was one of ours (a large allocation), freeing it
/// if so. `false` tells the caller to fall through to the arena instead.
fn large_dealloc(ptr: *mut u8, layout: Layout) -> bool {
    let addr = ptr as u64;
    if crate::mm::vmalloc::mapping_name(addr).as_deref() != Some("heap-large") {
        return false;
    }
    let size = page_align_up(layout.size() as u64);
    let _ = crate::mm::vmalloc::vunmap(addr, size);
    LARGE_ALLOC_COUNT.fetch_sub(1, Ordering::Relaxed);
    true
}

#[global_allocator]
static GLOBAL_ALLOC: KernelHeapAllocator = KernelHeapAllocator;

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    crate::error!("heap: allocation failure, size={} align={}", layout.size(), layout.align());
    panic!("out of memory");
}

pub struct HeapStats {
    pub total_allocated: usize,
    pub large_allocations: usize,
    pub allocation_failures: usize,
}

pub fn stats() -> HeapStats {
    HeapStats {
        total_allocated: TOTAL_ALLOCATED.load(Ordering::Relaxed),
        large_allocations: LARGE_ALLOC_COUNT.load(Ordering::Relaxed),
        allocation_failures: ALLOC_FAILURES.load(Ordering::Relaxed),
    }
}
