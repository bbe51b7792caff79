//! Physical page descriptor and the flags that travel with it from
//! allocation through mapping. One `Page` is produced per physical frame
//! handed out by [`super::frame_alloc`]; [`super::vmalloc`] binds it into an
//! address-space mapping and [`super::pgtable`] reads its flags to build the
//! PTE.

use bitflags::bitflags;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_SIZE_2MB: u64 = 2 * 1024 * 1024;
pub const PAGE_SIZE_1GB: u64 = 1024 * 1024 * 1024;

bitflags! {
    /// Mirrors the `PG_*` flag bits a caller passes to `alloc_pages` and
    /// that later steer `pgtable`'s PTE construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const WRITE       = 1 << 0;
        const USER        = 1 << 1;
        const NOCACHE     = 1 << 2;
        const WRITETHROUGH = 1 << 3;
        const EXEC        = 1 << 4;
        /// Frame stride is 2MiB instead of 4KiB.
        const BIGPAGE     = 1 << 5;
        /// Frame stride is 1GiB instead of 4KiB.
        const HUGEPAGE    = 1 << 6;
        const GLOBAL      = 1 << 7;
        /// Panic instead of returning `Err` when the request can't be satisfied.
        const FORCE       = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZoneKind {
    Low = 0,
    Dma = 1,
    Normal = 2,
    High = 3,
}

impl ZoneKind {
    pub const COUNT: usize = 4;

    pub const fn name(self) -> &'static str {
        match self {
            ZoneKind::Low => "Low",
            ZoneKind::Dma => "DMA",
            ZoneKind::Normal => "Normal",
            ZoneKind::High => "High",
        }
    }
}

/// One physical frame (or the head of a contiguous big/huge run) handed out
/// by the frame allocator. `mapping` is filled in by `vmalloc` once the page
/// is bound into an address space; `None` means unbound (e.g. still owned by
/// a free list, or used for page-table storage itself).
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub address: u64,
    pub flags: PageFlags,
    pub zone: ZoneKind,
    pub mapping: Option<usize>,
}

impl Page {
    /// Size in bytes of the frame this descriptor stands for.
    pub fn stride(&self) -> u64 {
        if self.flags.contains(PageFlags::HUGEPAGE) {
            PAGE_SIZE_1GB
        } else if self.flags.contains(PageFlags::BIGPAGE) {
            PAGE_SIZE_2MB
        } else {
            PAGE_SIZE
        }
    }
}

pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

pub const fn page_align_up(addr: u64) -> u64 {
    page_align_down(addr + PAGE_SIZE - 1)
}

pub const fn size_to_pages(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}
