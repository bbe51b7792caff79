//! Pmalloc: the zoned physical frame allocator.
//!
//! Physical memory is partitioned into four zones by address range (`Low`
//! below 1MiB, `DMA` below 16MiB, `Normal` below 4GiB, `High` above), each
//! zone backed by its own bitmap of 4KiB frames. A boot memory-map entry
//! that straddles a zone boundary is split into one zone per side. General
//! allocation walks zones in `High -> Normal -> DMA -> Low` order so that
//! scarce low memory is only spent when asked for by address.

use alloc::vec::Vec;
use spin::Mutex;

use crate::boot::{BootInfo, MemoryMapEntry, MemoryRegionKind};
use crate::lib::error::{Errno, KernelResult};
use crate::mm::page::{Page, PageFlags, ZoneKind, PAGE_SIZE, PAGE_SIZE_1GB, PAGE_SIZE_2MB};

pub const ZONE_LOW_MAX: u64 = 0x0010_0000; // 1 MiB
pub const ZONE_DMA_MAX: u64 = 0x0100_0000; // 16 MiB
pub const ZONE_NORMAL_MAX: u64 = 0x1_0000_0000; // 4 GiB

/// Zone preference order for allocations not pinned to an address: scarce
/// low zones are saved for callers who ask for them (or a fixed address)
/// by name.
const ZONE_ALLOC_ORDER: [ZoneKind; ZoneKind::COUNT] = [
    ZoneKind::High,
    ZoneKind::Normal,
    ZoneKind::Dma,
    ZoneKind::Low,
];

fn zone_kind_of(addr: u64) -> ZoneKind {
    if addr < ZONE_LOW_MAX {
        ZoneKind::Low
    } else if addr < ZONE_DMA_MAX {
        ZoneKind::Dma
    } else if addr < ZONE_NORMAL_MAX {
        ZoneKind::Normal
    } else {
        ZoneKind::High
    }
}

fn zone_limit(kind: ZoneKind) -> u64 {
    match kind {
        ZoneKind::Low => ZONE_LOW_MAX,
        ZoneKind::Dma => ZONE_DMA_MAX,
        ZoneKind::Normal => ZONE_NORMAL_MAX,
        ZoneKind::High => u64::MAX,
    }
}

/// A flat bitmap of frame-sized slots, one bit per frame, with a running
/// free count so `Zone` can skip a zone with no hope of satisfying a
/// request without scanning it.
struct Bitmap {
    words: Vec<u64>,
    bits: usize,
    free: usize,
}

impl Bitmap {
    fn new(bits: usize) -> Self {
        Bitmap {
            words: alloc::vec![0u64; (bits + 63) / 64],
            bits,
            free: bits,
        }
    }

    fn test(&self, i: usize) -> bool {
        (self.words[i / 64] >> (i % 64)) & 1 != 0
    }

    fn set_one(&mut self, i: usize) -> bool {
        let was_free = !self.test(i);
        self.words[i / 64] |= 1 << (i % 64);
        if was_free {
            self.free -= 1;
        }
        was_free
    }

    fn clear_one(&mut self, i: usize) {
        if self.test(i) {
            self.words[i / 64] &= !(1 << (i % 64));
            self.free += 1;
        }
    }

    fn set_n(&mut self, start: usize, n: usize) {
        for i in start..start + n {
            self.set_one(i);
        }
    }

    fn clear_n(&mut self, start: usize, n: usize) {
        for i in start..start + n {
            self.clear_one(i);
        }
    }

    fn all_free(&self, start: usize, n: usize) -> bool {
        start + n <= self.bits && (start..start + n).all(|i| !self.test(i))
    }

    /// First free bit, or `None`. The common single-frame allocation path.
    fn find_free(&self) -> Option<usize> {
        (0..self.bits).find(|&i| !self.test(i))
    }

    /// First run of `n` free, `align`-aligned bits. `align` is in frames,
    /// not bytes, and 0/1 mean "no alignment requirement".
    fn find_free_n(&self, n: usize, align: usize) -> Option<usize> {
        let align = align.max(1);
        let mut start = 0usize;
        while start + n <= self.bits {
            if self.all_free(start, n) {
                return Some(start);
            }
            start += align;
        }
        None
    }
}

struct Zone {
    base: u64,
    size: u64,
    bitmap: Mutex<Bitmap>,
}

impl Zone {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    fn page_count(&self) -> usize {
        (self.size / PAGE_SIZE) as usize
    }
}

pub struct FrameAllocator {
    zones: [Vec<Zone>; ZoneKind::COUNT],
}

/// Computed (frame count, alignment in frames, byte stride) for a request.
fn layout_for(count: usize, flags: PageFlags) -> (usize, usize, u64) {
    if flags.contains(PageFlags::HUGEPAGE) {
        let frames_per = (PAGE_SIZE_1GB / PAGE_SIZE) as usize;
        (count * frames_per, frames_per, PAGE_SIZE_1GB)
    } else if flags.contains(PageFlags::BIGPAGE) {
        let frames_per = (PAGE_SIZE_2MB / PAGE_SIZE) as usize;
        (count * frames_per, frames_per, PAGE_SIZE_2MB)
    } else {
        (count, 1, PAGE_SIZE)
    }
}

fn make_pages(zone: ZoneKind, frame_base: u64, count: usize, stride: u64, flags: PageFlags) -> Vec<Page> {
    let mut pages = Vec::with_capacity(count);
    let mut addr = frame_base;
    for _ in 0..count {
        pages.push(Page { address: addr, flags, zone, mapping: None });
        addr += stride;
    }
    pages
}

impl FrameAllocator {
    const fn empty() -> Self {
        FrameAllocator { zones: [Vec::new(), Vec::new(), Vec::new(), Vec::new()] }
    }

    /// Populates zones from the bootloader's usable memory map, splitting
    /// any entry that straddles a zone boundary.
    fn populate(&mut self, boot_info: &BootInfo) {
        for entry in boot_info.usable_regions() {
            self.add_region(*entry);
        }
    }

    fn add_region(&mut self, entry: MemoryMapEntry) {
        debug_assert_eq!(entry.kind, MemoryRegionKind::Usable);
        let aligned_base = crate::mm::page::page_align_up(entry.base);
        let pad = aligned_base - entry.base;
        if pad >= entry.size {
            return;
        }
        let mut base = aligned_base;
        let mut size = crate::mm::page::page_align_down(entry.size - pad);
        while size > 0 {
            let kind = zone_kind_of(base);
            let limit = zone_limit(kind);
            let chunk_end = core::cmp::min(base + size, limit);
            let chunk_size = chunk_end - base;
            if chunk_size > 0 {
                self.add_zone(kind, base, chunk_size);
            }
            size -= chunk_size;
            base = chunk_end;
        }
    }

    fn add_zone(&mut self, kind: ZoneKind, base: u64, size: u64) {
        let page_count = (size / PAGE_SIZE) as usize;
        if page_count == 0 {
            return;
        }
        self.zones[kind as usize].push(Zone { base, size, bitmap: Mutex::new(Bitmap::new(page_count)) });
    }

    fn zone_stats(&self, kind: ZoneKind) -> (usize, usize) {
        let zones = &self.zones[kind as usize];
        let total: usize = zones.iter().map(Zone::page_count).sum();
        let free: usize = zones.iter().map(|z| z.bitmap.lock().free).sum();
        (total, free)
    }

    fn alloc_in_zone(&self, kind: ZoneKind, count: usize, flags: PageFlags) -> Option<Vec<Page>> {
        let (num_frames, align, stride) = layout_for(count, flags);
        for zone in &self.zones[kind as usize] {
            let mut bitmap = zone.bitmap.lock();
            if bitmap.free < num_frames {
                continue;
            }
            let index = if num_frames == 1 { bitmap.find_free() } else { bitmap.find_free_n(num_frames, align) };
            if let Some(index) = index {
                bitmap.set_n(index, num_frames);
                drop(bitmap);
                let frame_base = zone.base + index as u64 * PAGE_SIZE;
                return Some(make_pages(kind, frame_base, count, stride, flags));
            }
        }
        None
    }

    pub fn alloc_pages(&self, count: usize, flags: PageFlags) -> KernelResult<Vec<Page>> {
        if count == 0 {
            return Err(Errno::EINVAL);
        }
        for &kind in &ZONE_ALLOC_ORDER {
            if let Some(pages) = self.alloc_in_zone(kind, count, flags) {
                return Ok(pages);
            }
        }
        if flags.contains(PageFlags::FORCE) {
            panic!("pmalloc: out of memory allocating {count} pages");
        }
        Err(Errno::ENOMEM)
    }

    pub fn alloc_pages_zone(&self, kind: ZoneKind, count: usize, flags: PageFlags) -> KernelResult<Vec<Page>> {
        if count == 0 {
            return Err(Errno::EINVAL);
        }
        match self.alloc_in_zone(kind, count, flags) {
            Some(pages) => Ok(pages),
            None if flags.contains(PageFlags::FORCE) => {
                panic!("pmalloc: out of memory in {} zone", kind.name())
            }
            None => Err(Errno::ENOMEM),
        }
    }

    fn locate_zone(&self, addr: u64) -> Option<&Zone> {
        self.zones[zone_kind_of(addr) as usize].iter().find(|z| z.contains(addr))
    }

    pub fn alloc_pages_at(&self, address: u64, count: usize, flags: PageFlags) -> KernelResult<Vec<Page>> {
        if count == 0 || address % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        let (num_frames, _align, stride) = layout_for(count, flags);
        let end = address + num_frames as u64 * PAGE_SIZE - 1;
        if zone_kind_of(address) != zone_kind_of(end) {
            return Err(Errno::EINVAL);
        }
        let zone = self.locate_zone(address).ok_or(Errno::EFAULT)?;
        let frame_index = ((address - zone.base) / PAGE_SIZE) as usize;
        let mut bitmap = zone.bitmap.lock();
        let already_allocated = !bitmap.all_free(frame_index, num_frames);
        if already_allocated && !flags.contains(PageFlags::FORCE) {
            return Err(Errno::EADDRINUSE);
        }
        bitmap.set_n(frame_index, num_frames);
        drop(bitmap);
        Ok(make_pages(zone_kind_of(address), address, count, stride, flags))
    }

    pub fn reserve_pages(&self, address: u64, count: usize) -> KernelResult<()> {
        if count == 0 || address % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        let end = address + count as u64 * PAGE_SIZE - 1;
        if zone_kind_of(address) != zone_kind_of(end) {
            return Err(Errno::EINVAL);
        }
        let Some(zone) = self.locate_zone(address) else {
            // Address outside any usable zone (e.g. MMIO hole): nothing to reserve.
            return Ok(());
        };
        let frame_index = ((address - zone.base) / PAGE_SIZE) as usize;
        let mut bitmap = zone.bitmap.lock();
        if !bitmap.all_free(frame_index, count) {
            return Err(Errno::EADDRINUSE);
        }
        bitmap.set_n(frame_index, count);
        Ok(())
    }

    pub fn free_pages(&self, pages: &[Page]) {
        for page in pages {
            let Some(zone) = self.locate_zone(page.address) else {
                continue;
            };
            let frame_index = ((page.address - zone.base) / PAGE_SIZE) as usize;
            let num_frames = (page.stride() / PAGE_SIZE) as usize;
            zone.bitmap.lock().clear_n(frame_index, num_frames);
        }
    }
}

static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::empty());

/// Discovers zones from the boot memory map. Must run once, before any
/// other `mm` subsystem calls into this module.
pub fn init(boot_info: &BootInfo) {
    let mut allocator = FRAME_ALLOCATOR.lock();
    allocator.populate(boot_info);
    for &kind in &[ZoneKind::Low, ZoneKind::Dma, ZoneKind::Normal, ZoneKind::High] {
        let (total, free) = allocator.zone_stats(kind);
        crate::info!("pmalloc: {} zone: {} pages ({} free)", kind.name(), total, free);
    }
}

pub fn alloc_pages(count: usize, flags: PageFlags) -> KernelResult<Vec<Page>> {
    FRAME_ALLOCATOR.lock().alloc_pages(count, flags)
}

pub fn alloc_pages_zone(kind: ZoneKind, count: usize, flags: PageFlags) -> KernelResult<Vec<Page>> {
    FRAME_ALLOCATOR.lock().alloc_pages_zone(kind, count, flags)
}

pub fn alloc_pages_at(address: u64, count: usize, flags: PageFlags) -> KernelResult<Vec<Page>> {
    FRAME_ALLOCATOR.lock().alloc_pages_at(address, count, flags)
}

pub fn reserve_pages(address: u64, count: usize) -> KernelResult<()> {
    FRAME_ALLOCATOR.lock().reserve_pages(address, count)
}

pub fn free_pages(pages: &[Page]) {
    FRAME_ALLOCATOR.lock().free_pages(pages)
}

/// Bootstraps frames for a caller that needs physical memory before
/// `init` has discovered the full zone layout (e.g. the page-table and
/// heap bootstrap arenas). Thin wrapper kept separate from `alloc_pages`
/// so callers document *why* they're calling before general init.
pub fn early_alloc_pages(count: usize) -> KernelResult<Vec<Page>> {
    alloc_pages(count, PageFlags::WRITE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Vec as HVec;

    fn single_region_boot_info(base: u64, size: u64) -> BootInfo {
        let mut memory_map: HVec<MemoryMapEntry, { crate::boot::MAX_MEMORY_MAP_ENTRIES }> = HVec::new();
        memory_map.push(MemoryMapEntry { kind: MemoryRegionKind::Usable, base, size }).unwrap();
        BootInfo {
            memory_map,
            framebuffer_base: 0,
            framebuffer_size: 0,
            rsdp_phys_addr: None,
            initrd_base: 0,
            initrd_size: 0,
            loader_pml4_phys: 0,
            kernel_virtual_offset: 0,
            kernel_phys_base: 0,
            cpu_count: 1,
        }
    }

    #[test]
    fn straddling_region_splits_across_zones() {
        let mut allocator = FrameAllocator::empty();
        // spans the Low/DMA boundary at 1MiB
        allocator.add_region(MemoryMapEntry {
            kind: MemoryRegionKind::Usable,
            base: ZONE_LOW_MAX - PAGE_SIZE * 4,
            size: PAGE_SIZE * 8,
        });
        assert!(!allocator.zones[ZoneKind::Low as usize].is_empty());
        assert!(!allocator.zones[ZoneKind::Dma as usize].is_empty());
    }

    #[test]
    fn alloc_prefers_high_zone_first() {
        let mut allocator = FrameAllocator::empty();
        allocator.add_zone(ZoneKind::Low, 0, PAGE_SIZE * 4);
        allocator.add_zone(ZoneKind::High, 0x2_0000_0000, PAGE_SIZE * 4);
        let pages = allocator.alloc_pages(1, PageFlags::WRITE).unwrap();
        assert_eq!(pages[0].zone, ZoneKind::High);
    }

    #[test]
    fn alloc_pages_at_rejects_overlap_without_force() {
        let mut allocator = FrameAllocator::empty();
        allocator.add_zone(ZoneKind::Normal, ZONE_DMA_MAX, PAGE_SIZE * 4);
        let first = allocator.alloc_pages_at(ZONE_DMA_MAX, 1, PageFlags::WRITE).unwrap();
        assert_eq!(first[0].address, ZONE_DMA_MAX);
        let conflict = allocator.alloc_pages_at(ZONE_DMA_MAX, 1, PageFlags::WRITE);
        assert_eq!(conflict.unwrap_err(), Errno::EADDRINUSE);
    }

    #[test]
    fn free_then_realloc_reuses_frame() {
        let mut allocator = FrameAllocator::empty();
        allocator.add_zone(ZoneKind::Normal, ZONE_DMA_MAX, PAGE_SIZE * 2);
        let pages = allocator.alloc_pages(2, PageFlags::WRITE).unwrap();
        allocator.free_pages(&pages);
        let (_, free) = allocator.zone_stats(ZoneKind::Normal);
        assert_eq!(free, 2);
    }

    #[test]
    fn reserve_pages_marks_frames_used() {
        let mut allocator = FrameAllocator::empty();
        allocator.add_zone(ZoneKind::Normal, ZONE_DMA_MAX, PAGE_SIZE * 4);
        allocator.reserve_pages(ZONE_DMA_MAX, 2).unwrap();
        let (total, free) = allocator.zone_stats(ZoneKind::Normal);
        assert_eq!(total, 4);
        assert_eq!(free, 2);
    }

    #[test]
    fn populate_from_boot_info_creates_usable_zone() {
        let mut allocator = FrameAllocator::empty();
        let boot_info = single_region_boot_info(ZONE_DMA_MAX, PAGE_SIZE * 16);
        allocator.populate(&boot_info);
        let (total, _) = allocator.zone_stats(ZoneKind::Normal);
        assert_eq!(total, 16);
    }
}
