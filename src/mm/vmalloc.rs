//! Virtual address-space manager (L4): an `IntervalTree<Mapping>` per
//! address space records which virtual ranges are in use and what backs
//! them, while `pgtable` does the actual PTE edits. `handle_page_fault`
//! closes the loop from `arch::x86_64::idt`'s `#PF` handler back here.
//!
//! Only the kernel address space is modeled. A per-process user space
//! would reuse the same `AddressSpace` type with a different tree and a
//! `CR3` swap; that's future scheduler/process-table work, not a gap in
//! this layer.

use alloc::string::String;
use spin::Mutex;

use crate::lib::error::{Errno, KernelResult};
use crate::mm::interval_tree::{Interval, IntervalTree};
use crate::mm::page::{page_align_up, Page, PageFlags, PAGE_SIZE, PAGE_SIZE_1GB, PAGE_SIZE_2MB};
use crate::mm::pgtable;

pub const USER_SPACE_START: u64 = 0x0000_0000_0000_1000;
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;
pub const KERNEL_SPACE_END: u64 = 0xFFFF_FFFF_FFFF_F000;
/// Reserved sub-range of the kernel space that `vmap_mmio` hands out from,
/// kept apart from general kernel allocations so device BARs never collide
/// with heap or stack growth.
pub const MMIO_BASE_VA: u64 = 0xFFFF_C000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// Backed by one or more `Page`s from `frame_alloc` (owns the frames).
    Pages,
    /// A window onto a caller-supplied physical range (doesn't own it).
    Phys,
    /// Anonymous memory: owns its frames like `Pages`, but allocated and
    /// zeroed by `vmap_anon` itself (kernel stacks, heap arenas) rather
    /// than handed in by the caller already backed.
    Anon,
    /// A hole reserved in the tree with no PTEs installed (e.g. guard
    /// pages, or regions described but not yet backed).
    Reserved,
}

pub struct Mapping {
    pub kind: MappingKind,
    pub flags: PageFlags,
    pub phys_base: u64,
    pub name: &'static str,
}

fn stride_for_flags(flags: PageFlags) -> u64 {
    if flags.contains(PageFlags::HUGEPAGE) {
        PAGE_SIZE_1GB
    } else if flags.contains(PageFlags::BIGPAGE) {
        PAGE_SIZE_2MB
    } else {
        PAGE_SIZE
    }
}

pub struct AddressSpace {
    tree: IntervalTree<Mapping>,
    min_addr: u64,
    max_addr: u64,
}

impl AddressSpace {
    const fn new(min_addr: u64, max_addr: u64) -> Self {
        AddressSpace { tree: IntervalTree::new(), min_addr, max_addr }
    }

    fn reserve_region(&mut self, base: u64, size: u64) -> KernelResult<Interval> {
        if base < self.min_addr || base + size > self.max_addr {
            return Err(Errno::EINVAL);
        }
        Ok(Interval::new(base, base + size))
    }

    fn find_region(&mut self, hint: u64, size: u64, fixed: bool) -> KernelResult<Interval> {
        if fixed {
            return self.reserve_region(hint, size);
        }
        let alignment = if size >= PAGE_SIZE_1GB {
            PAGE_SIZE_1GB
        } else if size >= PAGE_SIZE_2MB {
            PAGE_SIZE_2MB
        } else {
            PAGE_SIZE
        };
        let gap = self.tree.find_free_gap(size, alignment, hint.max(self.min_addr));
        if gap.is_null() || gap.end > self.max_addr {
            return Err(Errno::ENOMEM);
        }
        Ok(gap)
    }

    fn insert_mapping(&mut self, interval: Interval, mapping: Mapping) -> KernelResult<usize> {
        self.tree.insert(interval, mapping)
    }
}

static KERNEL_SPACE: Mutex<AddressSpace> = Mutex::new(AddressSpace::new(KERNEL_SPACE_START, KERNEL_SPACE_END));

fn select_space(addr: u64) -> KernelResult<&'static Mutex<AddressSpace>> {
    if (USER_SPACE_START..USER_SPACE_END).contains(&addr) {
        // A per-process user address space isn't wired up yet; see module docs.
        Err(Errno::ENOTSUP)
    } else if (KERNEL_SPACE_START..=KERNEL_SPACE_END).contains(&addr) {
        Ok(&KERNEL_SPACE)
    } else {
        Err(Errno::EFAULT)
    }
}

/// Maps a run of already-allocated pages (all the same stride) at `hint`,
/// or the first free gap at or after `hint` if `fixed` is false. Installs
/// real PTEs for every frame.
pub fn vmap_pages(pages: &[Page], hint: u64, fixed: bool, name: &'static str) -> KernelResult<u64> {
    vmap_pages_as(pages, hint, fixed, name, MappingKind::Pages)
}

fn vmap_pages_as(pages: &[Page], hint: u64, fixed: bool, name: &'static str, kind: MappingKind) -> KernelResult<u64> {
    if pages.is_empty() {
        return Err(Errno::EINVAL);
    }
    let flags = pages[0].flags;
    let stride = stride_for_flags(flags);
    let size = stride * pages.len() as u64;

    let space_lock = select_space(hint)?;
    let mut space = space_lock.lock();
    let interval = space.find_region(hint, size, fixed)?;
    space.insert_mapping(interval, Mapping { kind, flags, phys_base: pages[0].address, name })?;
    drop(space);

    let mut virt = interval.start;
    for page in pages {
        unsafe { pgtable::map_entry(virt, page.address, flags)? };
        virt += stride;
    }
    Ok(interval.start)
}

/// Maps `size` bytes of a physical range at `hint` (or the first free gap).
/// Does not take ownership of the physical memory: `vunmap` never frees it.
pub fn vmap_phys(phys_addr: u64, size: u64, flags: PageFlags, hint: u64, fixed: bool, name: &'static str) -> KernelResult<u64> {
    if phys_addr % PAGE_SIZE != 0 || size == 0 || size % PAGE_SIZE != 0 {
        return Err(Errno::EINVAL);
    }
    let stride = stride_for_flags(flags);
    let count = size.div_ceil(stride);

    let space_lock = select_space(hint)?;
    let mut space = space_lock.lock();
    let interval = space.find_region(hint, count * stride, fixed)?;
    space.insert_mapping(interval, Mapping { kind: MappingKind::Phys, flags, phys_base: phys_addr, name })?;
    drop(space);

    let mut virt = interval.start;
    let mut phys = phys_addr;
    for _ in 0..count {
        unsafe { pgtable::map_entry(virt, phys, flags)? };
        virt += stride;
        phys += stride;
    }
    Ok(interval.start)
}

/// Maps an MMIO physical range (uncached, kernel-only) from the dedicated
/// MMIO sub-range of kernel space.
pub fn vmap_mmio(phys_addr: u64, size: u64) -> KernelResult<u64> {
    let flags = PageFlags::WRITE | PageFlags::NOCACHE;
    vmap_phys(phys_addr, size, flags, MMIO_BASE_VA, false, "mmio")
}

/// Allocates and maps fresh, zero-backed pages: the `valloc_pages` path,
/// used for anonymous kernel memory (stacks, heap arenas).
pub fn vmap_anon(count: usize, flags: PageFlags, name: &'static str) -> KernelResult<u64> {
    let pages = crate::mm::frame_alloc::alloc_pages(count, flags)?;
    match vmap_pages_as(&pages, KERNEL_SPACE_START, false, name, MappingKind::Anon) {
        Ok(virt) => {
            unsafe { core::ptr::write_bytes(virt as *mut u8, 0, count * stride_for_flags(flags) as usize) };
            Ok(virt)
        }
        Err(e) => {
            crate::mm::frame_alloc::free_pages(&pages);
            Err(e)
        }
    }
}

/// Reserves a virtual range with no backing (no PTEs installed): guard
/// pages, or a placeholder for a region another subsystem will fill in
/// with its own `map_entry` calls later.
pub fn vmap_reserve(hint: u64, size: u64) -> KernelResult<u64> {
    let space_lock = select_space(hint)?;
    let mut space = space_lock.lock();
    let interval = space.find_region(hint, size, true)?;
    space.insert_mapping(interval, Mapping { kind: MappingKind::Reserved, flags: PageFlags::empty(), phys_base: 0, name: "reserved" })?;
    Ok(interval.start)
}

/// Tears down the mapping covering `[addr, addr + size)`. `Pages` and
/// `Anon` mappings free their frames back to `frame_alloc`; `Phys` and
/// `Reserved` mappings only drop the PTEs (and, for `Reserved`, there
/// were none to drop).
pub fn vunmap(addr: u64, size: u64) -> KernelResult<()> {
    let space_lock = select_space(addr)?;
    let mut space = space_lock.lock();
    let id = space.tree.find_overlap(Interval::new(addr, addr + size)).ok_or(Errno::EFAULT)?;
    let found = space.tree.interval_of(id);
    if found.start != addr || found.end != addr + size {
        return Err(Errno::EINVAL);
    }
    let mapping = space.tree.remove(id);
    drop(space);

    if mapping.kind != MappingKind::Reserved {
        let stride = stride_for_flags(mapping.flags);
        let mut virt = addr;
        let mut phys = mapping.phys_base;
        let mut pages_to_free = alloc::vec::Vec::new();
        while virt < addr + size {
            unsafe { pgtable::unmap_entry(virt, mapping.flags) };
            if mapping.kind == MappingKind::Pages || mapping.kind == MappingKind::Anon {
                pages_to_free.push(Page { address: phys, flags: mapping.flags, zone: crate::mm::page::ZoneKind::Low, mapping: None });
            }
            virt += stride;
            phys += stride;
        }
        if !pages_to_free.is_empty() {
            // `zone` above is a placeholder; frame_alloc locates the owning
            // zone by address, not by this field, when freeing.
            crate::mm::frame_alloc::free_pages(&pages_to_free);
        }
    }
    Ok(())
}

/// Looks up the physical frame backing `addr`, if any mapping covers it.
pub fn virt_to_phys(addr: u64) -> Option<u64> {
    let space_lock = select_space(addr).ok()?;
    let space = space_lock.lock();
    let id = space.tree.find_overlap(Interval::new(addr, addr + 1))?;
    let mapping = space.tree.get(id);
    if mapping.kind == MappingKind::Reserved {
        return None;
    }
    let start = space.tree.interval_of(id).start;
    Some(mapping.phys_base + (addr - start))
}

pub fn mapping_name(addr: u64) -> Option<String> {
    let space_lock = select_space(addr).ok()?;
    let space = space_lock.lock();
    space.tree.get_point(addr).map(|m| String::from(m.name))
}

/// Entry point for `arch::x86_64::idt`'s `#PF` handler. Distinguishes a
/// genuine fault (no mapping, or a write to a read-only mapping) from
/// nothing this layer understands yet (lazy/COW faults belong to a
/// process-level fault handler this core doesn't implement).
pub fn handle_page_fault(addr: u64, _present: bool, write: bool) -> KernelResult<()> {
    let space_lock = select_space(addr)?;
    let space = space_lock.lock();
    let mapping = space.tree.get_point(addr).ok_or(Errno::EFAULT)?;
    if write && !mapping.flags.contains(PageFlags::WRITE) {
        return Err(Errno::EFAULT);
    }
    // Every mapping this layer creates is eagerly backed; demand paging
    // and copy-on-write live above this core, so any fault that reaches
    // here is unrecoverable at this layer. Mirrors the original kernel's
    // own fault handler, which logs and fails rather than repairing.
    Err(Errno::EFAULT)
}

/// Installs the kernel address space's reserved regions: low memory, the
/// kernel image, and the MMIO window. Mirrors `init_address_space`'s
/// bootstrap reservations; it does not map anything, only claims the
/// ranges so later `vmap_*` calls can't collide with them.
pub fn init(kernel_image_base: u64, kernel_image_size: u64) -> KernelResult<()> {
    let mut space = KERNEL_SPACE.lock();
    space.insert_mapping(
        space.reserve_region(kernel_image_base, kernel_image_size)?,
        Mapping { kind: MappingKind::Reserved, flags: PageFlags::empty(), phys_base: 0, name: "kernel image" },
    )?;
    let mmio_size = KERNEL_SPACE_END - MMIO_BASE_VA;
    space.insert_mapping(
        space.reserve_region(MMIO_BASE_VA, mmio_size)?,
        Mapping { kind: MappingKind::Reserved, flags: PageFlags::empty(), phys_base: 0, name: "mmio window" },
    )?;
    crate::info!("vmalloc: kernel space [{:#x}-{:#x}) initialized", KERNEL_SPACE_START, KERNEL_SPACE_END);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_region_respects_fixed_vs_hint() {
        let mut space = AddressSpace::new(KERNEL_SPACE_START, KERNEL_SPACE_END);
        let first = space.find_region(KERNEL_SPACE_START + 0x1000, PAGE_SIZE, true).unwrap();
        assert_eq!(first.start, KERNEL_SPACE_START + 0x1000);
        space.insert_mapping(first, Mapping { kind: MappingKind::Reserved, flags: PageFlags::empty(), phys_base: 0, name: "a" }).unwrap();

        let second = space.find_region(KERNEL_SPACE_START, PAGE_SIZE, false).unwrap();
        assert!(!second.overlaps(&first));
    }

    #[test]
    fn fixed_region_outside_bounds_rejected() {
        let mut space = AddressSpace::new(KERNEL_SPACE_START, KERNEL_SPACE_END);
        let err = space.find_region(0, PAGE_SIZE, true).unwrap_err();
        assert_eq!(err, Errno::EINVAL);
    }

    #[test]
    fn page_align_up_rounds_correctly() {
        assert_eq!(page_align_up(1), PAGE_SIZE);
        assert_eq!(page_align_up(PAGE_SIZE), PAGE_SIZE);
    }
}
