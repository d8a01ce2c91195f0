// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Page tables: hierarchical directories multiplexing the MMU or MPU into
//! per-process protection domains.
//!
//! A page-table object is a short header, then `2^num_order` entry words,
//! then (top-level only) a few architecture-private words. Each entry packs
//! a present bit, a terminal bit, the permission flags, and a 256-byte
//! aligned address: the physical frame for a terminal entry, the child
//! directory object for a non-terminal one. Construction of a child into a
//! parent counts on both objects and on the child's capability, so neither
//! can be destroyed out from under the hierarchy.
//!
//! Address-space installation (`set`) and fault-time MPU refill belong to
//! the architecture port; everything else — arithmetic, entry management,
//! the recursive walk — is portable and lives here.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{CapType, Error, PgtblFlags, WORD_BITS};

use crate::captbl::{self, RawCap};
use crate::config::{PGTBL_ARCH_WORDS, PGTBL_MAX_NUM_ORDER, PGTBL_MIN_SIZE_ORDER};
use crate::kernel::Kernel;
use crate::KernResult;

/// Entry bit: something is mapped here.
const ENT_PRESENT: usize = 1 << 0;
/// Entry bit: this entry is a page, not a child directory.
const ENT_TERMINAL: usize = 1 << 1;
/// Shift of the permission flags within an entry.
const ENT_FLAG_SHIFT: usize = 2;
/// Mask of the permission flags within an entry.
const ENT_FLAG_MASK: usize = 0x3F << ENT_FLAG_SHIFT;
/// Mask of the address within an entry.
const ENT_ADDR_MASK: usize = !0xFF;

/// Marker bit in the packed base word of a top-level table.
pub const TOP_FLAG: usize = 1;

/// Object header of a page table.
#[repr(C)]
pub struct PgtblHead {
    /// Base virtual address, with `TOP_FLAG` in bit zero.
    base: usize,
    /// `size_order << W/2 | num_order`.
    order: usize,
    /// Child directories constructed under this one.
    child_cnt: AtomicUsize,
    /// Parents this directory is constructed into.
    parent_cnt: AtomicUsize,
}

/// Packs the order word.
pub const fn order_pack(size_order: usize, num_order: usize) -> usize {
    (size_order << (WORD_BITS / 2)) | num_order
}

/// Bytes each entry of the table maps.
pub const fn size_order(order: usize) -> usize {
    order >> (WORD_BITS / 2)
}

/// log2 of the number of entries in the table.
pub const fn num_order(order: usize) -> usize {
    order & ((1 << (WORD_BITS / 2)) - 1)
}

/// Size in bytes of a page-table object.
pub const fn pgtbl_size(num_order: usize, is_top: bool) -> usize {
    core::mem::size_of::<PgtblHead>()
        + (core::mem::size_of::<usize>() << num_order)
        + if is_top {
            PGTBL_ARCH_WORDS * core::mem::size_of::<usize>()
        } else {
            0
        }
}

fn head<'a>(obj: usize) -> &'a PgtblHead {
    // Safety: page-table objects live in marked kernel memory for as long
    // as any capability can name them.
    unsafe { &*(obj as *const PgtblHead) }
}

fn entry<'a>(obj: usize, pos: usize) -> &'a AtomicUsize {
    // Safety: caller has bounds-checked `pos` against the object's
    // num_order.
    unsafe {
        &*((obj + core::mem::size_of::<PgtblHead>()) as *const AtomicUsize).add(pos)
    }
}

fn arch_word<'a>(obj: usize, index: usize) -> &'a AtomicUsize {
    let h = head(obj);
    let entries_end =
        obj + core::mem::size_of::<PgtblHead>() + (core::mem::size_of::<usize>() << num_order(h.order));
    // Safety: only top-level objects are asked for arch words, and they
    // carry PGTBL_ARCH_WORDS of them.
    unsafe { &*(entries_end as *const AtomicUsize).add(index) }
}

/// Whether the object at `obj` is a top-level table.
pub fn is_top(obj: usize) -> bool {
    head(obj).base & TOP_FLAG != 0
}

/// Called by ports when they install a top-level table, so the shadow state
/// (here: an install counter) stays with the object.
pub(crate) fn record_install(obj: usize) {
    if is_top(obj) {
        arch_word(obj, 0).fetch_add(1, Ordering::Relaxed);
    }
}

/// Number of times the table at `obj` has been installed. Test aid.
#[cfg(test)]
pub fn install_count(obj: usize) -> usize {
    arch_word(obj, 0).load(Ordering::Relaxed)
}

/// Validates page-table geometry before any state change.
pub fn check(
    base: usize,
    is_top: bool,
    size_order_: usize,
    num_order_: usize,
    vaddr: usize,
) -> KernResult<()> {
    if size_order_ < PGTBL_MIN_SIZE_ORDER || size_order_ >= WORD_BITS {
        return Err(Error::PgtAddr);
    }
    if num_order_ == 0 || num_order_ > PGTBL_MAX_NUM_ORDER {
        return Err(Error::PgtAddr);
    }
    let total_order = size_order_ + num_order_;
    if total_order > WORD_BITS {
        return Err(Error::PgtAddr);
    }
    // The base must be aligned to the whole span the table maps.
    if total_order < WORD_BITS && base & ((1 << total_order) - 1) != 0 {
        return Err(Error::PgtAddr);
    }
    let _ = is_top;
    // The object itself must sit on an entry-encoding boundary.
    if vaddr & !ENT_ADDR_MASK != 0 {
        return Err(Error::PgtAddr);
    }
    Ok(())
}

fn init_object(vaddr: usize, base: usize, is_top_: bool, size_order_: usize, num_order_: usize) {
    // Safety: caller holds the fresh KOT mark over the object.
    unsafe {
        core::ptr::write_bytes(vaddr as *mut u8, 0, pgtbl_size(num_order_, is_top_));
        let h = vaddr as *mut PgtblHead;
        (*h).base = (base & !TOP_FLAG) | if is_top_ { TOP_FLAG } else { 0 };
        (*h).order = order_pack(size_order_, num_order_);
    }
}

fn new_cap_flags() -> usize {
    abi::PGTBL_FULL_RANGE | PgtblFlags::all().bits()
}

/// Creates a page table without a kernel-memory capability. Boot only.
pub fn boot_crt(
    k: &Kernel,
    root: &RawCap,
    cap_captbl: usize,
    cap_pgtbl: usize,
    vaddr: usize,
    base: usize,
    is_top_: bool,
    size_order_: usize,
    num_order_: usize,
) -> KernResult {
    check(base, is_top_, size_order_, num_order_, vaddr)?;

    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(captbl_op, abi::CaptblFlags::CRT.bits())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_pgtbl)?)?;
    captbl::occupy(dst)?;

    if k.kot.mark(vaddr, pgtbl_size(num_order_, is_top_)).is_err() {
        captbl::retract(dst);
        return Err(Error::CapKotbl);
    }

    init_object(vaddr, base, is_top_, size_order_, num_order_);

    dst.set_parent(0);
    dst.set_object(vaddr);
    dst.set_flags(new_cap_flags());
    dst.set_info(0, order_pack(size_order_, num_order_));
    dst.set_info(1, (base & !TOP_FLAG) | if is_top_ { TOP_FLAG } else { 0 });
    captbl::publish(dst, CapType::Pgtbl);
    Ok(0)
}

/// Creates a page table, with the backing storage authorized by a
/// kernel-memory capability.
pub fn crt(
    k: &Kernel,
    root: &RawCap,
    cap_captbl: usize,
    cap_kmem: usize,
    cap_pgtbl: usize,
    vaddr: usize,
    base: usize,
    is_top_: bool,
    size_order_: usize,
    num_order_: usize,
) -> KernResult {
    check(base, is_top_, size_order_, num_order_, vaddr)?;

    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    let kmem_op = captbl::lookup(root, cap_kmem, CapType::Kmem)?;
    captbl::cap_check(captbl_op, abi::CaptblFlags::CRT.bits())?;
    crate::kernel::kmem_check(
        kmem_op,
        abi::KmemFlags::PGTBL,
        vaddr,
        pgtbl_size(num_order_, is_top_),
    )?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_pgtbl)?)?;
    captbl::occupy(dst)?;

    if k.kot.mark(vaddr, pgtbl_size(num_order_, is_top_)).is_err() {
        captbl::retract(dst);
        return Err(Error::CapKotbl);
    }

    init_object(vaddr, base, is_top_, size_order_, num_order_);

    dst.set_parent(0);
    dst.set_object(vaddr);
    dst.set_flags(new_cap_flags());
    dst.set_info(0, order_pack(size_order_, num_order_));
    dst.set_info(1, (base & !TOP_FLAG) | if is_top_ { TOP_FLAG } else { 0 });
    captbl::publish(dst, CapType::Pgtbl);
    Ok(0)
}

/// Deletes a page-table capability. Besides the usual lifecycle rules, the
/// object must be fully unconstructed: no children mapped under it, not
/// mapped under any parent.
pub fn del(k: &Kernel, root: &RawCap, cap_captbl: usize, cap_pgtbl: usize) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(captbl_op, abi::CaptblFlags::DEL.bits())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_pgtbl)?)?;
    let tr = captbl::destroy_check(k, dst, Some(CapType::Pgtbl), true)?;

    let obj = dst.object();
    let h = head(obj);
    if h.child_cnt.load(Ordering::Relaxed) != 0 || h.parent_cnt.load(Ordering::Relaxed) != 0 {
        captbl::defrost(dst, tr);
        return Err(Error::CapRefcnt);
    }

    let size = pgtbl_size(num_order(h.order), is_top(obj));
    captbl::destroy_object(k, dst, tr, size)?;
    Ok(0)
}

/// Checks `pos` against the position range a page-table capability grants.
fn pos_in_range(cap: &RawCap, pos: usize) -> KernResult<()> {
    let f = cap.flags();
    if pos > abi::pgtbl_flag_high(f) || pos < abi::pgtbl_flag_low(f) {
        return Err(Error::CapFlag);
    }
    Ok(())
}

/// Binds entry `pos` of the table behind `cap` directly to a physical
/// frame. This is the boot-time mapping primitive; after boot, pages move
/// between tables only by delegation (`add`).
pub fn boot_add(
    root: &RawCap,
    cap_pgtbl: usize,
    paddr: usize,
    pos: usize,
    flags: usize,
) -> KernResult {
    let pgtbl_op = captbl::lookup(root, cap_pgtbl, CapType::Pgtbl)?;
    captbl::cap_check(pgtbl_op, 0)?;
    map_entry(pgtbl_op, pos, paddr, flags)?;
    Ok(0)
}

fn map_entry(pgtbl_op: &RawCap, pos: usize, paddr: usize, flags: usize) -> KernResult<()> {
    let order = pgtbl_op.info(0);
    if pos >> num_order(order) != 0 {
        return Err(Error::PgtAddr);
    }
    if paddr & ((1 << size_order(order)) - 1) != 0 {
        return Err(Error::PgtAddr);
    }
    if flags == 0 || flags & !(ENT_FLAG_MASK >> ENT_FLAG_SHIFT) != 0 {
        return Err(Error::PgtPerm);
    }
    let value = ENT_PRESENT | ENT_TERMINAL | (flags << ENT_FLAG_SHIFT) | (paddr & ENT_ADDR_MASK);
    entry(pgtbl_op.object(), pos)
        .compare_exchange(0, value, Ordering::AcqRel, Ordering::Relaxed)
        .map(drop)
        .map_err(|_| Error::PgtMap)
}

/// Delegates one mapped page from a source table into a destination table,
/// the only way pages spread after boot. `index` selects which
/// destination-sized fraction of the source page to take when the orders
/// differ.
pub fn add(
    root: &RawCap,
    cap_pgtbl_dst: usize,
    pos_dst: usize,
    flags_dst: usize,
    cap_pgtbl_src: usize,
    pos_src: usize,
    index: usize,
) -> KernResult {
    let dst_op = captbl::lookup(root, cap_pgtbl_dst, CapType::Pgtbl)?;
    let src_op = captbl::lookup(root, cap_pgtbl_src, CapType::Pgtbl)?;
    captbl::cap_check(dst_op, PgtblFlags::ADD_DST.bits())?;
    captbl::cap_check(src_op, PgtblFlags::ADD_SRC.bits())?;
    pos_in_range(dst_op, pos_dst)?;
    pos_in_range(src_op, pos_src)?;

    let dst_order = dst_op.info(0);
    let src_order = src_op.info(0);
    // Destination pages may be at most as large as source pages.
    if size_order(dst_order) > size_order(src_order) {
        return Err(Error::PgtAddr);
    }
    if pos_dst >> num_order(dst_order) != 0 || pos_src >> num_order(src_order) != 0 {
        return Err(Error::PgtAddr);
    }
    // The sub-page index must stay inside the source page: a source page
    // splits into 2^(src order - dst order) destination-sized pieces.
    if index >= 1usize << (size_order(src_order) - size_order(dst_order)) {
        return Err(Error::PgtAddr);
    }

    let (paddr_src, flags_src) = lookup_entry(src_op, pos_src)?;
    let paddr_dst = paddr_src + (index << size_order(dst_order));

    // We do not allow expansion of access permissions.
    if flags_dst & !flags_src != 0 {
        return Err(Error::PgtPerm);
    }

    map_entry(dst_op, pos_dst, paddr_dst, flags_dst)?;
    Ok(0)
}

/// Unmaps the page at `pos`.
pub fn rem(root: &RawCap, cap_pgtbl: usize, pos: usize) -> KernResult {
    let pgtbl_op = captbl::lookup(root, cap_pgtbl, CapType::Pgtbl)?;
    captbl::cap_check(pgtbl_op, PgtblFlags::REM.bits())?;
    pos_in_range(pgtbl_op, pos)?;

    let order = pgtbl_op.info(0);
    if pos >> num_order(order) != 0 {
        return Err(Error::PgtAddr);
    }
    let ent = entry(pgtbl_op.object(), pos);
    let old = ent.load(Ordering::Relaxed);
    if old & ENT_PRESENT == 0 || old & ENT_TERMINAL == 0 {
        return Err(Error::PgtMap);
    }
    ent.compare_exchange(old, 0, Ordering::AcqRel, Ordering::Relaxed)
        .map(|_| 0)
        .map_err(|_| Error::PgtMap)
}

/// Constructs `child` as a sub-directory under `parent[pos]`.
pub fn con(
    root: &RawCap,
    cap_pgtbl_parent: usize,
    pos: usize,
    cap_pgtbl_child: usize,
    flags_child: usize,
) -> KernResult {
    let parent_op = captbl::lookup(root, cap_pgtbl_parent, CapType::Pgtbl)?;
    let child_op = captbl::lookup(root, cap_pgtbl_child, CapType::Pgtbl)?;
    captbl::cap_check(parent_op, PgtblFlags::CON_PARENT.bits())?;
    captbl::cap_check(child_op, PgtblFlags::CON_CHILD.bits())?;
    pos_in_range(parent_op, pos)?;

    let parent_order = parent_op.info(0);
    if pos >> num_order(parent_order) != 0 {
        return Err(Error::PgtAddr);
    }
    // A top-level table is an address space root; it cannot also be a
    // sub-directory.
    if child_op.info(1) & TOP_FLAG != 0 {
        return Err(Error::PgtAddr);
    }

    let child_order = child_op.info(0);
    let child_span_order = size_order(child_order) + num_order(child_order);
    // The child must fit within one parent slot...
    if size_order(parent_order) < child_span_order {
        return Err(Error::PgtAddr);
    }
    // ...and its window must lie inside that slot's window. A child smaller
    // than the slot (path compression) is allowed as long as it fits.
    let slot_base = (parent_op.info(1) & !TOP_FLAG) + (pos << size_order(parent_order));
    let child_base = child_op.info(1) & !TOP_FLAG;
    if child_base < slot_base
        || child_base - slot_base > (1 << size_order(parent_order)) - (1 << child_span_order)
    {
        return Err(Error::PgtAddr);
    }

    if flags_child == 0 || flags_child & !(ENT_FLAG_MASK >> ENT_FLAG_SHIFT) != 0 {
        return Err(Error::PgtPerm);
    }

    let child_obj = child_op.object();
    let value = ENT_PRESENT | (flags_child << ENT_FLAG_SHIFT) | (child_obj & ENT_ADDR_MASK);
    entry(parent_op.object(), pos)
        .compare_exchange(0, value, Ordering::AcqRel, Ordering::Relaxed)
        .map_err(|_| Error::PgtMap)?;

    // A constructed child is pinned: through its capability (so the cap
    // cannot be deleted) and through the object counters (so the hierarchy
    // stays acyclic and destructible in order).
    if child_op.ref_inc().is_err() {
        entry(parent_op.object(), pos).store(0, Ordering::Release);
        return Err(Error::CapRefcnt);
    }
    head(parent_op.object()).child_cnt.fetch_add(1, Ordering::Relaxed);
    head(child_obj).parent_cnt.fetch_add(1, Ordering::Relaxed);
    Ok(0)
}

/// Destructs the child table at `parent[pos]`, which must be `child`.
pub fn des(
    root: &RawCap,
    cap_pgtbl_parent: usize,
    pos: usize,
    cap_pgtbl_child: usize,
) -> KernResult {
    let parent_op = captbl::lookup(root, cap_pgtbl_parent, CapType::Pgtbl)?;
    let child_op = captbl::lookup(root, cap_pgtbl_child, CapType::Pgtbl)?;
    captbl::cap_check(parent_op, PgtblFlags::DES.bits())?;
    pos_in_range(parent_op, pos)?;

    let parent_order = parent_op.info(0);
    if pos >> num_order(parent_order) != 0 {
        return Err(Error::PgtAddr);
    }

    let ent = entry(parent_op.object(), pos);
    let old = ent.load(Ordering::Relaxed);
    if old & ENT_PRESENT == 0 || old & ENT_TERMINAL != 0 {
        return Err(Error::PgtMap);
    }
    if old & ENT_ADDR_MASK != child_op.object() & ENT_ADDR_MASK {
        return Err(Error::PgtMap);
    }
    ent.compare_exchange(old, 0, Ordering::AcqRel, Ordering::Relaxed)
        .map_err(|_| Error::PgtMap)?;

    head(parent_op.object()).child_cnt.fetch_sub(1, Ordering::Relaxed);
    head(child_op.object()).parent_cnt.fetch_sub(1, Ordering::Relaxed);
    child_op.ref_dec();
    Ok(0)
}

/// Reads the page mapped at `pos` as `(paddr, flags)`.
pub fn lookup_entry(pgtbl_op: &RawCap, pos: usize) -> KernResult<(usize, usize)> {
    let order = pgtbl_op.info(0);
    if pos >> num_order(order) != 0 {
        return Err(Error::PgtAddr);
    }
    let value = entry(pgtbl_op.object(), pos).load(Ordering::Relaxed);
    if value & ENT_PRESENT == 0 || value & ENT_TERMINAL == 0 {
        return Err(Error::PgtHw);
    }
    Ok((
        value & ENT_ADDR_MASK,
        (value & ENT_FLAG_MASK) >> ENT_FLAG_SHIFT,
    ))
}

/// Result of resolving a virtual address through a top-level table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WalkResult {
    /// Object address of the directory holding the terminal entry.
    pub leaf_obj: usize,
    /// Base virtual address of the leaf directory.
    pub leaf_base: usize,
    /// Physical address of the page.
    pub paddr: usize,
    /// Size order of the page.
    pub size_order: usize,
    /// Number order of the leaf directory.
    pub num_order: usize,
    /// Permission flags, intersected across every level of the walk.
    pub flags: usize,
}

/// Resolves `vaddr` from the top-level table object at `top_obj`, the same
/// path an MPU port takes at fault time to compute a refill region.
pub fn walk(top_obj: usize, vaddr: usize) -> KernResult<WalkResult> {
    uassert!(is_top(top_obj));
    let mut obj = top_obj;
    let mut flags_acc = ENT_FLAG_MASK >> ENT_FLAG_SHIFT;

    // The construction rules forbid cycles, but a bounded walk turns any
    // accounting bug into a clean failure instead of a hang.
    for _ in 0..WORD_BITS {
        let h = head(obj);
        let base = h.base & !TOP_FLAG;
        let so = size_order(h.order);
        let no = num_order(h.order);
        if vaddr < base {
            return Err(Error::HalFail);
        }
        // A span of the full word width covers every address.
        if so + no < WORD_BITS && (vaddr - base) >> (so + no) != 0 {
            return Err(Error::HalFail);
        }
        let pos = (vaddr - base) >> so;
        let value = entry(obj, pos).load(Ordering::Relaxed);
        if value & ENT_PRESENT == 0 {
            return Err(Error::HalFail);
        }
        flags_acc &= (value & ENT_FLAG_MASK) >> ENT_FLAG_SHIFT;
        if value & ENT_TERMINAL != 0 {
            return Ok(WalkResult {
                leaf_obj: obj,
                leaf_base: base,
                paddr: value & ENT_ADDR_MASK,
                size_order: so,
                num_order: no,
                flags: flags_acc,
            });
        }
        obj = value & ENT_ADDR_MASK;
    }
    Err(Error::HalFail)
}

/// Installs the top-level table behind `obj` as the current address space.
pub fn set(obj: usize) {
    crate::arch::pgtbl_set(obj);
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::PageFlags;
    use crate::startup::{boot_captbl, test_kernel, BOOT_CAPTBL_SELF};

    const RW: usize = PageFlags::READ.bits() | PageFlags::WRITE.bits();
    const RO: usize = PageFlags::READ.bits();

    // Builds a root captbl and returns (kernel, root).
    fn setup() -> (&'static Kernel, &'static RawCap) {
        let k = test_kernel(512);
        let root = boot_captbl(k, 16).unwrap();
        (k, root)
    }

    #[test]
    fn geometry_is_validated() {
        // Too-small pages, zero entries, oversized span, misaligned base.
        assert_eq!(check(0, true, 4, 4, 0x1000), Err(Error::PgtAddr));
        assert_eq!(check(0, true, 12, 0, 0x1000), Err(Error::PgtAddr));
        assert_eq!(check(0, false, 60, 8, 0x1000), Err(Error::PgtAddr));
        assert_eq!(check(0x100, false, 12, 4, 0x1000), Err(Error::PgtAddr));
        assert!(check(0x1_0000, false, 12, 4, 0x1000).is_ok());
    }

    #[test]
    fn map_lookup_unmap() {
        let (k, root) = setup();
        let vaddr = k.kot.base() + 0x4000;
        // A top-level table: 16 pages of 4KiB at 0.
        boot_crt(k, root, BOOT_CAPTBL_SELF, 1, vaddr, 0, true, 12, 4).unwrap();

        boot_add(root, 1, 0x8000_0000, 3, RW).unwrap();
        let pg = captbl::lookup(root, 1, CapType::Pgtbl).unwrap();
        assert_eq!(lookup_entry(pg, 3).unwrap(), (0x8000_0000, RW));

        // Double map fails, bad alignment fails.
        assert_eq!(boot_add(root, 1, 0x8000_1000, 3, RW), Err(Error::PgtMap));
        assert_eq!(boot_add(root, 1, 0x8000_0123, 4, RW), Err(Error::PgtAddr));

        rem(root, 1, 3).unwrap();
        assert_eq!(lookup_entry(pg, 3), Err(Error::PgtHw));
        assert_eq!(rem(root, 1, 3), Err(Error::PgtMap));
    }

    #[test]
    fn page_delegation_cannot_widen_permissions() {
        let (k, root) = setup();
        boot_crt(k, root, BOOT_CAPTBL_SELF, 1, k.kot.base() + 0x4000, 0, true, 12, 4).unwrap();
        boot_crt(k, root, BOOT_CAPTBL_SELF, 2, k.kot.base() + 0x5000, 0, true, 12, 4).unwrap();
        boot_add(root, 1, 0x8000_0000, 0, RO).unwrap();

        assert_eq!(add(root, 2, 0, RW, 1, 0, 0), Err(Error::PgtPerm));
        add(root, 2, 0, RO, 1, 0, 0).unwrap();
        let dst = captbl::lookup(root, 2, CapType::Pgtbl).unwrap();
        assert_eq!(lookup_entry(dst, 0).unwrap(), (0x8000_0000, RO));
    }

    #[test]
    fn page_delegation_splits_by_index() {
        let (k, root) = setup();
        // Source: one 64KiB page. Destination: 4KiB pages.
        boot_crt(k, root, BOOT_CAPTBL_SELF, 1, k.kot.base() + 0x4000, 0, true, 16, 4).unwrap();
        boot_crt(k, root, BOOT_CAPTBL_SELF, 2, k.kot.base() + 0x5000, 0, true, 12, 4).unwrap();
        boot_add(root, 1, 0x8000_0000, 0, RW).unwrap();

        add(root, 2, 5, RW, 1, 0, 3).unwrap();
        let dst = captbl::lookup(root, 2, CapType::Pgtbl).unwrap();
        assert_eq!(lookup_entry(dst, 5).unwrap(), (0x8000_3000, RW));

        // An index past the end of the source page is refused.
        assert_eq!(add(root, 2, 6, RW, 1, 0, 16), Err(Error::PgtAddr));
    }

    #[test]
    fn construct_walk_destruct() {
        let (k, root) = setup();
        // Top level: 16 slots of 64KiB. Child: 16 pages of 4KiB at base
        // 0x20000 (slot 2).
        boot_crt(k, root, BOOT_CAPTBL_SELF, 1, k.kot.base() + 0x4000, 0, true, 16, 4).unwrap();
        boot_crt(
            k,
            root,
            BOOT_CAPTBL_SELF,
            2,
            k.kot.base() + 0x5000,
            0x2_0000,
            false,
            12,
            4,
        )
        .unwrap();

        con(root, 1, 2, 2, RW).unwrap();
        boot_add(root, 2, 0x8000_0000, 1, RO).unwrap();

        let top = captbl::lookup(root, 1, CapType::Pgtbl).unwrap();
        let child = captbl::lookup(root, 2, CapType::Pgtbl).unwrap();

        let hit = walk(top.object(), 0x2_1234).unwrap();
        assert_eq!(hit.paddr, 0x8000_0000);
        assert_eq!(hit.size_order, 12);
        assert_eq!(hit.leaf_obj, child.object());
        assert_eq!(
            hit.flags, RO,
            "walk must intersect flags across the traversal"
        );
        // The walk agrees with a direct lookup at the leaf.
        assert_eq!(
            lookup_entry(child, (0x2_1234 - 0x2_0000) >> 12).unwrap().0,
            hit.paddr
        );

        // Unresolvable addresses report failure.
        assert_eq!(walk(top.object(), 0x3_0000), Err(Error::HalFail));

        // The constructed child is pinned against deletion.
        captbl::frz(k, root, BOOT_CAPTBL_SELF, 2).unwrap_err();

        // Destruct, then the hole is unmapped.
        des(root, 1, 2, 2).unwrap();
        assert_eq!(walk(top.object(), 0x2_1234), Err(Error::HalFail));
    }

    #[test]
    fn constructed_tables_cannot_die_until_destructed() {
        let (k, root) = setup();
        boot_crt(k, root, BOOT_CAPTBL_SELF, 1, k.kot.base() + 0x4000, 0, true, 16, 4).unwrap();
        boot_crt(
            k,
            root,
            BOOT_CAPTBL_SELF,
            2,
            k.kot.base() + 0x5000,
            0,
            false,
            12,
            4,
        )
        .unwrap();
        con(root, 1, 0, 2, RW).unwrap();

        // The parent holds a child; deletion is refused on the counters.
        captbl::frz(k, root, BOOT_CAPTBL_SELF, 1).unwrap();
        for _ in 0..crate::config::QUIE_TIME + 1 {
            k.advance_timestamp();
        }
        assert_eq!(
            del(k, root, BOOT_CAPTBL_SELF, 1).unwrap_err(),
            Error::CapRefcnt
        );

        des(root, 1, 0, 2).unwrap();
        // Defrosted by the failed delete; freeze again and now it dies.
        captbl::frz(k, root, BOOT_CAPTBL_SELF, 1).unwrap();
        for _ in 0..crate::config::QUIE_TIME + 1 {
            k.advance_timestamp();
        }
        del(k, root, BOOT_CAPTBL_SELF, 1).unwrap();
    }

    #[test]
    fn top_level_cannot_be_constructed() {
        let (k, root) = setup();
        boot_crt(k, root, BOOT_CAPTBL_SELF, 1, k.kot.base() + 0x4000, 0, true, 16, 4).unwrap();
        boot_crt(
            k,
            root,
            BOOT_CAPTBL_SELF,
            2,
            k.kot.base() + 0x5000,
            0,
            true,
            12,
            4,
        )
        .unwrap();
        assert_eq!(con(root, 1, 0, 2, RW), Err(Error::PgtAddr));
    }
}
