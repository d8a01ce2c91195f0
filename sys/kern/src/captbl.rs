// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability tables and the capability lifecycle.
//!
//! A capability table is an array of eight-word slots in kernel memory,
//! itself reached through a capability. Every slot's first word is its
//! `TypeRef`: the type tag in the top bits, a frozen marker just below, and
//! a delegation reference count in the rest. That one word gates the whole
//! lifecycle with compare-and-swap:
//!
//! - creation occupies an empty slot by `CAS(0 -> frozen)`, fills in the
//!   header, and publishes with a release store of the final type, so a
//!   reader that observes a published type also observes the header;
//! - freeze stamps the quiescence timestamp and `CAS`es the frozen bit on;
//! - delete and remove require a frozen, quiescent, unreferenced slot and
//!   clear it with `CAS(observed -> 0)`, defrosting instead if a reference
//!   count or parent check fails;
//! - delegation copies the header under narrowed flags, points `Parent` at
//!   the source slot, and bumps the source's reference count with
//!   fetch-add, backing the whole thing out on overflow.
//!
//! Nothing in here locks, and no operation makes an observable change
//! before its last fallible check.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{CapId, CapType, CaptblFlags, Error, WORD_BITS};

use crate::kernel::Kernel;
use crate::KernResult;

/// One capability slot. All fields are atomic words: `type_ref` carries the
/// publication protocol, the rest are written only by a slot's occupier
/// between occupy and publish (or read racily by cross-core observers that
/// hold the slot alive through its reference count).
#[repr(C)]
#[derive(Debug)]
pub struct RawCap {
    type_ref: AtomicUsize,
    parent: AtomicUsize,
    flags: AtomicUsize,
    object: AtomicUsize,
    timestamp: AtomicUsize,
    info: [AtomicUsize; 3],
}

// The ABI fixes a capability slot at exactly eight machine words.
static_assertions::const_assert_eq!(
    core::mem::size_of::<RawCap>(),
    8 * core::mem::size_of::<usize>()
);

/// Bitfield view of a `TypeRef` word.
///
/// ```text
/// [ type : W/4 bits ][ frozen : 1 ][ refcount : 3W/4 - 1 bits ]
/// ```
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct TypeRef(pub usize);

impl TypeRef {
    /// Shift of the type tag field.
    pub const TYPE_SHIFT: usize = WORD_BITS / 4 * 3;
    /// The frozen marker sits directly below the type tag.
    pub const FROZEN: usize = 1 << (Self::TYPE_SHIFT - 1);
    /// Mask of the reference count field.
    pub const REF_MASK: usize = Self::FROZEN - 1;
    /// Cap on the reference count, low enough that a racing fetch-add can
    /// never carry into the frozen bit.
    pub const MAX_REF: usize = Self::REF_MASK >> 1;

    /// Packs a type tag and reference count.
    pub const fn pack(ty: CapType, refs: usize) -> usize {
        ((ty as usize) << Self::TYPE_SHIFT) | refs
    }

    pub fn cap_type(self) -> CapType {
        // A tag outside the known set can only come from corrupted kernel
        // memory.
        match CapType::from_tag(self.0 >> Self::TYPE_SHIFT) {
            Some(t) => t,
            None => crate::fail::die("corrupt capability type tag"),
        }
    }

    pub fn is_frozen(self) -> bool {
        self.0 & Self::FROZEN != 0
    }

    pub fn refs(self) -> usize {
        self.0 & Self::REF_MASK
    }
}

impl RawCap {
    /// Loads the `TypeRef` word. Acquire pairs with the release in
    /// `publish`, so a caller that sees a published type sees the header
    /// fields written before it.
    pub fn type_ref(&self) -> TypeRef {
        TypeRef(self.type_ref.load(Ordering::Acquire))
    }

    pub fn flags(&self) -> usize {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn object(&self) -> usize {
        self.object.load(Ordering::Relaxed)
    }

    pub fn parent(&self) -> usize {
        self.parent.load(Ordering::Relaxed)
    }

    pub fn timestamp(&self) -> usize {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub fn info(&self, i: usize) -> usize {
        self.info[i].load(Ordering::Relaxed)
    }

    pub(crate) fn set_flags(&self, v: usize) {
        self.flags.store(v, Ordering::Relaxed);
    }

    pub(crate) fn set_object(&self, v: usize) {
        self.object.store(v, Ordering::Relaxed);
    }

    pub(crate) fn set_parent(&self, v: usize) {
        self.parent.store(v, Ordering::Relaxed);
    }

    pub(crate) fn set_timestamp(&self, v: usize) {
        self.timestamp.store(v, Ordering::Relaxed);
    }

    pub(crate) fn set_info(&self, i: usize, v: usize) {
        self.info[i].store(v, Ordering::Relaxed);
    }

    /// Bumps the reference count, failing on saturation. The increment is
    /// visible to racing destroyers immediately, which is what keeps the
    /// referent alive.
    pub(crate) fn ref_inc(&self) -> KernResult<()> {
        let old = self.type_ref.fetch_add(1, Ordering::AcqRel);
        if TypeRef(old).refs() >= TypeRef::MAX_REF {
            self.type_ref.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::CapRefcnt);
        }
        Ok(())
    }

    pub(crate) fn ref_dec(&self) {
        let old = self.type_ref.fetch_sub(1, Ordering::AcqRel);
        uassert!(TypeRef(old).refs() != 0);
    }
}

/// Views a capability slot at a raw kernel address.
///
/// # Safety
///
/// `addr` must point at a live `RawCap` that outlives the returned
/// reference; the deletion protocol (refcounts plus quiescence) is what
/// makes that true for addresses taken out of published capabilities.
pub(crate) unsafe fn cap_at<'a>(addr: usize) -> &'a RawCap {
    &*(addr as *const RawCap)
}

/// Size in bytes of a table of `entries` capability slots.
pub const fn captbl_size(entries: usize) -> usize {
    entries * core::mem::size_of::<RawCap>()
}

/// Entry count of a capability table, from its capability.
pub fn entries(captbl: &RawCap) -> usize {
    captbl.info(0)
}

/// Decodes a capability ID that must be one-level.
pub(crate) fn one_level(raw: usize) -> KernResult<usize> {
    match CapId::decode(raw)? {
        CapId::One(i) => Ok(i),
        CapId::Two(..) => Err(Error::CapRange),
    }
}

/// Indexes slot `index` of the table behind `captbl`, range-checked.
pub(crate) fn slot<'a>(captbl: &'a RawCap, index: usize) -> KernResult<&'a RawCap> {
    if index >= entries(captbl) {
        return Err(Error::CapRange);
    }
    let base = captbl.object() as *const RawCap;
    // Safety: a published captbl capability's object pointer covers
    // `entries` slots, and the table outlives the capability per the
    // deletion protocol.
    Ok(unsafe { &*base.add(index) })
}

/// Typed lookup: resolves a one- or two-level capability ID against `root`
/// and checks the slot's published type. A frozen intermediate table is
/// refused; frozen state of the final capability is the concern of
/// `cap_check` (ordinary operations) or the destroy checks.
pub fn lookup<'a>(root: &'a RawCap, raw_cid: usize, want: CapType) -> KernResult<&'a RawCap> {
    match CapId::decode(raw_cid)? {
        CapId::One(index) => {
            let cap = slot(root, index)?;
            if cap.type_ref().cap_type() != want {
                return Err(Error::CapType);
            }
            Ok(cap)
        }
        CapId::Two(outer, inner) => {
            let table = slot(root, outer)?;
            let tr = table.type_ref();
            if tr.is_frozen() {
                return Err(Error::CapFrozen);
            }
            if tr.cap_type() != CapType::Captbl {
                return Err(Error::CapType);
            }
            let cap = slot(table, inner)?;
            if cap.type_ref().cap_type() != want {
                return Err(Error::CapType);
            }
            Ok(cap)
        }
    }
}

/// Checks that a capability is live (not frozen) and grants every bit of
/// `need`.
pub fn cap_check(cap: &RawCap, need: usize) -> KernResult<()> {
    if cap.type_ref().is_frozen() {
        return Err(Error::CapFrozen);
    }
    if cap.flags() & need != need {
        return Err(Error::CapFlag);
    }
    Ok(())
}

/// Claims an empty slot for creation: `CAS(0 -> frozen)`. The loser of a
/// creation race sees `CapExist`.
pub(crate) fn occupy(slot: &RawCap) -> KernResult<()> {
    slot.type_ref
        .compare_exchange(0, TypeRef::FROZEN, Ordering::AcqRel, Ordering::Relaxed)
        .map(drop)
        .map_err(|_| Error::CapExist)
}

/// Publishes an occupied slot with its final type and a zero reference
/// count. Release pairs with the acquire in `type_ref()`.
pub(crate) fn publish(slot: &RawCap, ty: CapType) {
    slot.type_ref.store(TypeRef::pack(ty, 0), Ordering::Release);
}

/// Publishes a boot capability born with one reference, making it
/// permanently undeletable.
pub(crate) fn publish_undeletable(slot: &RawCap, ty: CapType) {
    slot.type_ref.store(TypeRef::pack(ty, 1), Ordering::Release);
}

/// Abandons an occupied slot after a failed creation.
pub(crate) fn retract(slot: &RawCap) {
    slot.type_ref.store(0, Ordering::Release);
}

/// Un-freezes a slot after a rejected destruction. CAS, because a competing
/// destroyer may have cleared the slot under us; if so, losing is correct.
pub(crate) fn defrost(slot: &RawCap, observed: TypeRef) {
    let _ = slot.type_ref.compare_exchange(
        observed.0,
        observed.0 & !TypeRef::FROZEN,
        Ordering::AcqRel,
        Ordering::Relaxed,
    );
}

/// Common validation for delete (`require_root`) and remove (`!require_root`).
///
/// On success the slot is still frozen and the observed `TypeRef` is
/// returned for the final clearing CAS. Reference-count and parent
/// rejections defrost, so an operator that merely picked the wrong call
/// does not leave the capability stuck.
pub(crate) fn destroy_check(
    k: &Kernel,
    slot: &RawCap,
    want: Option<CapType>,
    require_root: bool,
) -> KernResult<TypeRef> {
    let tr = slot.type_ref();
    // Destruction is the one operation family that demands the frozen
    // marker: freezing is what starts the quiescence clock.
    if !tr.is_frozen() {
        return Err(Error::CapFrozen);
    }
    if tr.cap_type() == CapType::Nop {
        return Err(Error::CapNull);
    }
    if let Some(w) = want {
        if tr.cap_type() != w {
            return Err(Error::CapType);
        }
    }
    if !k.quiescent(slot.timestamp()) {
        return Err(Error::CapQuie);
    }
    let parent_ok = if require_root {
        slot.parent() == 0
    } else {
        slot.parent() != 0
    };
    if tr.refs() != 0 || !parent_ok {
        defrost(slot, tr);
        return Err(Error::CapRefcnt);
    }
    Ok(tr)
}

/// Atomically clears a slot whose `TypeRef` was observed as `tr`. Losing
/// the CAS means a competing destroyer got there first.
pub(crate) fn remdel(slot: &RawCap, tr: TypeRef) -> KernResult<()> {
    slot.type_ref
        .compare_exchange(tr.0, 0, Ordering::AcqRel, Ordering::Relaxed)
        .map(drop)
        .map_err(|_| Error::CapNull)
}

fn check_entry_count(entries: usize) -> KernResult<()> {
    if entries == 0 || entries > CapId::MAX_ENTRIES {
        return Err(Error::CapRange);
    }
    Ok(())
}

/// Zeroes a fresh table so every slot reads as empty.
unsafe fn clear_table(vaddr: usize, entry_count: usize) {
    core::ptr::write_bytes(vaddr as *mut u8, 0, captbl_size(entry_count));
}

fn fill_captbl_cap(slot: &RawCap, vaddr: usize, entry_count: usize) {
    slot.set_parent(0);
    slot.set_object(vaddr);
    slot.set_flags(CaptblFlags::all().bits());
    slot.set_info(0, entry_count);
}

/// Creates the first capability table of the system, placing it at `vaddr`
/// and installing its own capability in slot `cid` of itself. Startup only.
pub fn boot_init(k: &Kernel, cid: usize, vaddr: usize, entry_count: usize) -> KernResult {
    check_entry_count(entry_count)?;
    if cid >= entry_count {
        return Err(Error::CapRange);
    }

    k.kot
        .mark(vaddr, captbl_size(entry_count))
        .map_err(|_| Error::CapKotbl)?;

    // Safety: the mark above gives us exclusive ownership of the range.
    unsafe { clear_table(vaddr, entry_count) };

    let table = unsafe { cap_at(vaddr + cid * core::mem::size_of::<RawCap>()) };
    fill_captbl_cap(table, vaddr, entry_count);
    publish(table, CapType::Captbl);
    Ok(cid)
}

/// Creates a capability table without a kernel-memory capability. Boot
/// only; the boot path owns all of kernel memory by construction.
pub fn boot_crt(
    k: &Kernel,
    root: &RawCap,
    cap_captbl: usize,
    cap_crt: usize,
    vaddr: usize,
    entry_count: usize,
) -> KernResult {
    check_entry_count(entry_count)?;

    let captbl_op = lookup(root, cap_captbl, CapType::Captbl)?;
    cap_check(captbl_op, CaptblFlags::CRT.bits())?;

    let dst = slot(captbl_op, one_level(cap_crt)?)?;
    occupy(dst)?;

    if k.kot.mark(vaddr, captbl_size(entry_count)).is_err() {
        retract(dst);
        return Err(Error::CapKotbl);
    }

    // Safety: the mark above gives us exclusive ownership of the range.
    unsafe { clear_table(vaddr, entry_count) };

    fill_captbl_cap(dst, vaddr, entry_count);
    publish(dst, CapType::Captbl);
    Ok(0)
}

/// Creates a capability table, with the backing storage authorized by a
/// kernel-memory capability.
pub fn crt(
    k: &Kernel,
    root: &RawCap,
    cap_captbl: usize,
    cap_kmem: usize,
    cap_crt: usize,
    vaddr: usize,
    entry_count: usize,
) -> KernResult {
    check_entry_count(entry_count)?;

    let captbl_op = lookup(root, cap_captbl, CapType::Captbl)?;
    let kmem_op = lookup(root, cap_kmem, CapType::Kmem)?;
    cap_check(captbl_op, CaptblFlags::CRT.bits())?;
    crate::kernel::kmem_check(
        kmem_op,
        abi::KmemFlags::CAPTBL,
        vaddr,
        captbl_size(entry_count),
    )?;

    let dst = slot(captbl_op, one_level(cap_crt)?)?;
    occupy(dst)?;

    if k.kot.mark(vaddr, captbl_size(entry_count)).is_err() {
        retract(dst);
        return Err(Error::CapKotbl);
    }

    // Safety: the mark above gives us exclusive ownership of the range.
    unsafe { clear_table(vaddr, entry_count) };

    fill_captbl_cap(dst, vaddr, entry_count);
    publish(dst, CapType::Captbl);
    Ok(0)
}

/// Deletes a capability-table capability. The table must be frozen,
/// quiescent, unreferenced, a root, and empty.
pub fn del(k: &Kernel, root: &RawCap, cap_captbl: usize, cap_del: usize) -> KernResult {
    let captbl_op = lookup(root, cap_captbl, CapType::Captbl)?;
    cap_check(captbl_op, CaptblFlags::DEL.bits())?;

    let dst = slot(captbl_op, one_level(cap_del)?)?;
    let tr = destroy_check(k, dst, Some(CapType::Captbl), true)?;

    // A table still holding capabilities cannot die; the entry count is
    // user-controlled, so a user who wants bounded deletion keeps tables
    // small.
    let entry_count = entries(dst);
    for index in 0..entry_count {
        // Safety: range is in bounds by construction.
        let entry = unsafe { cap_at(dst.object() + index * core::mem::size_of::<RawCap>()) };
        if entry.type_ref().cap_type() != CapType::Nop {
            defrost(dst, tr);
            return Err(Error::CapExist);
        }
    }

    let object = dst.object();
    let size = captbl_size(entry_count);
    remdel(dst, tr)?;
    uassert!(k.kot.erase(object, size).is_ok());
    Ok(0)
}

/// Freezes a capability, stamping the quiescence baseline. The slot must be
/// live, unreferenced, and not already frozen.
pub fn frz(k: &Kernel, root: &RawCap, cap_captbl: usize, cap_frz: usize) -> KernResult {
    let captbl_op = lookup(root, cap_captbl, CapType::Captbl)?;
    cap_check(captbl_op, CaptblFlags::FRZ.bits())?;

    let dst = slot(captbl_op, one_level(cap_frz)?)?;
    let tr = dst.type_ref();
    if tr.cap_type() == CapType::Nop {
        return Err(Error::CapNull);
    }
    if tr.refs() != 0 {
        return Err(Error::CapRefcnt);
    }
    if tr.is_frozen() {
        return Err(Error::CapFrozen);
    }

    dst.set_timestamp(k.now());

    dst.type_ref
        .compare_exchange(
            tr.0,
            tr.0 | TypeRef::FROZEN,
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .map(|_| 0)
        .map_err(|_| Error::CapExist)
}

/// Delegates a capability: copies it into an empty destination slot with
/// narrowed authority and counts the delegation on the source.
///
/// `flags` is interpreted per source type: position range plus operation
/// byte for page tables, call range for kernel functions, a slot-granular
/// address range for kernel memory (whose create-mask arrives separately in
/// `ext_flags`), and a plain flag subset for everything else.
pub fn add(
    k: &Kernel,
    root: &RawCap,
    cap_captbl_dst: usize,
    cap_dst: usize,
    cap_captbl_src: usize,
    cap_src: usize,
    flags: usize,
    ext_flags: usize,
) -> KernResult {
    let captbl_dst = lookup(root, cap_captbl_dst, CapType::Captbl)?;
    let captbl_src = lookup(root, cap_captbl_src, CapType::Captbl)?;
    cap_check(captbl_dst, CaptblFlags::ADD_DST.bits())?;
    cap_check(captbl_src, CaptblFlags::ADD_SRC.bits())?;

    let dst = slot(captbl_dst, one_level(cap_dst)?)?;
    let src = slot(captbl_src, one_level(cap_src)?)?;

    let src_tr = src.type_ref();
    if src_tr.0 == 0 {
        return Err(Error::CapNull);
    }
    if src_tr.is_frozen() {
        return Err(Error::CapFrozen);
    }

    // Work out the narrowed flag word. Delegation may strip authority,
    // never add it.
    let src_flags = src.flags();
    let mut kmem_range = (0, 0);
    let narrowed = match src_tr.cap_type() {
        CapType::Pgtbl => {
            if abi::pgtbl_flag_high(flags) > abi::pgtbl_flag_high(src_flags)
                || abi::pgtbl_flag_low(flags) < abi::pgtbl_flag_low(src_flags)
                || abi::pgtbl_flag_high(flags) < abi::pgtbl_flag_low(flags)
            {
                return Err(Error::CapFlag);
            }
            let ops = abi::pgtbl_flag_ops(flags);
            if ops == 0 || ops & !abi::pgtbl_flag_ops(src_flags) != 0 {
                return Err(Error::CapFlag);
            }
            flags
        }
        CapType::Kern => {
            if abi::kern_flag_high(flags) > abi::kern_flag_high(src_flags)
                || abi::kern_flag_low(flags) < abi::kern_flag_low(src_flags)
                || abi::kern_flag_high(flags) < abi::kern_flag_low(flags)
            {
                return Err(Error::CapFlag);
            }
            flags
        }
        CapType::Kmem => {
            let (start, end) =
                abi::kmem_range_unpack(flags, crate::config::KOTBL_SLOT_ORDER);
            if end <= start {
                return Err(Error::CapFlag);
            }
            if src.info(0) > start || src.info(1) < end - 1 {
                return Err(Error::CapFlag);
            }
            if ext_flags == 0 || ext_flags & !src_flags != 0 {
                return Err(Error::CapFlag);
            }
            kmem_range = (start, end);
            ext_flags
        }
        _ => {
            if flags == 0 || flags & !src_flags != 0 {
                return Err(Error::CapFlag);
            }
            flags
        }
    };

    // The destination must be empty and must have aged out of any previous
    // occupant's quiescence window, so stale readers of the old capability
    // cannot be confused by the new one.
    if dst.type_ref.load(Ordering::Acquire) != 0 {
        return Err(Error::CapExist);
    }
    if !k.quiescent(dst.timestamp()) {
        return Err(Error::CapQuie);
    }

    occupy(dst)?;

    dst.set_flags(narrowed);
    dst.set_object(src.object());
    for i in 0..3 {
        dst.set_info(i, src.info(i));
    }
    if src_tr.cap_type() == CapType::Kmem {
        dst.set_info(0, kmem_range.0);
        dst.set_info(1, kmem_range.1 - 1);
    }
    dst.set_parent(src as *const RawCap as usize);

    if src.ref_inc().is_err() {
        retract(dst);
        return Err(Error::CapRefcnt);
    }

    publish(dst, src_tr.cap_type());
    Ok(0)
}

/// Removes a delegated capability, undoing an `add`. The slot must be
/// frozen, quiescent, unreferenced, and a child.
pub fn rem(k: &Kernel, root: &RawCap, cap_captbl: usize, cap_rem: usize) -> KernResult {
    let captbl_op = lookup(root, cap_captbl, CapType::Captbl)?;
    cap_check(captbl_op, CaptblFlags::REM.bits())?;

    let dst = slot(captbl_op, one_level(cap_rem)?)?;
    let tr = destroy_check(k, dst, None, false)?;
    let parent = dst.parent();
    remdel(dst, tr)?;

    // Safety: the child's existence kept the parent's refcount nonzero, so
    // the parent slot is still alive.
    unsafe { cap_at(parent) }.ref_dec();
    Ok(0)
}

/// Destroys an object capability slot after its module-specific checks
/// passed: clears the slot and erases the object's backing storage.
pub(crate) fn destroy_object(k: &Kernel, slot: &RawCap, tr: TypeRef, size: usize) -> KernResult<()> {
    let object = slot.object();
    remdel(slot, tr)?;
    uassert!(k.kot.erase(object, size).is_ok());
    Ok(())
}
