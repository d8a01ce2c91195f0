// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Processes: protection domains binding a capability space to an address
//! space.
//!
//! A process object is small: counted references to one capability-table
//! capability and one page-table capability, plus its own reference count,
//! which counts the threads and invocation ports executing inside the
//! domain. The object refcount is what keeps a process alive while anything
//! can still run in it; the capability refcounts are what keep the two
//! tables alive while the process names them.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{CapType, CaptblFlags, Error, KmemFlags, PgtblFlags, ProcFlags};

use crate::captbl::{self, RawCap};
use crate::kernel::Kernel;
use crate::pgtbl;
use crate::KernResult;

/// The process kernel object.
#[repr(C)]
pub struct Process {
    /// Threads and invocation ports bound to this process.
    refcnt: AtomicUsize,
    /// Address of the capability-table capability this process uses.
    captbl: AtomicUsize,
    /// Address of the page-table capability this process uses.
    pgtbl: AtomicUsize,
}

/// Size in bytes of a process object.
pub const fn proc_size() -> usize {
    core::mem::size_of::<Process>()
}

/// Views a process object at a raw kernel address.
///
/// # Safety
///
/// `addr` must point at a live `Process`; its own refcount plus the
/// capability deletion protocol keep it that way for addresses taken out of
/// published capabilities.
pub(crate) unsafe fn proc_at<'a>(addr: usize) -> &'a Process {
    &*(addr as *const Process)
}

impl Process {
    /// The capability-table capability of this process.
    pub fn captbl_cap(&self) -> &RawCap {
        // Safety: the process holds a counted reference on the capability.
        unsafe { captbl::cap_at(self.captbl.load(Ordering::Relaxed)) }
    }

    /// The page-table capability of this process.
    pub fn pgtbl_cap(&self) -> &RawCap {
        // Safety: as for `captbl_cap`.
        unsafe { captbl::cap_at(self.pgtbl.load(Ordering::Relaxed)) }
    }

    /// The page-table object anchoring this process's address space.
    pub fn pgtbl_obj(&self) -> usize {
        self.pgtbl_cap().object()
    }

    pub(crate) fn ref_inc(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn ref_dec(&self) {
        let old = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        uassert!(old != 0);
    }

    pub fn refs(&self) -> usize {
        self.refcnt.load(Ordering::Relaxed)
    }
}

fn fill(
    proc_slot: &RawCap,
    vaddr: usize,
    captbl_op: &RawCap,
    pgtbl_op: &RawCap,
) -> KernResult<()> {
    // The address space root must be a top-level table, or it could never
    // be installed.
    if pgtbl_op.info(1) & pgtbl::TOP_FLAG == 0 {
        return Err(Error::PgtAddr);
    }

    // Safety: caller holds the fresh KOT mark over `vaddr`.
    let obj = vaddr as *mut Process;
    unsafe {
        obj.write(Process {
            refcnt: AtomicUsize::new(0),
            captbl: AtomicUsize::new(captbl_op as *const RawCap as usize),
            pgtbl: AtomicUsize::new(pgtbl_op as *const RawCap as usize),
        });
    }

    // Count the process's use of both tables. Either bump can saturate, in
    // which case everything backs out.
    captbl_op.ref_inc()?;
    if pgtbl_op.ref_inc().is_err() {
        captbl_op.ref_dec();
        return Err(Error::CapRefcnt);
    }

    proc_slot.set_parent(0);
    proc_slot.set_object(vaddr);
    proc_slot.set_flags(ProcFlags::all().bits());
    Ok(())
}

/// Creates a process without a kernel-memory capability. Boot only.
pub fn boot_crt(
    k: &Kernel,
    root: &RawCap,
    cap_captbl_crt: usize,
    cap_proc: usize,
    cap_captbl: usize,
    cap_pgtbl: usize,
    vaddr: usize,
) -> KernResult {
    let captbl_crt = captbl::lookup(root, cap_captbl_crt, CapType::Captbl)?;
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    let pgtbl_op = captbl::lookup(root, cap_pgtbl, CapType::Pgtbl)?;
    captbl::cap_check(captbl_crt, CaptblFlags::CRT.bits())?;
    captbl::cap_check(captbl_op, CaptblFlags::PROC_CRT.bits())?;
    captbl::cap_check(pgtbl_op, PgtblFlags::PROC_CRT.bits())?;

    let dst = captbl::slot(captbl_crt, captbl::one_level(cap_proc)?)?;
    captbl::occupy(dst)?;

    if k.kot.mark(vaddr, proc_size()).is_err() {
        captbl::retract(dst);
        return Err(Error::CapKotbl);
    }

    if let Err(e) = fill(dst, vaddr, captbl_op, pgtbl_op) {
        uassert!(k.kot.erase(vaddr, proc_size()).is_ok());
        captbl::retract(dst);
        return Err(e);
    }
    captbl::publish(dst, CapType::Proc);
    Ok(0)
}

/// Creates a process, with the backing storage authorized by a
/// kernel-memory capability.
pub fn crt(
    k: &Kernel,
    root: &RawCap,
    cap_captbl_crt: usize,
    cap_kmem: usize,
    cap_proc: usize,
    cap_captbl: usize,
    cap_pgtbl: usize,
    vaddr: usize,
) -> KernResult {
    let captbl_crt = captbl::lookup(root, cap_captbl_crt, CapType::Captbl)?;
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    let pgtbl_op = captbl::lookup(root, cap_pgtbl, CapType::Pgtbl)?;
    let kmem_op = captbl::lookup(root, cap_kmem, CapType::Kmem)?;
    captbl::cap_check(captbl_crt, CaptblFlags::CRT.bits())?;
    captbl::cap_check(captbl_op, CaptblFlags::PROC_CRT.bits())?;
    captbl::cap_check(pgtbl_op, PgtblFlags::PROC_CRT.bits())?;
    crate::kernel::kmem_check(kmem_op, KmemFlags::PROC, vaddr, proc_size())?;

    let dst = captbl::slot(captbl_crt, captbl::one_level(cap_proc)?)?;
    captbl::occupy(dst)?;

    if k.kot.mark(vaddr, proc_size()).is_err() {
        captbl::retract(dst);
        return Err(Error::CapKotbl);
    }

    if let Err(e) = fill(dst, vaddr, captbl_op, pgtbl_op) {
        uassert!(k.kot.erase(vaddr, proc_size()).is_ok());
        captbl::retract(dst);
        return Err(e);
    }
    captbl::publish(dst, CapType::Proc);
    Ok(0)
}

/// Deletes a process. Refused while any thread or invocation port still
/// binds to it.
pub fn del(k: &Kernel, root: &RawCap, cap_captbl: usize, cap_proc: usize) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(captbl_op, CaptblFlags::DEL.bits())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_proc)?)?;
    let tr = captbl::destroy_check(k, dst, Some(CapType::Proc), true)?;

    // Safety: the slot is frozen and was just validated; the object is
    // still marked.
    let proc = unsafe { proc_at(dst.object()) };
    if proc.refs() != 0 {
        captbl::defrost(dst, tr);
        return Err(Error::PthRefcnt);
    }

    let captbl_cap = proc.captbl_cap();
    let pgtbl_cap = proc.pgtbl_cap();
    captbl::destroy_object(k, dst, tr, proc_size())?;
    captbl_cap.ref_dec();
    pgtbl_cap.ref_dec();
    Ok(0)
}

/// Replaces a process's capability table.
pub fn cpt(root: &RawCap, cap_proc: usize, cap_captbl: usize) -> KernResult {
    let proc_op = captbl::lookup(root, cap_proc, CapType::Proc)?;
    let captbl_new = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(proc_op, ProcFlags::CPT.bits())?;
    captbl::cap_check(captbl_new, CaptblFlags::PROC_CPT.bits())?;

    // Reference the new table first; that way a failure leaves nothing to
    // undo.
    captbl_new.ref_inc()?;

    // Safety: the process capability we resolved holds the object live.
    let proc = unsafe { proc_at(proc_op.object()) };
    let old = proc.captbl.load(Ordering::Relaxed);
    if proc
        .captbl
        .compare_exchange(
            old,
            captbl_new as *const RawCap as usize,
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .is_err()
    {
        captbl_new.ref_dec();
        return Err(Error::PthConflict);
    }
    // Safety: `old` was a counted reference until this decrement.
    unsafe { captbl::cap_at(old) }.ref_dec();
    Ok(0)
}

/// Replaces a process's page table.
pub fn pgt(root: &RawCap, cap_proc: usize, cap_pgtbl: usize) -> KernResult {
    let proc_op = captbl::lookup(root, cap_proc, CapType::Proc)?;
    let pgtbl_new = captbl::lookup(root, cap_pgtbl, CapType::Pgtbl)?;
    captbl::cap_check(proc_op, ProcFlags::PGT.bits())?;
    captbl::cap_check(pgtbl_new, PgtblFlags::PROC_PGT.bits())?;
    if pgtbl_new.info(1) & pgtbl::TOP_FLAG == 0 {
        return Err(Error::PgtAddr);
    }

    pgtbl_new.ref_inc()?;

    // Safety: as in `cpt`.
    let proc = unsafe { proc_at(proc_op.object()) };
    let old = proc.pgtbl.load(Ordering::Relaxed);
    if proc
        .pgtbl
        .compare_exchange(
            old,
            pgtbl_new as *const RawCap as usize,
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .is_err()
    {
        pgtbl_new.ref_dec();
        return Err(Error::PthConflict);
    }
    // Safety: `old` was a counted reference until this decrement.
    unsafe { captbl::cap_at(old) }.ref_dec();
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QUIE_TIME;
    use crate::startup::{boot_captbl, test_kernel, BOOT_CAPTBL_SELF};

    fn setup() -> (&'static Kernel, &'static RawCap) {
        let k = test_kernel(256);
        let root = boot_captbl(k, 16).unwrap();
        // Slot 1: a top-level page table.
        pgtbl::boot_crt(k, root, BOOT_CAPTBL_SELF, 1, k.kot.base() + 0x4000, 0, true, 16, 4)
            .unwrap();
        (k, root)
    }

    fn thaw(k: &Kernel) {
        for _ in 0..QUIE_TIME + 1 {
            k.advance_timestamp();
        }
    }

    #[test]
    fn create_references_both_tables() {
        let (k, root) = setup();
        boot_crt(k, root, BOOT_CAPTBL_SELF, 2, BOOT_CAPTBL_SELF, 1, k.kot.base() + 0x5000)
            .unwrap();

        let captbl_cap = captbl::lookup(root, BOOT_CAPTBL_SELF, CapType::Captbl).unwrap();
        let pgtbl_cap = captbl::lookup(root, 1, CapType::Pgtbl).unwrap();
        assert_eq!(captbl_cap.type_ref().refs(), 1);
        assert_eq!(pgtbl_cap.type_ref().refs(), 1);

        // The referenced tables cannot be frozen out from under the
        // process.
        assert_eq!(
            captbl::frz(k, root, BOOT_CAPTBL_SELF, 1).unwrap_err(),
            Error::CapRefcnt
        );
    }

    #[test]
    fn non_top_pgtbl_is_refused() {
        let (k, root) = setup();
        pgtbl::boot_crt(
            k,
            root,
            BOOT_CAPTBL_SELF,
            3,
            k.kot.base() + 0x6000,
            0,
            false,
            12,
            4,
        )
        .unwrap();
        assert_eq!(
            boot_crt(k, root, BOOT_CAPTBL_SELF, 2, BOOT_CAPTBL_SELF, 3, k.kot.base() + 0x5000),
            Err(Error::PgtAddr)
        );
    }

    #[test]
    fn delete_releases_table_references() {
        let (k, root) = setup();
        boot_crt(k, root, BOOT_CAPTBL_SELF, 2, BOOT_CAPTBL_SELF, 1, k.kot.base() + 0x5000)
            .unwrap();

        captbl::frz(k, root, BOOT_CAPTBL_SELF, 2).unwrap();
        thaw(k);
        del(k, root, BOOT_CAPTBL_SELF, 2).unwrap();

        let pgtbl_cap = captbl::lookup(root, 1, CapType::Pgtbl).unwrap();
        assert_eq!(pgtbl_cap.type_ref().refs(), 0);
        assert!(!k.kot.is_marked(k.kot.base() + 0x5000, proc_size()));
    }

    #[test]
    fn pgt_swap_moves_the_reference() {
        let (k, root) = setup();
        boot_crt(k, root, BOOT_CAPTBL_SELF, 2, BOOT_CAPTBL_SELF, 1, k.kot.base() + 0x5000)
            .unwrap();
        // A second top-level table in slot 3.
        pgtbl::boot_crt(k, root, BOOT_CAPTBL_SELF, 3, k.kot.base() + 0x6000, 0, true, 16, 4)
            .unwrap();

        pgt(root, 2, 3).unwrap();

        let old = captbl::lookup(root, 1, CapType::Pgtbl).unwrap();
        let new = captbl::lookup(root, 3, CapType::Pgtbl).unwrap();
        assert_eq!(old.type_ref().refs(), 0);
        assert_eq!(new.type_ref().refs(), 1);

        let proc_cap = captbl::lookup(root, 2, CapType::Proc).unwrap();
        let proc = unsafe { proc_at(proc_cap.object()) };
        assert_eq!(proc.pgtbl_obj(), new.object());
    }
}
