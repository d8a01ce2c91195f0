// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signal endpoints: counting, blockable notification channels.
//!
//! An endpoint is three words: a kernel reference count (interrupt sources
//! pin their endpoints), a pending-send counter, and at most one blocked
//! receiver. Senders either hand their signal directly to a blocked
//! receiver on the same core — possibly preempting the sender — or bump the
//! counter. Receivers drain the counter (one signal or all of them) or
//! block.
//!
//! A receiver may only ever block itself, on its own core; that is what
//! makes the single `thd` word sufficient and keeps cross-core interaction
//! confined to the CAS on `count` and `thd`.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{
    CapType, CaptblFlags, Error, KmemFlags, SigFlags, SigOption, ThdState, INIT_TIME, MAX_SIG_NUM,
};

use crate::arch::{self, RegFile};
use crate::captbl::{self, RawCap};
use crate::kernel::Kernel;
use crate::sched::{self, CpuLocal};
use crate::thread::Thread;
use crate::KernResult;

/// The signal-endpoint kernel object.
#[repr(C)]
pub struct SigEndpoint {
    /// Kernel interrupt sources referencing this endpoint. Nonzero pins the
    /// endpoint against deletion and is what entitles `kern_snd` to use it.
    refcnt: AtomicUsize,
    /// Pending sends not yet received.
    count: AtomicUsize,
    /// The blocked receiver, as a thread address, or zero.
    thd: AtomicUsize,
}

/// Size in bytes of a signal endpoint object.
pub const fn sig_size() -> usize {
    core::mem::size_of::<SigEndpoint>()
}

/// Views an endpoint object at a raw kernel address.
///
/// # Safety
///
/// `addr` must point at a live `SigEndpoint`.
pub(crate) unsafe fn sig_at(addr: usize) -> *mut SigEndpoint {
    addr as *mut SigEndpoint
}

impl SigEndpoint {
    /// Pending signal count. Test aid and diagnostics.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Clears the blocked-receiver word. Used when the receiver is torn
    /// away from the endpoint (scheduler free).
    pub(crate) fn clear_blocked(&self) {
        self.thd.store(0, Ordering::Relaxed);
    }

    /// Counts another kernel interrupt source on this endpoint.
    pub fn kernel_ref_inc(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    fn saturating_send(&self) -> KernResult<()> {
        if self.count.fetch_add(1, Ordering::AcqRel) >= MAX_SIG_NUM {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::SivFull);
        }
        Ok(())
    }
}

fn init_object(vaddr: usize, kernel_refs: usize) {
    // Safety: caller holds the fresh KOT mark over the object.
    unsafe {
        (vaddr as *mut SigEndpoint).write(SigEndpoint {
            refcnt: AtomicUsize::new(kernel_refs),
            count: AtomicUsize::new(0),
            thd: AtomicUsize::new(0),
        });
    }
}

/// Creates a kernel signal endpoint at boot: born with a kernel reference,
/// so interrupt plumbing may target it and nobody can delete it.
pub fn boot_crt(
    k: &Kernel,
    root: &RawCap,
    cap_captbl: usize,
    cap_sig: usize,
    vaddr: usize,
) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(captbl_op, CaptblFlags::CRT.bits())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_sig)?)?;
    captbl::occupy(dst)?;

    if k.kot.mark(vaddr, sig_size()).is_err() {
        captbl::retract(dst);
        return Err(Error::CapKotbl);
    }

    init_object(vaddr, 1);

    dst.set_parent(0);
    dst.set_object(vaddr);
    dst.set_flags(SigFlags::all().bits());
    captbl::publish(dst, CapType::Sig);
    Ok(0)
}

/// Creates a user signal endpoint.
pub fn crt(
    k: &Kernel,
    root: &RawCap,
    cap_captbl: usize,
    cap_kmem: usize,
    cap_sig: usize,
    vaddr: usize,
) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    let kmem_op = captbl::lookup(root, cap_kmem, CapType::Kmem)?;
    captbl::cap_check(captbl_op, CaptblFlags::CRT.bits())?;
    crate::kernel::kmem_check(kmem_op, KmemFlags::SIG, vaddr, sig_size())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_sig)?)?;
    captbl::occupy(dst)?;

    if k.kot.mark(vaddr, sig_size()).is_err() {
        captbl::retract(dst);
        return Err(Error::CapKotbl);
    }

    init_object(vaddr, 0);

    dst.set_parent(0);
    dst.set_object(vaddr);
    dst.set_flags(SigFlags::all().bits());
    captbl::publish(dst, CapType::Sig);
    Ok(0)
}

/// Deletes a signal endpoint. Refused while a kernel source references it
/// or a receiver is blocked on it.
pub fn del(k: &Kernel, root: &RawCap, cap_captbl: usize, cap_sig: usize) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(captbl_op, CaptblFlags::DEL.bits())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_sig)?)?;
    let tr = captbl::destroy_check(k, dst, Some(CapType::Sig), true)?;

    // Safety: frozen + quiescent slot; object still marked.
    let sig = unsafe { &*sig_at(dst.object()) };
    if sig.refcnt.load(Ordering::Relaxed) != 0 {
        captbl::defrost(dst, tr);
        return Err(Error::SivConflict);
    }
    if sig.thd.load(Ordering::Relaxed) != 0 {
        captbl::defrost(dst, tr);
        return Err(Error::SivAct);
    }

    captbl::destroy_object(k, dst, tr, sig_size())?;
    Ok(0)
}

/// The unblock half shared by user and kernel sends: wakes the blocked
/// receiver with a receive result of one signal and requeues it if it still
/// has time. Returns false if there was no receiver this core may wake.
///
/// # Safety
///
/// `sig` must be live; queue surgery happens only when the blocked thread
/// is bound to this core, which makes it ours.
unsafe fn try_unblock(cpu: &mut CpuLocal, sig: *mut SigEndpoint) -> Option<*mut Thread> {
    let thd = (*sig).thd.load(Ordering::Acquire) as *mut Thread;
    if thd.is_null() {
        return None;
    }
    // Only the receiver's own core may wake it; a sender elsewhere falls
    // back to the counter.
    if (*thd).sched.cpuid_bind.load(Ordering::Relaxed) != cpu.id {
        return None;
    }

    // The receiver blocked before it could learn how many signals it would
    // get; it always wakes with exactly one, because other cores may be
    // draining the counter concurrently.
    (*(*thd).cur_reg).reg.set_retval(1);
    (*thd).sched.signal = core::ptr::null_mut();

    if (*thd).sched.slices != 0 {
        (*thd).sched.state = ThdState::Ready;
        sched::run_ins(cpu, thd);
    } else {
        // Its budget was donated away while it slept; its parent was told
        // then, so the thread just parks.
        (*thd).sched.state = ThdState::Timeout;
    }

    (*sig).thd.store(0, Ordering::Release);
    Some(thd)
}

/// Sends to a signal endpoint from user level. May preempt the caller if
/// the wakened receiver outranks it.
pub fn snd(
    cpu: &mut CpuLocal,
    reg: &mut arch::SavedState,
    root: &RawCap,
    cap_sig: usize,
) -> KernResult<()> {
    let sig_op = captbl::lookup(root, cap_sig, CapType::Sig)?;
    captbl::cap_check(sig_op, SigFlags::SND.bits())?;

    // Safety: the capability holds the endpoint live.
    unsafe {
        let sig = sig_at(sig_op.object());
        reg.set_retval(0);

        if let Some(thd) = try_unblock(cpu, sig) {
            let cur = cpu.cur_thd;
            if (*thd).sched.state == ThdState::Ready
                && (*thd).sched.prio > (*cur).sched.prio
            {
                sched::run_switch(reg, cur, thd);
                (*cur).sched.state = ThdState::Ready;
                (*thd).sched.state = ThdState::Running;
                cpu.cur_thd = thd;
            }
        } else {
            (*sig).saturating_send()?;
        }
    }
    Ok(())
}

/// Sends to a kernel endpoint from interrupt context. Never context
/// switches; the handler runs `sched::kern_high` once after all its sends.
pub fn kern_snd(cpu: &mut CpuLocal, sig: *mut SigEndpoint) -> KernResult<()> {
    // A pure user endpoint cannot absorb kernel sends.
    // Safety: kernel endpoints are pinned by their refcnt.
    unsafe {
        if (*sig).refcnt.load(Ordering::Relaxed) == 0 {
            return Err(Error::SivConflict);
        }
        if try_unblock(cpu, sig).is_none() {
            (*sig).saturating_send()?;
        }
    }
    Ok(())
}

/// Receives from a signal endpoint.
pub fn rcv(
    cpu: &mut CpuLocal,
    reg: &mut arch::SavedState,
    root: &RawCap,
    cap_sig: usize,
    option: SigOption,
) -> KernResult<()> {
    let sig_op = captbl::lookup(root, cap_sig, CapType::Sig)?;
    let need = match option {
        SigOption::BlockSingle => SigFlags::RCV_BS,
        SigOption::BlockMulti => SigFlags::RCV_BM,
        SigOption::PollSingle => SigFlags::RCV_NS,
        SigOption::PollMulti => SigFlags::RCV_NM,
    };
    captbl::cap_check(sig_op, need.bits())?;

    // Safety: the capability holds the endpoint live; blocking only ever
    // parks the current thread on the current core.
    unsafe {
        let sig = sig_at(sig_op.object());

        // One blocked receiver at a time.
        if (*sig).thd.load(Ordering::Relaxed) != 0 {
            return Err(Error::SivAct);
        }

        let cur = cpu.cur_thd;
        // A running thread with no slices cannot exist.
        uassert!((*cur).sched.slices != 0);

        let pending = (*sig).count.load(Ordering::Relaxed);
        if pending > 0 {
            // Take one, or everything. CAS rather than fetch-sub: another
            // core may drain the counter to zero under us.
            let (newval, got) = match option {
                SigOption::BlockSingle | SigOption::PollSingle => (pending - 1, 1),
                SigOption::BlockMulti | SigOption::PollMulti => (0, pending),
            };
            if (*sig)
                .count
                .compare_exchange(pending, newval, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return Err(Error::SivConflict);
            }
            reg.set_retval(got as isize);
            return Ok(());
        }

        match option {
            SigOption::BlockSingle | SigOption::BlockMulti => {
                // A core must always have something to run; its boot thread
                // may poll, but never sleep.
                if (*cur).sched.slices == INIT_TIME {
                    return Err(Error::SivBoot);
                }
                if (*sig)
                    .thd
                    .compare_exchange(0, cur as usize, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    return Err(Error::SivConflict);
                }
                // No return value yet; the waking send provides it.
                (*cur).sched.state = ThdState::Blocked;
                (*cur).sched.signal = sig;
                sched::run_del(cpu, cur);
                let next = sched::pick_high(cpu);
                sched::run_switch(reg, cur, next);
                (*next).sched.state = ThdState::Running;
                cpu.cur_thd = next;
            }
            SigOption::PollSingle | SigOption::PollMulti => {
                reg.set_retval(0);
            }
        }
    }
    Ok(())
}
