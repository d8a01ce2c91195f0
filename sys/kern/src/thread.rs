// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threads: the minimal kernel-aware execution unit, and every operation on
//! one — creation, binding, priority, time donation, yield, and the
//! scheduler-notification channel between a thread and its scheduler.
//!
//! Time is a first-class resource here. A thread runs only while it holds
//! slices; slices move between threads solely by explicit donation, drain
//! one per tick, and two sentinels (`INF_TIME`, `INIT_TIME`) mark budgets
//! that never drain. When a thread runs dry it times out and its scheduler
//! parent hears about it exactly once, however many times the state has
//! changed since the last receive.

use core::mem::offset_of;
use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{
    CapType, CaptblFlags, Error, KmemFlags, ProcFlags, ThdFlags, ThdState, INF_TIME, INIT_TIME,
    MAX_TIME, THD_ARBITRARY, THD_UNBOUND, TID_FAULT_FLAG,
};

use crate::arch::{self, RegFile};
use crate::captbl::{self, RawCap};
use crate::config::MAX_PREEMPT_PRIO;
use crate::kernel::Kernel;
use crate::list::ListNode;
use crate::process::{self, Process};
use crate::sched::{self, CpuLocal};
use crate::sig::SigEndpoint;
use crate::KernResult;

/// Scheduling descriptor of a thread.
#[repr(C)]
pub struct ThdSched {
    /// Run-queue membership node.
    pub run: ListNode,
    /// Pending-notification node, linked into the parent's event list when
    /// this thread has an unreported state change.
    pub notif: ListNode,
    /// Head of the event list: children with pending notifications.
    pub event: ListNode,
    /// Thread ID.
    pub tid: usize,
    /// CPU this thread is bound to, or `THD_UNBOUND`. CAS-claimed by
    /// binding, which is why it is the one atomic field here.
    pub cpuid_bind: AtomicUsize,
    /// Remaining time slices, or a sentinel.
    pub slices: usize,
    pub state: ThdState,
    /// How many children name this thread as their scheduler.
    pub refcnt: usize,
    pub prio: usize,
    /// Upper bound on `prio`, fixed at creation.
    pub max_prio: usize,
    /// Endpoint this thread is blocked on, if any.
    pub signal: *mut SigEndpoint,
    /// Home process.
    pub proc: *mut Process,
    /// Scheduler parent, once bound.
    pub parent: *mut Thread,
}

/// A thread's register context: the port register file plus coprocessor
/// area.
#[repr(C)]
#[derive(Clone, Default)]
pub struct ThdRegs {
    pub reg: arch::SavedState,
    pub cop: arch::CopState,
}

/// The thread kernel object.
#[repr(C)]
pub struct Thread {
    pub sched: ThdSched,
    /// Where this thread's context is saved: normally `def_reg`, possibly a
    /// hypervisor-designated area after `hyp_set`.
    pub cur_reg: *mut ThdRegs,
    /// Default context storage.
    pub def_reg: ThdRegs,
    /// Invocation stack head; members are `Invocation` nodes.
    pub inv_stack: ListNode,
}

/// Size in bytes of a thread object.
pub const fn thd_size() -> usize {
    core::mem::size_of::<Thread>()
}

/// Views a thread object at a raw kernel address.
///
/// # Safety
///
/// `addr` must point at a live `Thread`.
pub(crate) unsafe fn thd_at(addr: usize) -> *mut Thread {
    addr as *mut Thread
}

pub(crate) unsafe fn run_node(thd: *mut Thread) -> *mut ListNode {
    core::ptr::addr_of_mut!((*thd).sched.run)
}

pub(crate) unsafe fn notif_node(thd: *mut Thread) -> *mut ListNode {
    core::ptr::addr_of_mut!((*thd).sched.notif)
}

pub(crate) unsafe fn event_head(thd: *mut Thread) -> *mut ListNode {
    core::ptr::addr_of_mut!((*thd).sched.event)
}

pub(crate) unsafe fn inv_stack_head(thd: *mut Thread) -> *mut ListNode {
    core::ptr::addr_of_mut!((*thd).inv_stack)
}

/// Recovers the thread embedding a run-queue node.
pub(crate) unsafe fn from_run(node: *mut ListNode) -> *mut Thread {
    (node as *mut u8).sub(offset_of!(Thread, sched) + offset_of!(ThdSched, run)) as *mut Thread
}

/// Recovers the thread embedding a notification node.
pub(crate) unsafe fn from_notif(node: *mut ListNode) -> *mut Thread {
    (node as *mut u8).sub(offset_of!(Thread, sched) + offset_of!(ThdSched, notif)) as *mut Thread
}

/// Writes a fresh thread object. Returns its TID.
unsafe fn init_thread(
    k: &Kernel,
    vaddr: usize,
    proc: *mut Process,
    max_prio: usize,
) -> usize {
    let tid = k.next_tid();
    let thd = vaddr as *mut Thread;
    thd.write(Thread {
        sched: ThdSched {
            run: ListNode::poisoned(),
            notif: ListNode::poisoned(),
            event: ListNode::poisoned(),
            tid,
            cpuid_bind: AtomicUsize::new(THD_UNBOUND),
            slices: 0,
            state: ThdState::Timeout,
            refcnt: 0,
            prio: 0,
            max_prio,
            signal: core::ptr::null_mut(),
            proc,
            parent: core::ptr::null_mut(),
        },
        cur_reg: core::ptr::null_mut(),
        def_reg: ThdRegs::default(),
        inv_stack: ListNode::poisoned(),
    });
    // Self-referential pieces only once the object is in place.
    (*thd).cur_reg = core::ptr::addr_of_mut!((*thd).def_reg);
    ListNode::init(run_node(thd));
    ListNode::init(notif_node(thd));
    ListNode::init(event_head(thd));
    ListNode::init(inv_stack_head(thd));
    tid
}

/// Creates a per-CPU boot thread: bound immediately, infinite budget, no
/// parent, and becomes the core's current thread. Returns its TID.
pub fn boot_crt(
    k: &Kernel,
    cpu: &mut CpuLocal,
    root: &RawCap,
    cap_captbl: usize,
    cap_thd: usize,
    cap_proc: usize,
    vaddr: usize,
    prio: usize,
) -> KernResult {
    if prio >= MAX_PREEMPT_PRIO {
        return Err(Error::PthPrio);
    }

    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    let proc_op = captbl::lookup(root, cap_proc, CapType::Proc)?;
    captbl::cap_check(captbl_op, CaptblFlags::CRT.bits())?;
    captbl::cap_check(proc_op, ProcFlags::THD.bits())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_thd)?)?;
    captbl::occupy(dst)?;

    if k.kot.mark(vaddr, thd_size()).is_err() {
        captbl::retract(dst);
        return Err(Error::CapKotbl);
    }

    // Safety: the fresh mark gives us the object range; the process
    // capability keeps the process alive while we reference it.
    let tid = unsafe {
        let proc = process::proc_at(proc_op.object()) as *const Process as *mut Process;
        let tid = init_thread(k, vaddr, proc, MAX_PREEMPT_PRIO - 1);
        let thd = thd_at(vaddr);
        (*thd).sched.refcnt = 1; // never freeable
        (*thd).sched.slices = INIT_TIME;
        (*thd).sched.state = ThdState::Running;
        (*thd).sched.prio = prio;
        (*thd).sched.cpuid_bind.store(cpu.id, Ordering::Relaxed);
        (*proc).ref_inc();

        sched::run_ins(cpu, thd);
        cpu.cur_thd = thd;
        tid
    };

    dst.set_parent(0);
    dst.set_object(vaddr);
    // Boot threads may parent, donate and yield, but can never be bound,
    // freed, blocked, or have their execution state replaced.
    dst.set_flags(
        (ThdFlags::SCHED_PRIO
            | ThdFlags::SCHED_PARENT
            | ThdFlags::SCHED_RCV
            | ThdFlags::SWT
            | ThdFlags::XFER_SRC
            | ThdFlags::XFER_DST)
            .bits(),
    );
    dst.set_info(0, tid);
    captbl::publish(dst, CapType::Thd);
    Ok(tid)
}

/// Creates a thread. It starts unbound, with no time and nothing to do.
/// Returns its TID.
pub fn crt(
    k: &Kernel,
    cpu: &mut CpuLocal,
    root: &RawCap,
    cap_captbl: usize,
    cap_kmem: usize,
    cap_thd: usize,
    cap_proc: usize,
    max_prio: usize,
    vaddr: usize,
) -> KernResult {
    // A thread can never create one mightier than itself.
    // Safety: the current thread is live by definition.
    if unsafe { (*cpu.cur_thd).sched.max_prio } < max_prio {
        return Err(Error::PthPrio);
    }

    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    let proc_op = captbl::lookup(root, cap_proc, CapType::Proc)?;
    let kmem_op = captbl::lookup(root, cap_kmem, CapType::Kmem)?;
    captbl::cap_check(captbl_op, CaptblFlags::CRT.bits())?;
    captbl::cap_check(proc_op, ProcFlags::THD.bits())?;
    crate::kernel::kmem_check(kmem_op, KmemFlags::THD, vaddr, thd_size())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_thd)?)?;
    captbl::occupy(dst)?;

    if k.kot.mark(vaddr, thd_size()).is_err() {
        captbl::retract(dst);
        return Err(Error::CapKotbl);
    }

    // Safety: as in `boot_crt`.
    let tid = unsafe {
        let proc = process::proc_at(proc_op.object()) as *const Process as *mut Process;
        let tid = init_thread(k, vaddr, proc, max_prio);
        (*proc).ref_inc();
        tid
    };

    dst.set_parent(0);
    dst.set_object(vaddr);
    dst.set_flags(ThdFlags::all().bits());
    dst.set_info(0, tid);
    captbl::publish(dst, CapType::Thd);
    Ok(tid)
}

/// Deletes a thread, which must be unbound. Any invocation ports left on
/// its stack are force-deactivated; that walk is as long as the user let
/// the stack grow.
pub fn del(k: &Kernel, root: &RawCap, cap_captbl: usize, cap_thd: usize) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(captbl_op, CaptblFlags::DEL.bits())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_thd)?)?;
    let tr = captbl::destroy_check(k, dst, Some(CapType::Thd), true)?;

    // Safety: frozen + quiescent slot; object still marked.
    unsafe {
        let thd = thd_at(dst.object());
        if (*thd).sched.cpuid_bind.load(Ordering::Relaxed) != THD_UNBOUND {
            captbl::defrost(dst, tr);
            return Err(Error::PthInvstate);
        }

        captbl::remdel(dst, tr)?;

        crate::inv::force_unwind(thd);
        (*(*thd).sched.proc).ref_dec();
        uassert!(k.kot.erase(thd as usize, thd_size()).is_ok());
    }
    Ok(0)
}

/// Sets a thread's entry point, stack and argument, and clears a pending
/// fault. With a zero entry or stack only the fault is cleared and the
/// thread resumes where it stopped.
pub fn exec_set(
    cpu: &CpuLocal,
    root: &RawCap,
    cap_thd: usize,
    entry: usize,
    stack: usize,
    param: usize,
) -> KernResult {
    let thd_op = captbl::lookup(root, cap_thd, CapType::Thd)?;
    captbl::cap_check(thd_op, ThdFlags::EXEC_SET.bits())?;

    // Safety: the capability holds the thread object live.
    unsafe {
        let thd = thd_at(thd_op.object());
        if (*thd).sched.cpuid_bind.load(Ordering::Relaxed) != cpu.id {
            return Err(Error::PthInvstate);
        }

        if (*thd).sched.state == ThdState::Fault {
            (*thd).sched.state = ThdState::Timeout;
        }

        if entry != 0 && stack != 0 {
            (*(*thd).cur_reg).reg.reinit(entry, stack, param);
            (*(*thd).cur_reg).cop = arch::CopState::default();
        }
    }
    Ok(0)
}

/// Redirects where a thread's context is saved: to a hypervisor-designated
/// kernel-accessible area, or back to the built-in storage when `kaddr` is
/// zero.
pub fn hyp_set(k: &Kernel, cpu: &CpuLocal, root: &RawCap, cap_thd: usize, kaddr: usize) -> KernResult {
    let thd_op = captbl::lookup(root, cap_thd, CapType::Thd)?;
    captbl::cap_check(thd_op, ThdFlags::HYP_SET.bits())?;

    // Safety: as in `exec_set`.
    unsafe {
        let thd = thd_at(thd_op.object());
        if (*thd).sched.cpuid_bind.load(Ordering::Relaxed) != cpu.id {
            return Err(Error::PthInvstate);
        }

        if kaddr == 0 {
            (*thd).cur_reg = core::ptr::addr_of_mut!((*thd).def_reg);
        } else {
            let aligned = kaddr % core::mem::align_of::<ThdRegs>() == 0;
            let end = kaddr.checked_add(core::mem::size_of::<ThdRegs>());
            if !aligned
                || kaddr < k.kot.base()
                || end.map(|e| e > k.kot.end()).unwrap_or(true)
            {
                return Err(Error::PthInvstate);
            }
            (*thd).cur_reg = kaddr as *mut ThdRegs;
        }
    }
    Ok(0)
}

/// Binds a thread under a scheduler parent on the current CPU. Binding is
/// the only transition out of "unbound", and it is claimed by CAS so two
/// cores cannot adopt the same thread.
pub fn sched_bind(
    cpu: &CpuLocal,
    root: &RawCap,
    cap_thd: usize,
    cap_thd_sched: usize,
    prio: usize,
) -> KernResult {
    let thd_op = captbl::lookup(root, cap_thd, CapType::Thd)?;
    let sched_op = captbl::lookup(root, cap_thd_sched, CapType::Thd)?;
    captbl::cap_check(thd_op, ThdFlags::SCHED_CHILD.bits())?;
    captbl::cap_check(sched_op, ThdFlags::SCHED_PARENT.bits())?;

    // Safety: both capabilities hold their objects live.
    unsafe {
        let thd = thd_at(thd_op.object());
        let parent = thd_at(sched_op.object());

        let old = (*thd).sched.cpuid_bind.load(Ordering::Relaxed);
        if old & THD_UNBOUND == 0 {
            return Err(Error::PthInvstate);
        }
        if (*parent).sched.cpuid_bind.load(Ordering::Relaxed) != cpu.id {
            return Err(Error::PthInvstate);
        }
        if thd == parent {
            return Err(Error::PthNotif);
        }
        if prio > (*parent).sched.max_prio || prio > (*thd).sched.max_prio {
            return Err(Error::PthPrio);
        }

        if (*thd)
            .sched
            .cpuid_bind
            .compare_exchange(old, cpu.id, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::PthConflict);
        }

        // Ours now; no other core can touch this thread.
        (*thd).sched.parent = parent;
        (*thd).sched.prio = prio;
        (*parent).sched.refcnt += 1;
    }
    Ok(0)
}

/// Changes a thread's priority, requeueing and rescheduling as needed.
pub fn sched_prio(
    cpu: &mut CpuLocal,
    reg: &mut arch::SavedState,
    root: &RawCap,
    cap_thd: usize,
    prio: usize,
) -> KernResult<()> {
    let thd_op = captbl::lookup(root, cap_thd, CapType::Thd)?;
    captbl::cap_check(thd_op, ThdFlags::SCHED_PRIO.bits())?;

    // Safety: the capability holds the thread live; queue surgery is
    // this-CPU-only.
    unsafe {
        let thd = thd_at(thd_op.object());
        if (*thd).sched.cpuid_bind.load(Ordering::Relaxed) != cpu.id {
            return Err(Error::PthInvstate);
        }
        if prio > (*thd).sched.max_prio {
            return Err(Error::PthPrio);
        }

        reg.set_retval(0);

        let state = (*thd).sched.state;
        if state == ThdState::Running || state == ThdState::Ready {
            sched::run_del(cpu, thd);
            (*thd).sched.prio = prio;
            sched::run_ins(cpu, thd);

            let high = sched::pick_high(cpu);
            if high != cpu.cur_thd {
                let cur = cpu.cur_thd;
                sched::run_switch(reg, cur, high);
                (*cur).sched.state = ThdState::Ready;
                (*high).sched.state = ThdState::Running;
                cpu.cur_thd = high;
            }
        } else {
            (*thd).sched.prio = prio;
        }
    }
    Ok(())
}

/// Unbinds a thread from this core, undoing `sched_bind`. A runnable thread
/// is dequeued; a blocked one is woken with `SivFree`; remaining slices are
/// forfeited.
pub fn sched_free(
    cpu: &mut CpuLocal,
    reg: &mut arch::SavedState,
    root: &RawCap,
    cap_thd: usize,
) -> KernResult<()> {
    let thd_op = captbl::lookup(root, cap_thd, CapType::Thd)?;
    captbl::cap_check(thd_op, ThdFlags::SCHED_FREE.bits())?;

    // Safety: the capability holds the thread live; this-CPU-only surgery.
    unsafe {
        let thd = thd_at(thd_op.object());
        let bind = (*thd).sched.cpuid_bind.load(Ordering::Relaxed);
        if bind & THD_UNBOUND != 0 || bind != cpu.id {
            return Err(Error::PthInvstate);
        }
        // A scheduler with children cannot leave. Boot threads sit at
        // refcnt 1 forever, so they can never pass this check.
        if (*thd).sched.refcnt != 0 {
            return Err(Error::PthRefcnt);
        }

        (*(*thd).sched.parent).sched.refcnt -= 1;
        (*thd).sched.parent = core::ptr::null_mut();

        // Retract any unreported notification.
        if !ListNode::is_detached(notif_node(thd)) {
            ListNode::detach(notif_node(thd));
        }

        reg.set_retval(0);

        match (*thd).sched.state {
            ThdState::Blocked => {
                // End the blocking; the thread is not current (it is
                // blocked), so this cannot clobber the caller's return.
                (*(*thd).cur_reg).reg.set_retval(Error::SivFree.code());
                (*(*thd).sched.signal).clear_blocked();
                (*thd).sched.signal = core::ptr::null_mut();
                (*thd).sched.state = ThdState::Timeout;
            }
            ThdState::Running | ThdState::Ready => {
                sched::run_del(cpu, thd);
                (*thd).sched.state = ThdState::Timeout;
            }
            // Timeout stays timeout; a fault is not cleared by unbinding.
            _ => {}
        }
        (*thd).sched.slices = 0;

        if cpu.cur_thd == thd {
            let next = sched::pick_high(cpu);
            (*next).sched.state = ThdState::Running;
            sched::run_switch(reg, thd, next);
            cpu.cur_thd = next;
        }

        // Release the binding last, so another core sees a fully unwound
        // thread.
        (*thd).sched.cpuid_bind.store(THD_UNBOUND, Ordering::Release);
    }
    Ok(())
}

/// Receives one pending scheduler notification: the TID of a child that
/// timed out, with the fault marker set if the child faulted instead.
pub fn sched_rcv(cpu: &CpuLocal, root: &RawCap, cap_thd: usize) -> KernResult {
    let thd_op = captbl::lookup(root, cap_thd, CapType::Thd)?;
    captbl::cap_check(thd_op, ThdFlags::SCHED_RCV.bits())?;

    // Safety: the capability holds the thread live; event-list surgery is
    // this-CPU-only.
    unsafe {
        let thd = thd_at(thd_op.object());
        if (*thd).sched.cpuid_bind.load(Ordering::Relaxed) != cpu.id {
            return Err(Error::PthInvstate);
        }

        if ListNode::is_detached(event_head(thd)) {
            return Err(Error::PthNotif);
        }

        let node = ListNode::first(event_head(thd));
        ListNode::detach(node);
        let child = from_notif(node);

        if (*child).sched.state == ThdState::Fault {
            Ok((*child).sched.tid | TID_FAULT_FLAG)
        } else {
            Ok((*child).sched.tid)
        }
    }
}

/// Donates time from one thread to another.
///
/// `time` selects the transfer kind: a finite amount moves up to that many
/// slices; `INF_TIME` moves everything (or confers infinity from an
/// infinite source); `INIT_TIME` additionally revokes an infinite source.
/// Boot budgets (`INIT_TIME`) are untouchable on both sides: transfers
/// against them succeed without effect.
pub fn time_xfer(
    cpu: &mut CpuLocal,
    reg: &mut arch::SavedState,
    root: &RawCap,
    cap_thd_dst: usize,
    cap_thd_src: usize,
    time: usize,
) -> KernResult<()> {
    if time == 0 {
        return Err(Error::PthInvstate);
    }

    let dst_op = captbl::lookup(root, cap_thd_dst, CapType::Thd)?;
    let src_op = captbl::lookup(root, cap_thd_src, CapType::Thd)?;
    captbl::cap_check(dst_op, ThdFlags::XFER_DST.bits())?;
    captbl::cap_check(src_op, ThdFlags::XFER_SRC.bits())?;

    // Safety: the capabilities hold both threads live; both are bound to
    // this CPU, so all state is ours.
    unsafe {
        let src = thd_at(src_op.object());
        let dst = thd_at(dst_op.object());

        if (*src).sched.cpuid_bind.load(Ordering::Relaxed) != cpu.id {
            return Err(Error::PthInvstate);
        }
        // No slices means timed out or blocked; nothing to give.
        if (*src).sched.slices == 0 {
            return Err(Error::PthInvstate);
        }
        if (*dst).sched.cpuid_bind.load(Ordering::Relaxed) != cpu.id {
            return Err(Error::PthInvstate);
        }
        if (*dst).sched.state == ThdState::Fault {
            return Err(Error::PthFault);
        }

        if src == dst {
            // Donating to oneself moves nothing; report the unchanged
            // budget.
            reg.set_retval((*dst).sched.slices as isize);
            return Ok(());
        }

        if (*src).sched.slices < INF_TIME {
            // Finite source.
            let avail = (*src).sched.slices;
            let xfer = if time >= INF_TIME { avail } else { time.min(avail) };
            if (*dst).sched.slices < INF_TIME {
                let sum = (*dst)
                    .sched
                    .slices
                    .checked_add(xfer)
                    .ok_or(Error::PthOverflow)?;
                if sum >= MAX_TIME {
                    return Err(Error::PthOverflow);
                }
                (*dst).sched.slices = sum;
            }
            (*src).sched.slices = avail - xfer;
        } else {
            // Infinite-class source.
            if time >= INF_TIME {
                if time == INIT_TIME && (*src).sched.slices != INIT_TIME {
                    // Revocation empties an infinite source; boot budgets
                    // are beyond revocation.
                    (*src).sched.slices = 0;
                }
                if (*dst).sched.slices < INF_TIME {
                    (*dst).sched.slices = INF_TIME;
                }
            } else if (*dst).sched.slices < INF_TIME {
                let sum = (*dst)
                    .sched
                    .slices
                    .checked_add(time)
                    .ok_or(Error::PthOverflow)?;
                if sum >= MAX_TIME {
                    return Err(Error::PthOverflow);
                }
                (*dst).sched.slices = sum;
            }
        }

        // A drained runnable source leaves the queue and its parent hears
        // about it. A drained blocked source is reported when it wakes.
        if (*src).sched.slices == 0 {
            let state = (*src).sched.state;
            if state == ThdState::Running || state == ThdState::Ready {
                sched::run_del(cpu, src);
                (*src).sched.state = ThdState::Timeout;
                sched::run_notif(src);
            }
        }

        reg.set_retval((*dst).sched.slices as isize);

        // A newly funded timed-out destination becomes runnable.
        if (*dst).sched.state == ThdState::Timeout {
            (*dst).sched.state = ThdState::Ready;
            sched::run_ins(cpu, dst);
        }

        let cur = cpu.cur_thd;
        if (*cur).sched.state == ThdState::Timeout {
            // The caller donated itself dry.
            let next = sched::pick_high(cpu);
            sched::run_switch(reg, cur, next);
            (*next).sched.state = ThdState::Running;
            cpu.cur_thd = next;
        } else if (*dst).sched.state == ThdState::Ready
            && (*dst).sched.prio > (*cur).sched.prio
        {
            // The destination now outranks us.
            sched::run_switch(reg, cur, dst);
            (*dst).sched.state = ThdState::Running;
            (*cur).sched.state = ThdState::Ready;
            cpu.cur_thd = dst;
        }
    }
    Ok(())
}

/// Yields to a specific same-priority thread, or (with the arbitrary
/// sentinel) to whatever the scheduler picks. A full yield forfeits every
/// remaining slice.
pub fn swt(
    cpu: &mut CpuLocal,
    reg: &mut arch::SavedState,
    root: &RawCap,
    cap_thd: usize,
    full_yield: bool,
) -> KernResult<()> {
    // Safety: current thread and any looked-up target are live; all queue
    // surgery is this-CPU-only.
    unsafe {
        let cur = cpu.cur_thd;
        let mut next;

        if cap_thd as isize != THD_ARBITRARY {
            let thd_op = captbl::lookup(root, cap_thd, CapType::Thd)?;
            captbl::cap_check(thd_op, ThdFlags::SWT.bits())?;
            next = thd_at(thd_op.object());

            if (*next).sched.cpuid_bind.load(Ordering::Relaxed) != cpu.id {
                return Err(Error::PthInvstate);
            }
            // A higher-priority thread would already be running, and a
            // lower-priority one would be preempted right back.
            if (*cur).sched.prio != (*next).sched.prio {
                return Err(Error::PthPrio);
            }
            match (*next).sched.state {
                ThdState::Blocked | ThdState::Timeout => return Err(Error::PthInvstate),
                ThdState::Fault => return Err(Error::PthFault),
                _ => {}
            }

            if full_yield && (*cur).sched.slices != INIT_TIME {
                sched::run_del(cpu, cur);
                (*cur).sched.slices = 0;
                (*cur).sched.state = ThdState::Timeout;
                sched::run_notif(cur);
                if cur == next {
                    next = sched::pick_high(cpu);
                }
            } else {
                (*cur).sched.state = ThdState::Ready;
            }
        } else {
            if full_yield && (*cur).sched.slices != INIT_TIME {
                sched::run_del(cpu, cur);
                (*cur).sched.slices = 0;
                (*cur).sched.state = ThdState::Timeout;
                sched::run_notif(cur);
            } else {
                // Rotate to the back of our priority list so equal-priority
                // peers actually take turns.
                sched::run_del(cpu, cur);
                sched::run_ins(cpu, cur);
                (*cur).sched.state = ThdState::Ready;
            }
            next = sched::pick_high(cpu);
        }

        reg.set_retval(0);

        (*next).sched.state = ThdState::Running;
        if cur == next {
            return Ok(());
        }
        sched::run_switch(reg, cur, next);
        cpu.cur_thd = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QUIE_TIME;
    use crate::startup::{
        test_env, BootEnv, BOOT_CAPTBL_SELF, BOOT_KMEM, BOOT_PROC, BOOT_THD_BASE,
    };
    use crate::syscalls;

    // Creates a thread in the boot process, binds it under the init thread
    // at `prio`, and returns its object. The caller decides about funding.
    fn spawn(env: &mut BootEnv, slot: usize, max_prio: usize, prio: usize) -> *mut Thread {
        let (k, root) = (env.kernel, env.root);
        let addr = env.alloc.take(thd_size()).unwrap();
        crt(
            k,
            env.cpu,
            root,
            BOOT_CAPTBL_SELF,
            BOOT_KMEM,
            slot,
            BOOT_PROC,
            max_prio,
            addr,
        )
        .unwrap();
        sched_bind(env.cpu, root, slot, BOOT_THD_BASE, prio).unwrap();
        unsafe { thd_at(addr) }
    }

    // Donates `slices` from the init thread; the recipient usually
    // preempts, so the current thread changes under the caller.
    fn fund(env: &mut BootEnv, reg: &mut arch::SavedState, slot: usize, slices: usize) {
        let root = env.root;
        time_xfer(env.cpu, reg, root, slot, BOOT_THD_BASE, slices).unwrap();
    }

    fn thaw(k: &Kernel) {
        for _ in 0..QUIE_TIME + 1 {
            k.advance_timestamp();
        }
    }

    #[test]
    fn created_thread_starts_inert() {
        let mut env = test_env(2048);
        let t = spawn(&mut env, 20, 10, 5);
        unsafe {
            assert_eq!((*t).sched.state, ThdState::Timeout);
            assert_eq!((*t).sched.slices, 0);
            assert_eq!(
                (*t).sched.cpuid_bind.load(Ordering::Relaxed),
                env.cpu.id,
                "binding should claim the current core"
            );
        }
        // Still inert: the scheduler must not have switched to it.
        assert_eq!(env.cpu.cur_thd, unsafe {
            thd_at(captbl::lookup(env.root, BOOT_THD_BASE, CapType::Thd)
                .unwrap()
                .object())
        });
    }

    #[test]
    fn binding_rules() {
        let mut env = test_env(2048);
        let root = env.root;
        spawn(&mut env, 20, 10, 5);

        // Already bound.
        assert_eq!(
            sched_bind(env.cpu, root, 20, BOOT_THD_BASE, 5),
            Err(Error::PthInvstate)
        );

        // Self-parenting and over-priority on a fresh thread.
        let addr = env.alloc.take(thd_size()).unwrap();
        crt(
            env.kernel,
            env.cpu,
            root,
            BOOT_CAPTBL_SELF,
            BOOT_KMEM,
            21,
            BOOT_PROC,
            4,
            addr,
        )
        .unwrap();
        assert_eq!(sched_bind(env.cpu, root, 21, 21, 4), Err(Error::PthInvstate));
        assert_eq!(
            sched_bind(env.cpu, root, 21, BOOT_THD_BASE, 5),
            Err(Error::PthPrio),
            "a thread cannot be bound above its own max priority"
        );
        sched_bind(env.cpu, root, 21, BOOT_THD_BASE, 3).unwrap();
    }

    #[test]
    fn donation_moves_and_preempts() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        let b = spawn(&mut env, 21, 10, 10);

        // Fund A; it preempts init (prio 5 > 0).
        fund(&mut env, &mut reg, 20, 100);
        assert_eq!(env.cpu.cur_thd, a);

        // A donates 60 to B; B preempts A.
        time_xfer(env.cpu, &mut reg, root, 21, 20, 60).unwrap();
        unsafe {
            assert_eq!((*a).sched.slices, 40);
            assert_eq!((*b).sched.slices, 60);
            assert_eq!((*a).sched.state, ThdState::Ready);
            assert_eq!((*b).sched.state, ThdState::Running);
        }
        assert_eq!(env.cpu.cur_thd, b);
    }

    #[test]
    fn donation_to_self_changes_nothing() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        fund(&mut env, &mut reg, 20, 100);
        assert_eq!(env.cpu.cur_thd, a);

        time_xfer(env.cpu, &mut reg, root, 20, 20, 30).unwrap();
        unsafe {
            assert_eq!((*a).sched.slices, 100);
        }
    }

    #[test]
    fn donating_everything_times_the_source_out() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        let b = spawn(&mut env, 21, 10, 5);
        fund(&mut env, &mut reg, 20, 10);
        assert_eq!(env.cpu.cur_thd, a);

        // A gives B more than it has: all 10 move, A times out, its parent
        // is notified, and the scheduler picks B (same priority, A gone).
        time_xfer(env.cpu, &mut reg, root, 21, 20, 50).unwrap();
        unsafe {
            assert_eq!((*a).sched.slices, 0);
            assert_eq!((*a).sched.state, ThdState::Timeout);
            assert_eq!((*b).sched.slices, 10);
        }
        assert_eq!(env.cpu.cur_thd, b);

        // The parent (init) hears about A exactly once.
        let tid_a = unsafe { (*a).sched.tid };
        assert_eq!(sched_rcv(env.cpu, root, BOOT_THD_BASE), Ok(tid_a));
        assert_eq!(
            sched_rcv(env.cpu, root, BOOT_THD_BASE),
            Err(Error::PthNotif)
        );
    }

    #[test]
    fn infinite_and_revoking_transfers() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);

        // INIT source, INF transfer: destination becomes infinite, source
        // untouched.
        time_xfer(env.cpu, &mut reg, root, 20, BOOT_THD_BASE, INF_TIME).unwrap();
        unsafe {
            assert_eq!((*a).sched.slices, INF_TIME);
        }
        let init = unsafe { thd_at(captbl::lookup(root, BOOT_THD_BASE, CapType::Thd).unwrap().object()) };
        unsafe {
            assert_eq!((*init).sched.slices, INIT_TIME);
        }

        // Revoking transfer from the infinite thread empties it; an INIT
        // source would have been immune.
        let b = spawn(&mut env, 21, 10, 4);
        assert_eq!(env.cpu.cur_thd, a);
        time_xfer(env.cpu, &mut reg, root, 21, 20, INIT_TIME).unwrap();
        unsafe {
            assert_eq!((*a).sched.slices, 0, "revocation empties an infinite source");
            assert_eq!((*a).sched.state, ThdState::Timeout);
            assert_eq!((*b).sched.slices, INF_TIME);
        }

        // Revocation aimed at the init thread is a successful no-op.
        assert_eq!(env.cpu.cur_thd, b);
        time_xfer(env.cpu, &mut reg, root, 21, BOOT_THD_BASE, INIT_TIME).unwrap();
        unsafe {
            assert_eq!((*init).sched.slices, INIT_TIME);
        }
    }

    #[test]
    fn donation_overflow_fails_without_effect() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        fund(&mut env, &mut reg, 20, MAX_TIME - 3);
        unsafe {
            assert_eq!((*a).sched.slices, MAX_TIME - 3);
        }
        // Another finite grant would cross the sentinel range.
        assert_eq!(
            time_xfer(env.cpu, &mut reg, root, 20, BOOT_THD_BASE, 10),
            Err(Error::PthOverflow)
        );
        unsafe {
            assert_eq!((*a).sched.slices, MAX_TIME - 3, "failed donation must not move time");
        }
    }

    #[test]
    fn yield_rotates_equal_priority_peers() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        let b = spawn(&mut env, 21, 10, 5);
        fund(&mut env, &mut reg, 20, 10);
        fund(&mut env, &mut reg, 21, 10);
        // A was funded first and still runs; B is behind it at prio 5.
        assert_eq!(env.cpu.cur_thd, a);

        swt(env.cpu, &mut reg, root, abi::THD_ARBITRARY as usize, false).unwrap();
        assert_eq!(env.cpu.cur_thd, b, "an arbitrary yield must rotate the list");

        // Directed yield back to A.
        swt(env.cpu, &mut reg, root, 20, false).unwrap();
        assert_eq!(env.cpu.cur_thd, a);

        // Yielding across priorities is refused.
        assert_eq!(
            swt(env.cpu, &mut reg, root, BOOT_THD_BASE, false),
            Err(Error::PthPrio)
        );
    }

    #[test]
    fn full_yield_forfeits_the_budget() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        fund(&mut env, &mut reg, 20, 10);
        assert_eq!(env.cpu.cur_thd, a);

        swt(env.cpu, &mut reg, root, abi::THD_ARBITRARY as usize, true).unwrap();
        unsafe {
            assert_eq!((*a).sched.slices, 0);
            assert_eq!((*a).sched.state, ThdState::Timeout);
        }
        // Control falls back to init, which is notified.
        let tid_a = unsafe { (*a).sched.tid };
        assert_eq!(sched_rcv(env.cpu, root, BOOT_THD_BASE), Ok(tid_a));
    }

    #[test]
    fn tick_drains_and_times_out() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        fund(&mut env, &mut reg, 20, 2);
        assert_eq!(env.cpu.cur_thd, a);

        syscalls::tick(env.kernel, env.cpu, &mut reg);
        unsafe {
            assert_eq!((*a).sched.slices, 1);
        }
        assert_eq!(env.cpu.cur_thd, a);

        syscalls::tick(env.kernel, env.cpu, &mut reg);
        unsafe {
            assert_eq!((*a).sched.slices, 0);
            assert_eq!((*a).sched.state, ThdState::Timeout);
        }
        // Init took over and can collect the timeout notification.
        let tid_a = unsafe { (*a).sched.tid };
        assert_eq!(sched_rcv(env.cpu, root, BOOT_THD_BASE), Ok(tid_a));
    }

    #[test]
    fn priority_change_requeues_and_reschedules() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        let b = spawn(&mut env, 21, 10, 6);
        fund(&mut env, &mut reg, 20, 10);
        fund(&mut env, &mut reg, 21, 10);
        assert_eq!(env.cpu.cur_thd, b);

        // Raising A above B hands the core to A.
        sched_prio(env.cpu, &mut reg, root, 20, 8).unwrap();
        assert_eq!(env.cpu.cur_thd, a);
        unsafe {
            assert_eq!((*b).sched.state, ThdState::Ready);
        }

        // Beyond the max priority is refused.
        assert_eq!(
            sched_prio(env.cpu, &mut reg, root, 20, 30),
            Err(Error::PthPrio)
        );
    }

    #[test]
    fn unbound_threads_die_bound_threads_do_not() {
        let mut env = test_env(2048);
        let (k, root) = (env.kernel, env.root);
        let addr = env.alloc.take(thd_size()).unwrap();
        crt(
            k,
            env.cpu,
            root,
            BOOT_CAPTBL_SELF,
            BOOT_KMEM,
            20,
            BOOT_PROC,
            5,
            addr,
        )
        .unwrap();

        // Bound thread in slot 21.
        spawn(&mut env, 21, 10, 5);
        captbl::frz(k, root, BOOT_CAPTBL_SELF, 21).unwrap();
        thaw(k);
        assert_eq!(del(k, root, BOOT_CAPTBL_SELF, 21), Err(Error::PthInvstate));

        // The unbound one deletes fine and releases its process reference.
        let proc_op = captbl::lookup(root, BOOT_PROC, CapType::Proc).unwrap();
        let before = unsafe { process::proc_at(proc_op.object()) }.refs();
        captbl::frz(k, root, BOOT_CAPTBL_SELF, 20).unwrap();
        thaw(k);
        del(k, root, BOOT_CAPTBL_SELF, 20).unwrap();
        let after = unsafe { process::proc_at(proc_op.object()) }.refs();
        assert_eq!(after, before - 1);
    }

    #[test]
    fn sched_free_unbinds_a_runnable_thread() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        fund(&mut env, &mut reg, 20, 10);
        assert_eq!(env.cpu.cur_thd, a);

        // Freeing the current thread forfeits its time and control.
        sched_free(env.cpu, &mut reg, root, 20).unwrap();
        unsafe {
            assert_eq!((*a).sched.slices, 0);
            assert_eq!((*a).sched.state, ThdState::Timeout);
            assert_eq!(
                (*a).sched.cpuid_bind.load(Ordering::Relaxed),
                abi::THD_UNBOUND
            );
        }
        let init = unsafe { thd_at(captbl::lookup(root, BOOT_THD_BASE, CapType::Thd).unwrap().object()) };
        assert_eq!(env.cpu.cur_thd, init);

        // Now unbound, it may be rebound elsewhere or deleted.
        sched_bind(env.cpu, root, 20, BOOT_THD_BASE, 7).unwrap();
    }

    #[test]
    fn exec_set_clears_a_fault() {
        let mut env = test_env(2048);
        let root = env.root;
        let a = spawn(&mut env, 20, 10, 5);
        unsafe {
            (*a).sched.state = ThdState::Fault;
        }
        exec_set(env.cpu, root, 20, 0x4000, 0x8000, 7).unwrap();
        unsafe {
            assert_eq!((*a).sched.state, ThdState::Timeout);
            assert_eq!((*(*a).cur_reg).reg.pc, 0x4000);
            assert_eq!((*(*a).cur_reg).reg.args[0], 7);
        }
    }

    #[test]
    fn hyp_set_redirects_the_register_area() {
        let mut env = test_env(2048);
        let (k, root) = (env.kernel, env.root);
        let a = spawn(&mut env, 20, 10, 5);

        let area = env.alloc.take(core::mem::size_of::<ThdRegs>()).unwrap();
        hyp_set(k, env.cpu, root, 20, area).unwrap();
        unsafe {
            assert_eq!((*a).cur_reg as usize, area);
        }
        // Back to the built-in storage.
        hyp_set(k, env.cpu, root, 20, 0).unwrap();
        unsafe {
            assert_eq!(
                (*a).cur_reg,
                core::ptr::addr_of_mut!((*a).def_reg),
                "zero address must restore the default save area"
            );
        }
        // Outside the kernel region is refused.
        assert_eq!(
            hyp_set(k, env.cpu, root, 20, 0x10),
            Err(Error::PthInvstate)
        );
    }
}
