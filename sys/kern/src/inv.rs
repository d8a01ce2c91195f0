// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous invocation: migrating-thread calls into another process.
//!
//! An invocation port names a process, an entry point and a stack.
//! Activating it pushes the port onto the calling thread's invocation
//! stack, preserves just enough caller state to come back (PC and SP, plus
//! the coprocessor slice), and re-aims the thread into the callee's
//! protection domain. Returning pops the stack and lands the caller exactly
//! where it left, with the callee's return value in the second argument
//! slot.
//!
//! The `active` word is the reentry guard: a port can host one call at a
//! time, and can be neither deleted nor re-entered while a call is in
//! flight. Fault returns are a policy decision made at `set` time; a port
//! that forbids them leaves a faulting callee to the fault path instead.

use core::mem::offset_of;
use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{CapType, CaptblFlags, Error, InvFlags, KmemFlags, ProcFlags};

use crate::arch::{self, RegFile};
use crate::captbl::{self, RawCap};
use crate::kernel::Kernel;
use crate::list::ListNode;
use crate::pgtbl;
use crate::process::{self, Process};
use crate::sched::CpuLocal;
use crate::thread::{self, Thread};
use crate::KernResult;

/// The invocation-port kernel object.
#[repr(C)]
pub struct Invocation {
    /// Stack membership node; the thread's invocation stack links through
    /// here.
    pub node: ListNode,
    /// The process invoked into.
    pub proc: *mut Process,
    /// Reentry and deletion guard.
    pub active: AtomicUsize,
    /// Callee entry point.
    pub entry: usize,
    /// Callee stack pointer.
    pub stack: usize,
    /// Whether a faulting callee returns to the caller with an error,
    /// rather than going down the fault path.
    pub fault_ret: usize,
    /// Preserved caller slice.
    pub ret: arch::InvState,
    /// Preserved caller coprocessor slice.
    pub cop: arch::CopState,
}

/// Size in bytes of an invocation port object.
pub const fn inv_size() -> usize {
    core::mem::size_of::<Invocation>()
}

/// Recovers the invocation embedding a stack node.
pub(crate) unsafe fn from_node(node: *mut ListNode) -> *mut Invocation {
    (node as *mut u8).sub(offset_of!(Invocation, node)) as *mut Invocation
}

/// The port at the top of `thd`'s invocation stack, or null.
///
/// # Safety
///
/// `thd` must be live with an initialized invocation stack.
pub(crate) unsafe fn stack_top(thd: *mut Thread) -> *mut Invocation {
    let head = thread::inv_stack_head(thd);
    let first = ListNode::first(head);
    if first == head {
        core::ptr::null_mut()
    } else {
        from_node(first)
    }
}

/// Force-pops every port off a dying thread's stack, deactivating each.
/// Runs as long as the stack is deep; bounding that is the user's problem.
///
/// # Safety
///
/// `thd` must be live and off every core (unbound), so nothing else walks
/// the stack.
pub(crate) unsafe fn force_unwind(thd: *mut Thread) {
    loop {
        let top = stack_top(thd);
        if top.is_null() {
            break;
        }
        ListNode::detach(core::ptr::addr_of_mut!((*top).node));
        (*top).active.store(0, Ordering::Release);
    }
}

/// Creates an invocation port into `cap_proc`.
pub fn crt(
    k: &Kernel,
    root: &RawCap,
    cap_captbl: usize,
    cap_kmem: usize,
    cap_inv: usize,
    cap_proc: usize,
    vaddr: usize,
) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    let proc_op = captbl::lookup(root, cap_proc, CapType::Proc)?;
    let kmem_op = captbl::lookup(root, cap_kmem, CapType::Kmem)?;
    captbl::cap_check(captbl_op, CaptblFlags::CRT.bits())?;
    captbl::cap_check(proc_op, ProcFlags::INV.bits())?;
    crate::kernel::kmem_check(kmem_op, KmemFlags::INV, vaddr, inv_size())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_inv)?)?;
    captbl::occupy(dst)?;

    if k.kot.mark(vaddr, inv_size()).is_err() {
        captbl::retract(dst);
        return Err(Error::CapKotbl);
    }

    // Safety: the fresh mark gives us the object range; the process
    // capability keeps the process alive while we reference it.
    unsafe {
        let proc = process::proc_at(proc_op.object()) as *const Process as *mut Process;
        let obj = vaddr as *mut Invocation;
        obj.write(Invocation {
            node: ListNode::poisoned(),
            proc,
            active: AtomicUsize::new(0),
            entry: 0,
            stack: 0,
            fault_ret: 0,
            ret: arch::InvState::default(),
            cop: arch::CopState::default(),
        });
        ListNode::init(core::ptr::addr_of_mut!((*obj).node));
        (*proc).ref_inc();
    }

    dst.set_parent(0);
    dst.set_object(vaddr);
    dst.set_flags(InvFlags::all().bits());
    captbl::publish(dst, CapType::Inv);
    Ok(0)
}

/// Deletes an invocation port. Refused while a call is in flight.
pub fn del(k: &Kernel, root: &RawCap, cap_captbl: usize, cap_inv: usize) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(captbl_op, CaptblFlags::DEL.bits())?;

    let dst = captbl::slot(captbl_op, captbl::one_level(cap_inv)?)?;
    let tr = captbl::destroy_check(k, dst, Some(CapType::Inv), true)?;

    // Safety: frozen + quiescent slot; object still marked.
    unsafe {
        let obj = dst.object() as *mut Invocation;
        if (*obj).active.load(Ordering::Acquire) != 0 {
            captbl::defrost(dst, tr);
            return Err(Error::SivAct);
        }
        let proc = (*obj).proc;
        captbl::destroy_object(k, dst, tr, inv_size())?;
        (*proc).ref_dec();
    }
    Ok(0)
}

/// Sets a port's entry point, stack, and fault-return policy. Allowed even
/// while the port is active; the change affects the next activation.
pub fn set(
    root: &RawCap,
    cap_inv: usize,
    entry: usize,
    stack: usize,
    fault_ret: usize,
) -> KernResult {
    let inv_op = captbl::lookup(root, cap_inv, CapType::Inv)?;
    captbl::cap_check(inv_op, InvFlags::SET.bits())?;

    // Safety: the capability holds the object live.
    unsafe {
        let obj = inv_op.object() as *mut Invocation;
        (*obj).entry = entry;
        (*obj).stack = stack;
        (*obj).fault_ret = fault_ret;
    }
    Ok(0)
}

/// Activates an invocation: the fast-path synchronous call. The syscall's
/// return value is written by the matching `ret`, in the caller's restored
/// context.
pub fn act(
    cpu: &mut CpuLocal,
    reg: &mut arch::SavedState,
    root: &RawCap,
    cap_inv: usize,
    param: usize,
) -> KernResult<()> {
    let inv_op = captbl::lookup(root, cap_inv, CapType::Inv)?;
    captbl::cap_check(inv_op, InvFlags::ACT.bits())?;

    // Safety: the capability holds the port live; the port's process
    // reference holds the callee process live.
    unsafe {
        let obj = inv_op.object() as *mut Invocation;
        if (*obj)
            .active
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::SivAct);
        }

        // Preserve the way back, push, and re-aim the thread into the
        // callee.
        arch::inv_save(&mut (*obj).ret, reg);
        arch::cop_save(reg, &mut (*obj).cop);

        let thd = cpu.cur_thd;
        ListNode::push_front(
            core::ptr::addr_of_mut!((*obj).node),
            thread::inv_stack_head(thd),
        );

        reg.reinit((*obj).entry, (*obj).stack, param);

        // Synchronous invocation exists to cross protection domains; switch
        // unconditionally.
        pgtbl::set((*(*obj).proc).pgtbl_obj());
    }
    Ok(())
}

/// Returns from the top invocation. On a fault return the caller sees
/// `SivFault` as the invocation's result; a normal return delivers zero
/// plus `retval` in the second argument slot.
pub fn ret(
    cpu: &mut CpuLocal,
    reg: &mut arch::SavedState,
    retval: usize,
    fault: bool,
) -> KernResult<()> {
    // Safety: the current thread is live; ports on its stack are pinned by
    // their active state.
    unsafe {
        let thd = cpu.cur_thd;
        let top = stack_top(thd);
        if top.is_null() {
            return Err(Error::SivEmpty);
        }
        if fault && (*top).fault_ret == 0 {
            return Err(Error::SivFault);
        }

        ListNode::detach(core::ptr::addr_of_mut!((*top).node));

        arch::inv_restore(reg, &(*top).ret);
        arch::cop_restore(reg, &(*top).cop);
        reg.set_inv_retval(retval as isize);

        // The caller's context is rebuilt; only now may the port admit the
        // next call.
        (*top).active.store(0, Ordering::Release);

        reg.set_retval(if fault { Error::SivFault.code() } else { 0 });

        // Land in the protection domain below the popped frame.
        let below = stack_top(thd);
        if below.is_null() {
            pgtbl::set((*(*thd).sched.proc).pgtbl_obj());
        } else {
            pgtbl::set((*(*below).proc).pgtbl_obj());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::WORD_BITS;
    use crate::startup::{
        test_env, BootEnv, BOOT_CAPTBL_SELF, BOOT_KMEM, BOOT_PGTBL,
    };

    // Builds a second process with its own top-level page table, and an
    // invocation port into it. Returns (pgtbl2 object, port object).
    fn callee(env: &mut BootEnv, pg_slot: usize, proc_slot: usize, inv_slot: usize)
        -> (usize, *mut Invocation)
    {
        let (k, root) = (env.kernel, env.root);
        let pg_addr = env.alloc.take(pgtbl::pgtbl_size(8, true)).unwrap();
        pgtbl::boot_crt(
            k,
            root,
            BOOT_CAPTBL_SELF,
            pg_slot,
            pg_addr,
            0,
            true,
            WORD_BITS - 8,
            8,
        )
        .unwrap();
        let proc_addr = env.alloc.take(process::proc_size()).unwrap();
        process::crt(
            k,
            root,
            BOOT_CAPTBL_SELF,
            BOOT_KMEM,
            proc_slot,
            BOOT_CAPTBL_SELF,
            pg_slot,
            proc_addr,
        )
        .unwrap();
        let inv_addr = env.alloc.take(inv_size()).unwrap();
        crt(
            k,
            root,
            BOOT_CAPTBL_SELF,
            BOOT_KMEM,
            inv_slot,
            proc_slot,
            inv_addr,
        )
        .unwrap();
        (pg_addr, inv_addr as *mut Invocation)
    }

    #[test]
    fn act_and_ret_round_trip() {
        let mut env = test_env(4096);
        let mut reg = crate::arch::SavedState::default();
        let root = env.root;
        let (pg2, port) = callee(&mut env, 20, 21, 22);
        set(root, 22, 0x1110_0000, 0x2220_0000, 0).unwrap();

        let boot_pg = captbl::lookup(root, BOOT_PGTBL, abi::CapType::Pgtbl)
            .unwrap()
            .object();

        reg.pc = 0x5000;
        reg.sp = 0x6000;
        act(env.cpu, &mut reg, root, 22, 0xAB).unwrap();

        // We are now "in" the callee: fresh frame, callee domain installed.
        assert_eq!(reg.pc, 0x1110_0000);
        assert_eq!(reg.sp, 0x2220_0000);
        assert_eq!(reg.args[0], 0xAB);
        assert_eq!(crate::arch::current_pgtbl(0), pg2);
        assert_eq!(pgtbl::install_count(pg2), 1);
        unsafe {
            assert!(!stack_top(env.cpu.cur_thd).is_null());
            assert_eq!((*port).active.load(Ordering::Relaxed), 1);
        }

        // Reentry is refused while active.
        assert_eq!(act(env.cpu, &mut reg, root, 22, 0), Err(Error::SivAct));

        // Return lands the caller exactly where it left, with the result in
        // the second argument slot.
        ret(env.cpu, &mut reg, 77, false).unwrap();
        assert_eq!(reg.pc, 0x5000);
        assert_eq!(reg.sp, 0x6000);
        assert_eq!(reg.rets[0], 0);
        assert_eq!(reg.rets[1], 77);
        assert_eq!(crate::arch::current_pgtbl(0), boot_pg);
        unsafe {
            assert!(stack_top(env.cpu.cur_thd).is_null());
            assert_eq!((*port).active.load(Ordering::Relaxed), 0);
        }

        // Nothing left to return from.
        assert_eq!(ret(env.cpu, &mut reg, 0, false), Err(Error::SivEmpty));
    }

    #[test]
    fn nested_invocations_unwind_in_order()  {
        let mut env = test_env(4096);
        let mut reg = crate::arch::SavedState::default();
        let root = env.root;
        let (pg2, _) = callee(&mut env, 20, 21, 22);
        let (pg3, _) = callee(&mut env, 23, 24, 25);
        set(root, 22, 0x1000, 0x2000, 0).unwrap();
        set(root, 25, 0x3000, 0x4000, 0).unwrap();

        reg.pc = 0xAA;
        act(env.cpu, &mut reg, root, 22, 1).unwrap();
        assert_eq!(crate::arch::current_pgtbl(0), pg2);
        act(env.cpu, &mut reg, root, 25, 2).unwrap();
        assert_eq!(crate::arch::current_pgtbl(0), pg3);

        ret(env.cpu, &mut reg, 0, false).unwrap();
        // Back in the middle frame's domain, at its activation site.
        assert_eq!(crate::arch::current_pgtbl(0), pg2);
        assert_eq!(reg.pc, 0x1000);

        ret(env.cpu, &mut reg, 0, false).unwrap();
        assert_eq!(reg.pc, 0xAA);
        unsafe {
            assert!(stack_top(env.cpu.cur_thd).is_null());
        }
    }

    #[test]
    fn fault_return_policy_is_enforced() {
        let mut env = test_env(4096);
        let mut reg = crate::arch::SavedState::default();
        let root = env.root;
        let (_, port) = callee(&mut env, 20, 21, 22);
        set(root, 22, 0x1000, 0x2000, 0).unwrap();

        act(env.cpu, &mut reg, root, 22, 0).unwrap();
        // The port forbids fault returns; the frame stays pushed.
        assert_eq!(ret(env.cpu, &mut reg, 0, true), Err(Error::SivFault));
        unsafe {
            assert_eq!((*port).active.load(Ordering::Relaxed), 1);
        }
        // A normal return still works.
        ret(env.cpu, &mut reg, 0, false).unwrap();
    }

    #[test]
    fn active_port_cannot_die() {
        let mut env = test_env(4096);
        let mut reg = crate::arch::SavedState::default();
        let (k, root) = (env.kernel, env.root);
        let (_, _) = callee(&mut env, 20, 21, 22);
        set(root, 22, 0x1000, 0x2000, 0).unwrap();
        act(env.cpu, &mut reg, root, 22, 0).unwrap();

        captbl::frz(k, root, BOOT_CAPTBL_SELF, 22).unwrap();
        for _ in 0..crate::config::QUIE_TIME + 1 {
            k.advance_timestamp();
        }
        assert_eq!(del(k, root, BOOT_CAPTBL_SELF, 22), Err(Error::SivAct));

        // Defrosted by the refusal; finish the call and now it can go.
        ret(env.cpu, &mut reg, 0, false).unwrap();
        let proc_op = captbl::lookup(root, 21, abi::CapType::Proc).unwrap();
        let refs_before = unsafe { process::proc_at(proc_op.object()) }.refs();
        captbl::frz(k, root, BOOT_CAPTBL_SELF, 22).unwrap();
        for _ in 0..crate::config::QUIE_TIME + 1 {
            k.advance_timestamp();
        }
        del(k, root, BOOT_CAPTBL_SELF, 22).unwrap();
        let refs_after = unsafe { process::proc_at(proc_op.object()) }.refs();
        assert_eq!(refs_after, refs_before - 1);
    }
}
