// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent kernel entry points: the system-call
//! dispatcher, the tick handler, the interrupt-vector relay, and the
//! fatal-fault handler.
//!
//! The port's trap sequence deposits user state into the current thread's
//! register file and calls in here with the live trap frame. Decoding is
//! fixed-arity: one packed (descriptor, capability-ID) word plus three
//! parameter words, produced by the register-file accessors. Invocation
//! activate/return are fast-pathed ahead of full decoding, matching their
//! role as the hot IPC path.
//!
//! Operations that can context switch write their own success return value
//! into the outgoing register set before switching, so the dispatcher only
//! ever writes error codes for them. Everything else is run-to-completion
//! and gets its return word written here.

use core::convert::TryFrom;

use abi::{Error, SigOption, Svc};

use crate::arch::{self, RegFile};
use crate::captbl::RawCap;
use crate::inv;
use crate::kernel::{self, Kernel};
use crate::process;
use crate::sched::{self, CpuLocal};
use crate::sig;
use crate::thread::{self, Thread};
use crate::{captbl, pgtbl};

/// The capability-table root of the protection domain `thd` is currently
/// executing in: the invocation stack top's process if a call is in
/// flight, the home process otherwise.
///
/// # Safety
///
/// `thd` must be the live current thread.
unsafe fn current_captbl<'a>(thd: *mut Thread) -> &'a RawCap {
    let top = inv::stack_top(thd);
    let proc = if top.is_null() {
        (*thd).sched.proc
    } else {
        (*top).proc
    };
    (*proc).captbl_cap()
}

/// Writes only error codes; successful switch-capable operations have
/// already placed their return value.
fn finish_switchable(reg: &mut arch::SavedState, result: crate::KernResult<()>) {
    if let Err(e) = result {
        reg.set_retval(e.code());
    }
}

/// Dispatches one system call against the live trap frame.
pub fn handle_syscall(k: &Kernel, cpu: &mut CpuLocal, reg: &mut arch::SavedState) {
    let (svc_num, extra, capid) = abi::unpack_call(reg.syscall_word());
    let p0 = reg.syscall_param(0);
    let p1 = reg.syscall_param(1);
    let p2 = reg.syscall_param(2);

    // Fast path: invocation return needs no capability lookup at all.
    if svc_num == Svc::InvRet as u32 {
        let result = inv::ret(cpu, reg, p0, false);
        finish_switchable(reg, result);
        return;
    }

    // Safety: the port guarantees cur_thd is the thread that trapped.
    let root = unsafe { current_captbl(cpu.cur_thd) };

    // Fast path: invocation activation.
    if svc_num == Svc::InvAct as u32 {
        let result = inv::act(cpu, reg, root, p0, p1);
        finish_switchable(reg, result);
        return;
    }

    let svc = match Svc::try_from(svc_num) {
        Ok(svc) => svc,
        Err(()) => {
            reg.set_retval(Error::CapNull.code());
            return;
        }
    };

    // Operations that may switch contexts.
    match svc {
        Svc::SigSnd => {
            let result = sig::snd(cpu, reg, root, p0);
            return finish_switchable(reg, result);
        }
        Svc::SigRcv => {
            let result = SigOption::try_from(p1)
                .and_then(|option| sig::rcv(cpu, reg, root, p0, option));
            return finish_switchable(reg, result);
        }
        Svc::KernAct => {
            let result = kernel::kern_act(root, reg, capid, p0, extra, p1, p2);
            return finish_switchable(reg, result.map(drop));
        }
        Svc::ThdSchedPrio => {
            let result = thread::sched_prio(cpu, reg, root, p0, p1);
            return finish_switchable(reg, result);
        }
        Svc::ThdSchedFree => {
            let result = thread::sched_free(cpu, reg, root, p0);
            return finish_switchable(reg, result);
        }
        Svc::ThdTimeXfer => {
            let result = thread::time_xfer(cpu, reg, root, p0, p1, p2);
            return finish_switchable(reg, result);
        }
        Svc::ThdSwt => {
            let result = thread::swt(cpu, reg, root, p0, p1 != 0);
            return finish_switchable(reg, result);
        }
        _ => {}
    }

    // Run-to-completion operations.
    let result = match svc {
        Svc::CaptblCrt => {
            captbl::crt(k, root, capid, abi::param_d1(p0), abi::param_d0(p0), p1, p2)
        }
        Svc::CaptblDel => captbl::del(k, root, capid, p0),
        Svc::CaptblFrz => captbl::frz(k, root, capid, p0),
        Svc::CaptblAdd => captbl::add(
            k,
            root,
            abi::param_d1(p0),
            abi::param_d0(p0),
            abi::param_d1(p1),
            abi::param_d0(p1),
            p2,
            extra,
        ),
        Svc::CaptblRem => captbl::rem(k, root, capid, p0),
        Svc::PgtblCrt => pgtbl::crt(
            k,
            root,
            capid,
            abi::param_d1(p0),
            abi::param_q1(p0),
            p1,
            p2 & !pgtbl::TOP_FLAG,
            p2 & pgtbl::TOP_FLAG != 0,
            abi::param_q0(p0),
            extra,
        ),
        Svc::PgtblDel => pgtbl::del(k, root, capid, p0),
        Svc::PgtblAdd => pgtbl::add(
            root,
            abi::param_d1(p0),
            abi::param_d0(p0),
            abi::param_d1(p2),
            abi::param_d1(p1),
            abi::param_d0(p1),
            abi::param_d0(p2),
        ),
        Svc::PgtblRem => pgtbl::rem(root, p0, p1),
        Svc::PgtblCon => pgtbl::con(root, abi::param_d1(p0), p1, abi::param_d0(p0), p2),
        Svc::PgtblDes => pgtbl::des(root, p0, p1, p2),
        Svc::ProcCrt => process::crt(
            k,
            root,
            capid,
            abi::param_d1(p0),
            abi::param_d0(p0),
            abi::param_d1(p1),
            abi::param_d0(p1),
            p2,
        ),
        Svc::ProcDel => process::del(k, root, capid, p0),
        Svc::ProcCpt => process::cpt(root, p0, p1),
        Svc::ProcPgt => process::pgt(root, p0, p1),
        Svc::ThdCrt => thread::crt(
            k,
            cpu,
            root,
            capid,
            abi::param_d1(p0),
            abi::param_d0(p0),
            abi::param_d1(p1),
            abi::param_d0(p1),
            p2,
        ),
        Svc::ThdDel => thread::del(k, root, capid, p0),
        Svc::ThdExecSet => thread::exec_set(cpu, root, capid, p0, p1, p2),
        Svc::ThdHypSet => thread::hyp_set(k, cpu, root, p0, p1),
        Svc::ThdSchedBind => thread::sched_bind(cpu, root, p0, p1, p2),
        Svc::ThdSchedRcv => thread::sched_rcv(cpu, root, p0),
        Svc::SigCrt => sig::crt(k, root, capid, p0, p1, p2),
        Svc::SigDel => sig::del(k, root, capid, p0),
        Svc::InvCrt => {
            inv::crt(k, root, capid, abi::param_d1(p0), abi::param_d0(p0), p1, p2)
        }
        Svc::InvDel => inv::del(k, root, capid, p0),
        Svc::InvSet => inv::set(root, abi::param_d0(p0), p1, p2, abi::param_d1(p0)),
        // The remaining numbers were dispatched above.
        _ => Err(Error::CapNull),
    };

    match result {
        Ok(v) => reg.set_retval(v as isize),
        Err(e) => reg.set_retval(e.code()),
    }
}

/// Trap entry used by ports once per system call.
///
/// # Safety
///
/// Must be called from the trap path with the current thread's live frame,
/// after `set_cpu_local` registration.
pub unsafe fn syscall_entry(k: &Kernel, reg: &mut arch::SavedState) {
    arch::with_cpu_local(|cpu| handle_syscall(k, cpu, reg));
}

/// Per-tick time accounting: advance the timestamp, charge the running
/// thread, time it out if it ran dry, signal the tick endpoint, and let the
/// highest-priority ready thread take over.
pub fn tick(k: &Kernel, cpu: &mut CpuLocal, reg: &mut arch::SavedState) {
    k.advance_timestamp();

    // Safety: cur_thd is live; all queue surgery is this-CPU-only.
    unsafe {
        let cur = cpu.cur_thd;
        if (*cur).sched.slices < abi::INF_TIME {
            (*cur).sched.slices -= 1;
            if (*cur).sched.slices == 0 {
                (*cur).sched.state = abi::ThdState::Timeout;
                sched::run_notif(cur);
                sched::run_del(cpu, cur);
                let next = sched::pick_high(cpu);
                (*next).sched.state = abi::ThdState::Running;
                sched::run_switch(reg, cur, next);
                cpu.cur_thd = next;
            }
        }

        // The tick is a kernel event like any other; deliver it and then
        // run the one scheduling pass of this "interrupt".
        let tick_sig = cpu.tick_sig;
        let _ = sig::kern_snd(cpu, tick_sig);
        sched::kern_high(cpu, reg);
    }
}

/// Relays a platform interrupt vector: kernel-send on the per-CPU vector
/// endpoint, then a single scheduling pass.
pub fn irq_vect(cpu: &mut CpuLocal, reg: &mut arch::SavedState) {
    // Safety: entry-path contract as for `tick`.
    unsafe {
        let vect_sig = cpu.vect_sig;
        let _ = sig::kern_snd(cpu, vect_sig);
        sched::kern_high(cpu, reg);
    }
}

/// Handles a non-recoverable fault in the current thread.
///
/// If the thread is inside an invocation whose port allows fault returns,
/// the invocation returns with `SivFault` and execution continues in the
/// caller. Otherwise the thread is killed: marked faulted, dequeued,
/// drained of time, its parent notified, and the per-CPU fault endpoint
/// signaled. A later exec-set may resurrect it.
pub fn fatal_fault(cpu: &mut CpuLocal, reg: &mut arch::SavedState) {
    if inv::ret(cpu, reg, 0, true).is_ok() {
        return;
    }

    // Safety: cur_thd is live; all queue surgery is this-CPU-only.
    unsafe {
        let thd = cpu.cur_thd;
        // Boot threads do not get to fault; that is a kernel bug, not a
        // scheduling event.
        uassert!((*thd).sched.slices != abi::INIT_TIME);
        klog!("thread {} fatal fault at pc {:#x}", (*thd).sched.tid, reg.pc());

        (*thd).sched.slices = 0;
        (*thd).sched.state = abi::ThdState::Fault;
        sched::run_del(cpu, thd);
        sched::run_notif(thd);

        let next = sched::pick_high(cpu);
        (*next).sched.state = abi::ThdState::Running;
        sched::run_switch(reg, thd, next);
        cpu.cur_thd = next;

        let fault_sig = cpu.fault_sig;
        let _ = sig::kern_snd(cpu, fault_sig);
        sched::kern_high(cpu, reg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{CapType, ThdState, INIT_TIME};
    use crate::startup::{
        test_env, BootEnv, BOOT_CAPTBL_SELF, BOOT_KMEM, BOOT_PROC, BOOT_TICK_SIG_BASE,
        BOOT_THD_BASE,
    };

    // Runs one system call through the dispatcher, the way the trap path
    // would, and returns the visible return word.
    fn call(
        env: &mut BootEnv,
        reg: &mut arch::SavedState,
        svc: Svc,
        extra: usize,
        capid: usize,
        params: [usize; 3],
    ) -> isize {
        reg.args = [abi::pack_call(svc, extra, capid), params[0], params[1], params[2]];
        handle_syscall(env.kernel, env.cpu, reg);
        reg.rets[0] as isize
    }

    fn thd_obj(env: &BootEnv, slot: usize) -> *mut Thread {
        let cap = captbl::lookup(env.root, slot, CapType::Thd).unwrap();
        cap.object() as *mut Thread
    }

    // Creates, binds and funds a thread through the syscall interface.
    // Funding usually hands it the CPU.
    fn spawn(
        env: &mut BootEnv,
        reg: &mut arch::SavedState,
        slot: usize,
        prio: usize,
        slices: usize,
    ) -> *mut Thread {
        let addr = env.alloc.take(thread::thd_size()).unwrap();
        let tid = call(
            env,
            reg,
            Svc::ThdCrt,
            0,
            BOOT_CAPTBL_SELF,
            [abi::pack_d(BOOT_KMEM, slot), abi::pack_d(BOOT_PROC, 10), addr],
        );
        assert!(tid >= 0);
        assert_eq!(
            call(env, reg, Svc::ThdSchedBind, 0, 0, [slot, BOOT_THD_BASE, prio]),
            0
        );
        if slices != 0 {
            // Funding usually preempts, leaving the recipient's context in
            // the live frame; judge the transfer by the budget itself.
            call(env, reg, Svc::ThdTimeXfer, 0, 0, [slot, BOOT_THD_BASE, slices]);
            unsafe {
                assert_eq!((*thd_obj(env, slot)).sched.slices, slices);
            }
        }
        thd_obj(env, slot)
    }

    #[test]
    fn unknown_service_is_cap_null() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        reg.args = [abi::pack_call(Svc::InvSet, 0, 0) | (0x3F << (abi::WORD_BITS / 2)), 0, 0, 0];
        handle_syscall(env.kernel, env.cpu, &mut reg);
        assert_eq!(reg.rets[0] as isize, Error::CapNull.code());
    }

    #[test]
    fn kernel_function_calls_check_the_range() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        // Function 1 is the fake port's checksum probe.
        let sum = call(
            &mut env,
            &mut reg,
            Svc::KernAct,
            9,
            crate::startup::BOOT_KERN,
            [1, 30, 3],
        );
        assert_eq!(sum, (9 + 30 + 3) as isize);
        // Unknown functions are refused by the port.
        assert_eq!(
            call(
                &mut env,
                &mut reg,
                Svc::KernAct,
                0,
                crate::startup::BOOT_KERN,
                [55, 0, 0]
            ),
            Error::HalFail.code()
        );
    }

    #[test]
    fn boot_thread_runs_forever() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let init = env.cpu.cur_thd;

        for _ in 0..1_000_000 {
            tick(env.kernel, env.cpu, &mut reg);
        }

        unsafe {
            assert_eq!(env.cpu.cur_thd, init, "nothing may displace the init thread");
            assert_eq!((*init).sched.state, ThdState::Running);
            assert_eq!((*init).sched.slices, INIT_TIME, "the boot budget never drains");
            // No parent, so no notification can ever have been queued.
            assert!(crate::list::ListNode::is_detached(thread::notif_node(init)));
        }
        // Every tick was delivered to the tick endpoint.
        unsafe {
            assert_eq!((*env.cpu.tick_sig).count(), 1_000_000);
        }
    }

    #[test]
    fn preemption_on_signal_send() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let init = env.cpu.cur_thd;

        // Endpoint in slot 20; thread B at priority 10 with 50 slices.
        let sig_addr = env.alloc.take(crate::sig::sig_size()).unwrap();
        assert_eq!(
            call(&mut env, &mut reg, Svc::SigCrt, 0, BOOT_CAPTBL_SELF, [BOOT_KMEM, 20, sig_addr]),
            0
        );
        let b = spawn(&mut env, &mut reg, 21, 10, 50);
        assert_eq!(env.cpu.cur_thd, b);

        // B blocks on the endpoint; init gets the CPU back.
        call(&mut env, &mut reg, Svc::SigRcv, 0, 0, [20, 0, 0]);
        unsafe {
            assert_eq!((*b).sched.state, ThdState::Blocked);
        }
        assert_eq!(env.cpu.cur_thd, init);

        // Init sends: B is handed the signal and preempts immediately.
        call(&mut env, &mut reg, Svc::SigSnd, 0, 0, [20, 0, 0]);
        assert_eq!(env.cpu.cur_thd, b);
        unsafe {
            assert_eq!((*b).sched.state, ThdState::Running);
            assert_eq!((*init).sched.state, ThdState::Ready);
            // Both sit on the queue at their own priorities.
            assert!(!crate::list::ListNode::is_detached(thread::run_node(b)));
            assert!(!crate::list::ListNode::is_detached(thread::run_node(init)));
        }
        // The woken receive reports exactly one signal, in B's context.
        assert_eq!(reg.rets[0], 1);
    }

    #[test]
    fn time_donation_cascade() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();

        let a = spawn(&mut env, &mut reg, 20, 5, 100);
        assert_eq!(env.cpu.cur_thd, a);
        let b = spawn(&mut env, &mut reg, 21, 10, 0);
        unsafe {
            assert_eq!((*b).sched.state, ThdState::Timeout);
        }

        // A donates 60 of its 100 to B; B instantly outranks and preempts.
        call(&mut env, &mut reg, Svc::ThdTimeXfer, 0, 0, [21, 20, 60]);
        unsafe {
            assert_eq!((*a).sched.slices, 40);
            assert_eq!((*b).sched.slices, 60);
            assert_eq!((*b).sched.state, ThdState::Running);
            assert_eq!((*a).sched.state, ThdState::Ready);
        }
        assert_eq!(env.cpu.cur_thd, b);
    }

    #[test]
    fn invocation_fault_returns_to_the_caller() {
        let mut env = test_env(4096);
        let mut reg = arch::SavedState::default();
        let root = env.root;
        let init = env.cpu.cur_thd;

        // A callee process with its own address space and a fault-tolerant
        // port into it.
        let pg_addr = env.alloc.take(crate::pgtbl::pgtbl_size(8, true)).unwrap();
        crate::pgtbl::boot_crt(
            env.kernel,
            root,
            BOOT_CAPTBL_SELF,
            20,
            pg_addr,
            0,
            true,
            abi::WORD_BITS - 8,
            8,
        )
        .unwrap();
        let proc_addr = env.alloc.take(process::proc_size()).unwrap();
        assert_eq!(
            call(
                &mut env,
                &mut reg,
                Svc::ProcCrt,
                0,
                BOOT_CAPTBL_SELF,
                [
                    abi::pack_d(BOOT_KMEM, 21),
                    abi::pack_d(BOOT_CAPTBL_SELF, 20),
                    proc_addr
                ]
            ),
            0
        );
        let inv_addr = env.alloc.take(inv::inv_size()).unwrap();
        assert_eq!(
            call(
                &mut env,
                &mut reg,
                Svc::InvCrt,
                0,
                BOOT_CAPTBL_SELF,
                [abi::pack_d(BOOT_KMEM, 22), 21, inv_addr]
            ),
            0
        );
        // fault_ret = 1 rides the high half of param 0.
        assert_eq!(
            call(
                &mut env,
                &mut reg,
                Svc::InvSet,
                0,
                0,
                [abi::pack_d(1, 22), 0x111_0000, 0x222_0000]
            ),
            0
        );

        reg.pc = 0x5000;
        call(&mut env, &mut reg, Svc::InvAct, 0, 0, [22, 0xAB, 0]);
        assert_eq!(reg.pc, 0x111_0000, "activation must enter the callee");

        // The callee faults. The port allows fault returns, so the caller
        // resumes with SivFault as the invocation's result.
        fatal_fault(env.cpu, &mut reg);
        assert_eq!(reg.pc, 0x5000);
        assert_eq!(reg.rets[0] as isize, Error::SivFault.code());
        unsafe {
            assert_eq!((*init).sched.state, ThdState::Running, "the caller is unharmed");
            let port = inv_addr as *mut inv::Invocation;
            assert_eq!((*port).active.load(core::sync::atomic::Ordering::Relaxed), 0);
        }
        assert_eq!(env.cpu.cur_thd, init);
    }

    #[test]
    fn fault_without_a_tolerant_port_kills_the_thread() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();
        let init = env.cpu.cur_thd;

        let t = spawn(&mut env, &mut reg, 20, 5, 50);
        assert_eq!(env.cpu.cur_thd, t);
        let tid = unsafe { (*t).sched.tid };

        // T faults with nothing on its invocation stack.
        fatal_fault(env.cpu, &mut reg);
        unsafe {
            assert_eq!((*t).sched.state, ThdState::Fault);
            assert_eq!((*t).sched.slices, 0);
        }
        assert_eq!(env.cpu.cur_thd, init);
        // The fault endpoint heard about it, and the scheduler parent sees
        // the fault-marked TID.
        unsafe {
            assert_eq!((*env.cpu.fault_sig).count(), 1);
        }
        let rcv = call(&mut env, &mut reg, Svc::ThdSchedRcv, 0, 0, [BOOT_THD_BASE, 0, 0]);
        assert_eq!(rcv as usize, tid | abi::TID_FAULT_FLAG);

        // A faulted thread cannot receive time...
        assert_eq!(
            call(&mut env, &mut reg, Svc::ThdTimeXfer, 0, 0, [20, BOOT_THD_BASE, 5]),
            Error::PthFault.code()
        );
        // ...until exec-set clears the fault.
        assert_eq!(
            call(&mut env, &mut reg, Svc::ThdExecSet, 0, 20, [0x7000, 0x8000, 0]),
            0
        );
        unsafe {
            assert_eq!((*t).sched.state, ThdState::Timeout);
        }
        call(&mut env, &mut reg, Svc::ThdTimeXfer, 0, 0, [20, BOOT_THD_BASE, 5]);
        unsafe {
            assert_eq!((*t).sched.slices, 5);
            assert_eq!((*t).sched.state, ThdState::Running);
        }
        assert_eq!(env.cpu.cur_thd, t);
    }

    #[test]
    fn tick_endpoint_collects_interrupt_ticks() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();

        for _ in 0..5 {
            tick(env.kernel, env.cpu, &mut reg);
        }
        // A receiver can drain them all at once through the boot tick
        // capability.
        let got = call(
            &mut env,
            &mut reg,
            Svc::SigRcv,
            0,
            0,
            [BOOT_TICK_SIG_BASE, 3, 0],
        );
        assert_eq!(got, 5);
    }

    #[test]
    fn vector_relay_wakes_the_handler_thread() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();

        let t = spawn(&mut env, &mut reg, 20, 7, 20);
        assert_eq!(env.cpu.cur_thd, t);
        // The handler thread blocks on the vector endpoint.
        call(
            &mut env,
            &mut reg,
            Svc::SigRcv,
            0,
            0,
            [crate::startup::BOOT_VECT_SIG_BASE, 0, 0],
        );
        unsafe {
            assert_eq!((*t).sched.state, ThdState::Blocked);
        }
        assert_ne!(env.cpu.cur_thd, t);

        // A platform interrupt arrives.
        irq_vect(env.cpu, &mut reg);
        assert_eq!(env.cpu.cur_thd, t, "the vector handler must preempt");
        assert_eq!(reg.rets[0], 1);
    }

    #[test]
    fn two_level_ids_work_through_the_dispatcher() {
        let mut env = test_env(2048);
        let mut reg = arch::SavedState::default();

        // A child table in slot 20, and a fresh table created through the
        // two-level (child, slot) ID.
        let t_addr = env.alloc.take(captbl::captbl_size(8)).unwrap();
        assert_eq!(
            call(
                &mut env,
                &mut reg,
                Svc::CaptblCrt,
                0,
                BOOT_CAPTBL_SELF,
                [abi::pack_d(BOOT_KMEM, 20), t_addr, 8]
            ),
            0
        );
        let u_addr = env.alloc.take(captbl::captbl_size(8)).unwrap();
        assert_eq!(
            call(
                &mut env,
                &mut reg,
                Svc::CaptblCrt,
                0,
                20,
                [abi::pack_d(BOOT_KMEM, 3), u_addr, 8]
            ),
            0
        );
        let two = abi::CapId::encode_two(20, 3);
        assert!(captbl::lookup(env.root, two, CapType::Captbl).is_ok());
    }
}
