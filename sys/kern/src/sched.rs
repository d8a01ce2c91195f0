// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-CPU scheduler: run queue, current-thread record, sentinel
//! endpoints, and the context-switch primitive.
//!
//! The run queue is an array of doubly-linked lists, one per priority, plus
//! a bitmap with one bit per priority. Picking the next thread is a reverse
//! scan of the bitmap words and one most-significant-bit lookup — O(1) in
//! everything but the number of bitmap words. Higher numeric priority is
//! more important.
//!
//! Everything here is strictly per-CPU. No other core ever touches a run
//! queue; cross-core effects arrive only by way of the atomic counters on
//! endpoints and capabilities.

use abi::{ThdState, WORD_BITS};

use crate::arch;
use crate::config::{MAX_PREEMPT_PRIO, PRIO_WORDS};
use crate::inv;
use crate::list::ListNode;
use crate::sig::SigEndpoint;
use crate::thread::{self, Thread};

/// Per-CPU run queue.
pub struct RunQueue {
    bitmap: [usize; PRIO_WORDS],
    lists: [ListNode; MAX_PREEMPT_PRIO],
}

impl RunQueue {
    fn new() -> RunQueue {
        RunQueue {
            bitmap: [0; PRIO_WORDS],
            lists: core::array::from_fn(|_| ListNode::poisoned()),
        }
    }

    /// Links every priority list to itself. Must run after the queue has
    /// reached its final address and before any insert.
    unsafe fn init(&mut self) {
        for list in &mut self.lists {
            ListNode::init(list);
        }
    }

    /// True if no thread is queued at any priority.
    pub fn is_empty(&self) -> bool {
        self.bitmap.iter().all(|w| *w == 0)
    }
}

/// Per-CPU kernel state, reached through the port's CPU-local getter at the
/// trap boundary and passed explicitly below it.
pub struct CpuLocal {
    /// This core's identity.
    pub id: usize,
    /// The thread currently executing on this core.
    pub cur_thd: *mut Thread,
    /// This core's run queue.
    pub run: RunQueue,
    /// Kernel endpoint signaled on every tick.
    pub tick_sig: *mut SigEndpoint,
    /// Kernel endpoint signaled when a thread takes a fatal fault.
    pub fault_sig: *mut SigEndpoint,
    /// Kernel endpoint signaled for platform interrupt vectors.
    pub vect_sig: *mut SigEndpoint,
}

impl CpuLocal {
    pub fn new(id: usize) -> CpuLocal {
        CpuLocal {
            id,
            cur_thd: core::ptr::null_mut(),
            run: RunQueue::new(),
            tick_sig: core::ptr::null_mut(),
            fault_sig: core::ptr::null_mut(),
            vect_sig: core::ptr::null_mut(),
        }
    }

    /// Second-phase initialization, once the structure has its final
    /// address.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, before any scheduling operation, and
    /// after the structure will no longer move.
    pub unsafe fn init(&mut self) {
        self.run.init();
    }
}

/// Inserts `thd` into its priority's list. The caller has already decided
/// the thread belongs on this core's queue and is runnable.
///
/// # Safety
///
/// `thd` must be a live thread bound to this CPU whose run node is
/// detached.
pub unsafe fn run_ins(cpu: &mut CpuLocal, thd: *mut Thread) {
    let prio = (*thd).sched.prio;
    uassert!(prio < MAX_PREEMPT_PRIO);
    let list = &mut cpu.run.lists[prio] as *mut ListNode;
    ListNode::push_back(thread::run_node(thd), list);
    cpu.run.bitmap[prio / WORD_BITS] |= 1 << (prio % WORD_BITS);
}

/// Removes `thd` from its priority's list, clearing the priority bit if the
/// list drained.
///
/// # Safety
///
/// `thd` must currently be linked on this CPU's queue.
pub unsafe fn run_del(cpu: &mut CpuLocal, thd: *mut Thread) {
    let prio = (*thd).sched.prio;
    uassert!(prio < MAX_PREEMPT_PRIO);
    ListNode::detach(thread::run_node(thd));
    let list = &mut cpu.run.lists[prio] as *mut ListNode;
    if ListNode::is_detached(list) {
        cpu.run.bitmap[prio / WORD_BITS] &= !(1 << (prio % WORD_BITS));
    }
}

/// Finds the most important queued thread. The per-CPU boot thread makes an
/// empty queue impossible; hitting one is kernel death.
///
/// # Safety
///
/// The queue must be well formed (only `run_ins`/`run_del` touch it).
pub unsafe fn pick_high(cpu: &CpuLocal) -> *mut Thread {
    for word in (0..PRIO_WORDS).rev() {
        let bits = cpu.run.bitmap[word];
        if bits != 0 {
            let prio = word * WORD_BITS + (WORD_BITS - 1 - bits.leading_zeros() as usize);
            let list = &cpu.run.lists[prio] as *const ListNode;
            return thread::from_run(ListNode::first(list));
        }
    }
    crate::fail::die("run queue empty")
}

/// Enqueues a scheduler notification for `thd` onto its parent's event
/// list, unless one is already pending. Repeated state changes collapse
/// into a single pending event.
///
/// # Safety
///
/// `thd` must be live and bound, with a live parent on this core.
pub unsafe fn run_notif(thd: *mut Thread) {
    if ListNode::is_detached(thread::notif_node(thd)) {
        let parent = (*thd).sched.parent;
        uassert!(!parent.is_null());
        ListNode::push_back(thread::notif_node(thd), thread::event_head(parent));
    }
}

/// The page-table object of the protection domain `thd` is currently
/// executing in: the top of its invocation stack if any, else its home
/// process.
///
/// # Safety
///
/// `thd` must be live with a live process.
pub unsafe fn active_pgtbl_obj(thd: *mut Thread) -> usize {
    let top = inv::stack_top(thd);
    if top.is_null() {
        (*(*thd).sched.proc).pgtbl_obj()
    } else {
        (*(*top).proc).pgtbl_obj()
    }
}

/// Context switch: parks the live register file into `from`'s context,
/// loads `to`'s, and changes the address space if the two threads execute
/// in different protection domains. Scheduling state is the caller's
/// business.
///
/// # Safety
///
/// Both threads must be live and distinct, and `reg` must be the live trap
/// frame of `from`.
pub unsafe fn run_switch(
    reg: &mut arch::SavedState,
    from: *mut Thread,
    to: *mut Thread,
) {
    uassert!(from != to);

    let from_regs = (*from).cur_reg;
    (*from_regs).reg = reg.clone();
    arch::cop_save(reg, &mut (*from_regs).cop);

    let to_regs = (*to).cur_reg;
    *reg = (*to_regs).reg.clone();
    arch::cop_restore(reg, &(*to_regs).cop);

    let from_pgtbl = active_pgtbl_obj(from);
    let to_pgtbl = active_pgtbl_obj(to);
    if from_pgtbl != to_pgtbl {
        crate::pgtbl::set(to_pgtbl);
    }
}

/// Picks the most important ready thread and switches to it if it beats the
/// current one. This is the single scheduling pass an interrupt handler
/// runs after all its kernel sends.
///
/// # Safety
///
/// `reg` must be the live trap frame of the current thread.
pub unsafe fn kern_high(cpu: &mut CpuLocal, reg: &mut arch::SavedState) {
    let high = pick_high(cpu);
    let cur = cpu.cur_thd;
    if high == cur {
        return;
    }

    // A running or ready current thread keeps the CPU unless strictly
    // outranked; a timed-out or blocked one has already lost it.
    let cur_state = (*cur).sched.state;
    if cur_state == ThdState::Running || cur_state == ThdState::Ready {
        if (*high).sched.prio <= (*cur).sched.prio {
            return;
        }
        (*cur).sched.state = ThdState::Ready;
    }

    run_switch(reg, cur, high);
    (*high).sched.state = ThdState::Running;
    cpu.cur_thd = high;
}
