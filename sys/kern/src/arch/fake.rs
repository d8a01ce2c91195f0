// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pure-software architecture port.
//!
//! This port exists so the kernel can be exercised on a development host:
//! "registers" are plain fields, "entering user code" never happens, and the
//! current CPU is whatever the harness last said it was. The test suite is
//! the only user code this port will ever run.

use core::ptr::null_mut;
#[cfg(not(test))]
use core::sync::atomic::{AtomicUsize, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::CPU_NUM;
use crate::sched::CpuLocal;
use crate::KernResult;

/// Log things from kernel context. Real ports route this to semihosting or
/// ITM behind the `klog-semihosting`/`klog-itm` features; here it goes to
/// the test harness's stderr, and compiles to nothing in non-test builds.
#[cfg(test)]
macro_rules! klog {
    ($($tt:tt)*) => { std::eprintln!($($tt)*) };
}

#[cfg(not(test))]
macro_rules! klog {
    ($($tt:tt)*) => {};
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            crate::fail::die(concat!("assertion failed: ", stringify!($cond)));
        }
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        if !($left == $right) {
            crate::fail::die(concat!(
                "assertion failed: ",
                stringify!($left),
                " == ",
                stringify!($right)
            ));
        }
    };
}

/// The register file a trap deposits and restores. On hardware this is the
/// callee-save area plus the exception frame; here it is exactly the slots
/// the kernel contract needs.
#[derive(
    Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct SavedState {
    pub pc: usize,
    pub sp: usize,
    /// Syscall argument registers: packed call word, then parameters.
    pub args: [usize; 4],
    /// Return registers: syscall return word, invocation return value.
    pub rets: [usize; 2],
}

impl crate::arch::RegFile for SavedState {
    fn syscall_word(&self) -> usize {
        self.args[0]
    }

    fn syscall_param(&self, i: usize) -> usize {
        self.args[i + 1]
    }

    fn set_retval(&mut self, val: isize) {
        self.rets[0] = val as usize;
    }

    fn set_inv_retval(&mut self, val: isize) {
        self.rets[1] = val as usize;
    }

    fn reinit(&mut self, entry: usize, stack: usize, param: usize) {
        *self = Self {
            pc: entry,
            sp: stack,
            args: [param, 0, 0, 0],
            rets: [0, 0],
        };
    }

    fn pc(&self) -> usize {
        self.pc
    }
}

/// Coprocessor save area. This port has no coprocessor; ports with an FPU
/// save lazily, only when the outgoing thread touched it.
#[derive(
    Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct CopState {}

/// The slice of caller state a synchronous invocation preserves.
#[derive(
    Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct InvState {
    pub pc: usize,
    pub sp: usize,
}

pub fn cop_save(_reg: &SavedState, _cop: &mut CopState) {}

pub fn cop_restore(_reg: &mut SavedState, _cop: &CopState) {}

pub fn inv_save(slice: &mut InvState, reg: &SavedState) {
    slice.pc = reg.pc;
    slice.sp = reg.sp;
}

pub fn inv_restore(reg: &mut SavedState, slice: &InvState) {
    reg.pc = slice.pc;
    reg.sp = slice.sp;
}

// The harness's "cores". Under test these are thread-locals, so that each
// test thread is its own little machine and the harness can run tests in
// parallel; a non-test build (the port compiled for a host tool) keeps
// plain globals, like a real port's GS-base/CSR/MSR slot.

#[cfg(test)]
std::thread_local! {
    static CURRENT_CPU: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
    static CPU_LOCALS: core::cell::Cell<[*mut CpuLocal; CPU_NUM]> =
        const { core::cell::Cell::new([null_mut(); CPU_NUM]) };
    static PGTBL_CURRENT: core::cell::Cell<[usize; CPU_NUM]> =
        const { core::cell::Cell::new([0; CPU_NUM]) };
}

#[cfg(test)]
pub fn cpu_id() -> usize {
    CURRENT_CPU.with(|c| c.get())
}

/// Switches the identity of the executing core. Harness only; on hardware
/// this is a hardware register.
#[cfg(test)]
pub fn set_cpu_id(id: usize) {
    uassert!(id < CPU_NUM);
    CURRENT_CPU.with(|c| c.set(id));
}

/// Registers `ptr` as core `id`'s local state.
///
/// # Safety
///
/// `ptr` must outlive every subsequent `with_cpu_local` call for this core,
/// and must not be registered for two cores at once.
#[cfg(test)]
pub unsafe fn set_cpu_local(id: usize, ptr: *mut CpuLocal) {
    uassert!(id < CPU_NUM);
    CPU_LOCALS.with(|c| {
        let mut regs = c.get();
        regs[id] = ptr;
        c.set(regs);
    });
}

/// Runs `body` against the executing core's local state.
///
/// # Safety
///
/// The caller must be the only path to this core's state in this call tree,
/// which on a real port the trap discipline guarantees.
#[cfg(test)]
pub unsafe fn with_cpu_local<R>(body: impl FnOnce(&mut CpuLocal) -> R) -> R {
    let ptr = CPU_LOCALS.with(|c| c.get())[cpu_id()];
    uassert!(!ptr.is_null());
    body(&mut *ptr)
}

/// Installs the top-level page table at `kaddr` as this core's address
/// space. A hardware port writes the translation base register or replays
/// its MPU region cache; this one records the install so tests can see it.
#[cfg(test)]
pub fn pgtbl_set(kaddr: usize) {
    PGTBL_CURRENT.with(|c| {
        let mut cur = c.get();
        cur[cpu_id()] = kaddr;
        c.set(cur);
    });
    crate::pgtbl::record_install(kaddr);
}

/// The top-level page table most recently installed on `cpu`.
#[cfg(test)]
pub fn current_pgtbl(cpu: usize) -> usize {
    PGTBL_CURRENT.with(|c| c.get())[cpu]
}

#[cfg(not(test))]
static CURRENT_CPU: AtomicUsize = AtomicUsize::new(0);

#[cfg(not(test))]
pub fn cpu_id() -> usize {
    CURRENT_CPU.load(Ordering::Relaxed)
}

/// Switches the identity of the executing core.
#[cfg(not(test))]
pub fn set_cpu_id(id: usize) {
    uassert!(id < CPU_NUM);
    CURRENT_CPU.store(id, Ordering::Relaxed);
}

#[cfg(not(test))]
static mut CPU_LOCALS: [*mut CpuLocal; CPU_NUM] = [null_mut(); CPU_NUM];

/// Registers `ptr` as core `id`'s local state.
///
/// # Safety
///
/// `ptr` must outlive every subsequent `with_cpu_local` call for this core,
/// and must not be registered for two cores at once.
#[cfg(not(test))]
pub unsafe fn set_cpu_local(id: usize, ptr: *mut CpuLocal) {
    uassert!(id < CPU_NUM);
    (*core::ptr::addr_of_mut!(CPU_LOCALS))[id] = ptr;
}

/// Runs `body` against the executing core's local state.
///
/// # Safety
///
/// The caller must be the only path to this core's state in this call tree,
/// which on a real port the trap discipline guarantees.
#[cfg(not(test))]
pub unsafe fn with_cpu_local<R>(body: impl FnOnce(&mut CpuLocal) -> R) -> R {
    let ptr = (*core::ptr::addr_of!(CPU_LOCALS))[cpu_id()];
    uassert!(!ptr.is_null());
    body(&mut *ptr)
}

#[cfg(not(test))]
static PGTBL_CURRENT: [AtomicUsize; CPU_NUM] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const Z: AtomicUsize = AtomicUsize::new(0);
    [Z; CPU_NUM]
};

/// Installs the top-level page table at `kaddr` as this core's address
/// space. A hardware port writes the translation base register or replays
/// its MPU region cache; this one records the install so tests can see it.
#[cfg(not(test))]
pub fn pgtbl_set(kaddr: usize) {
    PGTBL_CURRENT[cpu_id()].store(kaddr, Ordering::Relaxed);
    crate::pgtbl::record_install(kaddr);
}

/// The top-level page table most recently installed on `cpu`.
#[cfg(not(test))]
pub fn current_pgtbl(cpu: usize) -> usize {
    PGTBL_CURRENT[cpu].load(Ordering::Relaxed)
}

/// Kernel-function call sink. Function 0 is a no-op probe; function 1 is a
/// diagnostic checksum the tests use to observe argument plumbing.
pub fn kern_func(
    _reg: &mut SavedState,
    func_id: usize,
    sub_id: usize,
    p1: usize,
    p2: usize,
) -> KernResult {
    match func_id {
        0 => Ok(0),
        1 => Ok(sub_id.wrapping_add(p1).wrapping_add(p2) & 0xFFFF),
        _ => Err(abi::Error::HalFail),
    }
}

/// Last stop after a kernel failure.
pub fn reboot() -> ! {
    panic!("SYSTEM RESET");
}
