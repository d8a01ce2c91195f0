// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel bring-up.
//!
//! Startup owns the only moment when kernel objects are placed without a
//! kernel-memory capability: the first capability table, the boot address
//! space and process, the undeletable kernel-memory and kernel-function
//! capabilities, and each core's sentinel endpoints and init thread. After
//! `bring_up` returns, every further object comes from user level through
//! the create calls, and the boot capability table is the root of all
//! authority.
//!
//! The boot slot layout is fixed so the user-level runtime can find its
//! inheritance without negotiation.

use core::mem::MaybeUninit;
use core::sync::atomic::AtomicUsize;

use abi::{Error, KmemFlags, WORD_BITS};

use crate::captbl::{self, RawCap};
use crate::config::{CPU_NUM, KOTBL_SLOT_SIZE};
use crate::kernel::{self, Kernel};
use crate::kot::Kot;
use crate::pgtbl;
use crate::process;
use crate::sched::CpuLocal;
use crate::sig;
use crate::thread;
use crate::KernResult;

/// Entry count of the boot capability table.
pub const BOOT_CAPTBL_ENTRIES: usize = 64;

/// Boot slot: the boot capability table's own capability.
pub const BOOT_CAPTBL_SELF: usize = 0;
/// Boot slot: the top-level page table of the boot process.
pub const BOOT_PGTBL: usize = 1;
/// Boot slot: the boot process.
pub const BOOT_PROC: usize = 2;
/// Boot slot: the kernel-memory capability covering the whole region.
pub const BOOT_KMEM: usize = 3;
/// Boot slot: the kernel-function capability covering the whole range.
pub const BOOT_KERN: usize = 4;
/// Boot slots: one init thread per CPU.
pub const BOOT_THD_BASE: usize = 5;
/// Boot slots: one tick endpoint per CPU.
pub const BOOT_TICK_SIG_BASE: usize = BOOT_THD_BASE + CPU_NUM;
/// Boot slots: one fault endpoint per CPU.
pub const BOOT_FAULT_SIG_BASE: usize = BOOT_TICK_SIG_BASE + CPU_NUM;
/// Boot slots: one interrupt-vector endpoint per CPU.
pub const BOOT_VECT_SIG_BASE: usize = BOOT_FAULT_SIG_BASE + CPU_NUM;
/// First boot slot free for user-level use.
pub const BOOT_CAP_FREE: usize = BOOT_VECT_SIG_BASE + CPU_NUM;

const _: () = assert!(BOOT_CAP_FREE <= BOOT_CAPTBL_ENTRIES);

/// Bump placement of boot-time kernel objects inside the kernel memory
/// region. Only startup (and tests, which play the user-level runtime's
/// role of choosing addresses) hand out addresses this way.
pub struct BootAlloc {
    next: usize,
    end: usize,
}

impl BootAlloc {
    pub fn new(start: usize, end: usize) -> BootAlloc {
        BootAlloc { next: start, end }
    }

    /// Takes a slot-aligned range of `size` bytes.
    pub fn take(&mut self, size: usize) -> KernResult<usize> {
        let addr = (self.next + KOTBL_SLOT_SIZE - 1) & !(KOTBL_SLOT_SIZE - 1);
        if size == 0 || addr.checked_add(size).map(|e| e > self.end).unwrap_or(true) {
            return Err(Error::CapKotbl);
        }
        self.next = addr + size;
        Ok(addr)
    }
}

/// Everything bring-up hands back to the port.
pub struct BootEnv {
    pub kernel: &'static Kernel,
    pub cpu: &'static mut CpuLocal,
    pub root: &'static RawCap,
    /// Placement cursor past the boot objects, for the user runtime's
    /// first allocations.
    pub alloc: BootAlloc,
}

/// Brings up the kernel on the bootstrap core: kernel-wide state, the boot
/// capability environment, and this core's scheduler. The port then
/// installs the CPU-local pointer, seeds the init thread's user context,
/// and drops to user level.
pub fn bring_up(
    kernel_store: &'static mut MaybeUninit<Kernel>,
    cpu_store: &'static mut MaybeUninit<CpuLocal>,
    cpu_id: usize,
    kot_bits: &'static [AtomicUsize],
    kmem_base: usize,
    kmem_size: usize,
) -> KernResult<BootEnv> {
    let kernel: &'static mut Kernel =
        kernel_store.write(Kernel::new(Kot::new(kmem_base, kmem_size, kot_bits)));
    let k: &'static Kernel = kernel;
    let mut alloc = BootAlloc::new(kmem_base, kmem_base + kmem_size);

    // The first capability table, holding its own capability in slot zero.
    let captbl_addr = alloc.take(captbl::captbl_size(BOOT_CAPTBL_ENTRIES))?;
    captbl::boot_init(k, BOOT_CAPTBL_SELF, captbl_addr, BOOT_CAPTBL_ENTRIES)?;
    // Safety: boot_init published the capability at this address.
    let root: &'static RawCap = unsafe {
        captbl::cap_at(captbl_addr + BOOT_CAPTBL_SELF * core::mem::size_of::<RawCap>())
    };

    // One top-level page table spanning the whole address space; the boot
    // process sees everything until the user runtime carves it up.
    let pg_addr = alloc.take(pgtbl::pgtbl_size(8, true))?;
    pgtbl::boot_crt(
        k,
        root,
        BOOT_CAPTBL_SELF,
        BOOT_PGTBL,
        pg_addr,
        0,
        true,
        WORD_BITS - 8,
        8,
    )?;

    let proc_addr = alloc.take(process::proc_size())?;
    process::boot_crt(
        k,
        root,
        BOOT_CAPTBL_SELF,
        BOOT_PROC,
        BOOT_CAPTBL_SELF,
        BOOT_PGTBL,
        proc_addr,
    )?;

    // Authority over kernel memory and the kernel-function range, both
    // born undeletable.
    kernel::kmem_boot_crt(
        root,
        BOOT_CAPTBL_SELF,
        BOOT_KMEM,
        kmem_base,
        kmem_base + kmem_size,
        KmemFlags::all(),
    )?;
    kernel::kern_boot_crt(root, BOOT_CAPTBL_SELF, BOOT_KERN)?;

    let cpu: &'static mut CpuLocal = cpu_store.write(CpuLocal::new(cpu_id));
    // Safety: the CpuLocal is at its final (static) address and unused.
    unsafe { cpu.init() };

    bring_up_cpu(k, cpu, root, &mut alloc)?;

    klog!("kernel up on cpu {}, {} boot slots used", cpu_id, BOOT_CAP_FREE);
    Ok(BootEnv {
        kernel: k,
        cpu,
        root,
        alloc,
    })
}

/// Per-core bring-up: sentinel endpoints, the init thread, and the boot
/// address space. Secondary cores call this against the primary's kernel
/// handle and boot capability table.
pub fn bring_up_cpu(
    k: &Kernel,
    cpu: &mut CpuLocal,
    root: &RawCap,
    alloc: &mut BootAlloc,
) -> KernResult<()> {
    let id = cpu.id;
    // The installs below land on the executing core; bringing up someone
    // else's scheduler would wire the address space to the wrong place.
    uassert_eq!(id, crate::arch::cpu_id());

    let tick_addr = alloc.take(sig::sig_size())?;
    sig::boot_crt(k, root, BOOT_CAPTBL_SELF, BOOT_TICK_SIG_BASE + id, tick_addr)?;
    let fault_addr = alloc.take(sig::sig_size())?;
    sig::boot_crt(k, root, BOOT_CAPTBL_SELF, BOOT_FAULT_SIG_BASE + id, fault_addr)?;
    let vect_addr = alloc.take(sig::sig_size())?;
    sig::boot_crt(k, root, BOOT_CAPTBL_SELF, BOOT_VECT_SIG_BASE + id, vect_addr)?;

    // Safety: the three endpoints were just created at these addresses.
    unsafe {
        cpu.tick_sig = sig::sig_at(tick_addr);
        cpu.fault_sig = sig::sig_at(fault_addr);
        cpu.vect_sig = sig::sig_at(vect_addr);
    }

    // The init thread: infinite budget, lowest priority, current from the
    // first instant.
    let thd_addr = alloc.take(thread::thd_size())?;
    thread::boot_crt(
        k,
        cpu,
        root,
        BOOT_CAPTBL_SELF,
        BOOT_THD_BASE + id,
        BOOT_PROC,
        thd_addr,
        0,
    )?;

    // Install the boot address space on this core.
    let proc_op = captbl::lookup(root, BOOT_PROC, abi::CapType::Proc)?;
    // Safety: the process capability holds the object live.
    let pgtbl_obj = unsafe { process::proc_at(proc_op.object()) }.pgtbl_obj();
    pgtbl::set(pgtbl_obj);
    Ok(())
}

//
// Test scaffolding. Tests play the role of both the port (placing static
// storage) and the user-level runtime (choosing object addresses).
//

/// Builds a kernel over a leaked, slot-aligned memory arena of `slots`
/// kernel-object slots.
#[cfg(test)]
pub fn test_kernel(slots: usize) -> &'static Kernel {
    use std::alloc::Layout;

    let size = slots * KOTBL_SLOT_SIZE;
    let layout = Layout::from_size_align(size, KOTBL_SLOT_SIZE).unwrap();
    // Safety: a fresh, never-freed allocation; zeroing makes the arena's
    // content deterministic.
    let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
    assert!(base != 0);

    let words = (slots + WORD_BITS - 1) / WORD_BITS;
    let bits: &'static [AtomicUsize] = Box::leak(
        (0..words)
            .map(|_| AtomicUsize::new(0))
            .collect::<Box<[AtomicUsize]>>(),
    );
    Box::leak(Box::new(Kernel::new(Kot::new(base, size, bits))))
}

/// Creates a boot capability table at the arena base and returns its
/// self-capability.
#[cfg(test)]
pub fn boot_captbl(k: &Kernel, entries: usize) -> KernResult<&'static RawCap> {
    captbl::boot_init(k, BOOT_CAPTBL_SELF, k.kot.base(), entries)?;
    // Safety: just published there.
    Ok(unsafe { captbl::cap_at(k.kot.base()) })
}

/// Fully booted single-core environment, registered with the fake port so
/// the trap-entry paths work too.
#[cfg(test)]
pub fn test_env(slots: usize) -> BootEnv {
    use std::alloc::Layout;

    let size = slots * KOTBL_SLOT_SIZE;
    let layout = Layout::from_size_align(size, KOTBL_SLOT_SIZE).unwrap();
    // Safety: fresh never-freed allocation.
    let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
    assert!(base != 0);

    let words = (slots + WORD_BITS - 1) / WORD_BITS;
    let bits: &'static [AtomicUsize] = Box::leak(
        (0..words)
            .map(|_| AtomicUsize::new(0))
            .collect::<Box<[AtomicUsize]>>(),
    );

    let kernel_store = Box::leak(Box::new(MaybeUninit::<Kernel>::uninit()));
    let cpu_store = Box::leak(Box::new(MaybeUninit::<CpuLocal>::uninit()));

    crate::arch::set_cpu_id(0);
    let mut env = bring_up(kernel_store, cpu_store, 0, bits, base, size).unwrap();
    let cpu_ptr: *mut CpuLocal = &mut *env.cpu;
    // Safety: the CpuLocal is leaked; it outlives every use.
    unsafe { crate::arch::set_cpu_local(0, cpu_ptr) };
    env
}
