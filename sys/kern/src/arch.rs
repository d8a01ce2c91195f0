// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names:
//!
//! - `SavedState`, the trap-time register file, implementing [`RegFile`];
//! - `CopState`, the coprocessor save area (possibly empty);
//! - `InvState`, the PC+SP slice preserved across a synchronous invocation;
//! - `cpu_id()`, the identity of the executing core;
//! - `set_cpu_local(id, ptr)` / `with_cpu_local(f)`, the per-CPU-state
//!   registry used by the trap entry layer;
//! - `cop_save(reg, cop)` / `cop_restore(reg, cop)`, honoring the port's
//!   lazy-save policy;
//! - `inv_save(slice, reg)` / `inv_restore(reg, slice)`;
//! - `pgtbl_set(kaddr)`, installing a top-level page table as the active
//!   address space on this core;
//! - `kern_func(reg, func_id, sub_id, p1, p2)`, the kernel-function call
//!   sink;
//! - `reboot()`, the end of the road;
//! - the `klog!`, `uassert!` and `uassert_eq!` macros.
//!
//! Hardware ports (register save/restore sequences, MMU/MPU programming,
//! timer and interrupt plumbing) are maintained with their board support,
//! out of this tree; the `fake` port below is a complete pure-software
//! implementation of the contract and is what the test suite runs on.

/// Trap-time register file operations the portable kernel needs. The
/// concrete type is `arch::SavedState`; the trait keeps the portable code
/// honest about which registers it may touch.
pub trait RegFile: Clone + Default {
    /// The packed (descriptor, capability-ID) word of the pending syscall.
    fn syscall_word(&self) -> usize;

    /// Syscall parameter word `i`, `0..abi::SYSCALL_PARAMS`.
    fn syscall_param(&self, i: usize) -> usize;

    /// Writes the syscall return word.
    fn set_retval(&mut self, val: isize);

    /// Writes an invocation's return value into the architectural second
    /// argument slot, where the invocation caller expects it.
    fn set_inv_retval(&mut self, val: isize);

    /// Reinitializes the file for entry at `entry` with stack `stack`,
    /// passing `param` in the architectural first argument slot.
    fn reinit(&mut self, entry: usize, stack: usize, param: usize);

    /// Current program counter, for diagnostics.
    fn pc(&self) -> usize;
}

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(any(test, not(target_os = "none")))] {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    } else {
        compile_error!("no in-tree architecture port for this target");
    }
}
