// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability-based real-time microkernel.
//!
//! This is the application-independent portion of the operating system: the
//! capability table and its lifecycle protocol, the kernel-object placement
//! bitmap, the page-table abstraction, processes and threads with a per-CPU
//! fixed-priority preemptive scheduler, signal-endpoint IPC, synchronous
//! invocation, and the system-call dispatcher that routes into all of them.
//!
//! # Design principles
//!
//! 1. No dynamic kernel allocation. Every kernel object lives in user-owned
//!    kernel-writable memory at a user-chosen address, accounted for by a
//!    bitmap so two objects can never share backing storage.
//! 2. No locks. Cores coordinate exclusively through atomic word operations
//!    on capability headers and counters; everything else is per-CPU.
//! 3. Run-to-completion. A thread suspends only at a blocking receive, an
//!    explicit yield, or preemption; every other system call finishes in one
//!    pass with all validation before the first observable state change.
//! 4. Host-testable core. The `arch` module narrows to a pure-software port
//!    on non-embedded targets, and the whole kernel builds and runs under
//!    `cargo test`.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod arch;

pub mod captbl;
pub mod config;
pub mod fail;
pub mod inv;
pub mod kernel;
pub mod kot;
pub mod list;
pub mod pgtbl;
pub mod process;
pub mod sched;
pub mod sig;
pub mod startup;
pub mod syscalls;
pub mod thread;

/// Shorthand for the result type every fallible kernel operation returns.
/// The `usize` is the non-negative value handed back through the syscall
/// return word.
pub type KernResult<T = usize> = core::result::Result<T, abi::Error>;
