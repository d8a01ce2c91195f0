// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time kernel constants.
//!
//! These are plain items rather than cargo features so that both ports and
//! tests can do arithmetic on them.

use abi::WORD_BITS;

/// Number of preemption priority levels per CPU. Must be a multiple of the
/// word width so the run-queue bitmap divides evenly.
pub const MAX_PREEMPT_PRIO: usize = 64;

/// Words in the per-CPU run-queue bitmap.
pub const PRIO_WORDS: usize = MAX_PREEMPT_PRIO / WORD_BITS;

/// log2 of the kernel-object allocation granularity in bytes. Every kernel
/// object is placed at a multiple of this and accounted for in these units.
pub const KOTBL_SLOT_ORDER: usize = 8;

/// Kernel-object slot size in bytes.
pub const KOTBL_SLOT_SIZE: usize = 1 << KOTBL_SLOT_ORDER;

/// Ticks a frozen capability must age before delete or remove is permitted,
/// giving in-flight users of the dying capability time to drain.
pub const QUIE_TIME: usize = 4;

/// Number of CPUs the fake port models. Real ports substitute their own
/// topology; the core never assumes a particular count.
pub const CPU_NUM: usize = 2;

/// Smallest page size order a page table may use. Entry encoding keeps the
/// low byte of each entry for metadata, so frames and child tables must be
/// at least 256-byte aligned.
pub const PGTBL_MIN_SIZE_ORDER: usize = 8;

/// Largest number-of-entries order a single page-table directory may use.
pub const PGTBL_MAX_NUM_ORDER: usize = 16;

/// Words of architecture-private metadata trailing a top-level page table.
/// The fake port uses [0] as an install counter; MPU ports keep their region
/// shadow here.
pub const PGTBL_ARCH_WORDS: usize = 2;

const _: () = assert!(MAX_PREEMPT_PRIO % WORD_BITS == 0);
const _: () = assert!(PGTBL_MIN_SIZE_ORDER >= 8);
