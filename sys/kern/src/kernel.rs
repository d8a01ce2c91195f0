// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-wide shared state and the kernel-function / kernel-memory
//! capabilities.
//!
//! Everything here is shared by all cores and therefore either immutable
//! after boot or atomic: the placement bitmap, the tick timestamp that
//! quiescence is measured against, and the thread-ID counter.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{CapType, Error, KmemFlags, WORD_BITS};

use crate::captbl::{self, RawCap};
use crate::config::{KOTBL_SLOT_SIZE, QUIE_TIME};
use crate::kot::Kot;
use crate::KernResult;

/// Global kernel state. Exactly one of these exists; it is built by startup
/// and shared by reference below the trap entry.
pub struct Kernel {
    /// Kernel-object placement bitmap over the kernel memory region.
    pub kot: Kot,
    /// Monotonic tick timestamp. Seeded to half of the 32-bit range so the
    /// wrap handling in the quiescence comparison is exercised rather than
    /// theoretical.
    timestamp: AtomicUsize,
    /// Thread-ID counter.
    tid_next: AtomicUsize,
}

impl Kernel {
    pub fn new(kot: Kot) -> Kernel {
        Kernel {
            kot,
            timestamp: AtomicUsize::new(!0 >> (WORD_BITS / 2)),
            tid_next: AtomicUsize::new(0),
        }
    }

    /// Current tick timestamp.
    pub fn now(&self) -> usize {
        self.timestamp.load(Ordering::Relaxed)
    }

    /// Advances the timestamp by one tick. Called from the timekeeping
    /// core's tick path.
    pub fn advance_timestamp(&self) {
        self.timestamp.fetch_add(1, Ordering::Relaxed);
    }

    /// Issues a fresh thread ID.
    pub fn next_tid(&self) -> usize {
        self.tid_next.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether a capability frozen at `stamp` has aged past the quiescence
    /// window. The double subtraction keeps the comparison correct across
    /// 32-bit timestamp wrap.
    pub fn quiescent(&self, stamp: usize) -> bool {
        if QUIE_TIME == 0 {
            return true;
        }
        let now = self.now();
        let fwd = now.wrapping_sub(stamp);
        let back = stamp.wrapping_sub(now);
        if fwd > back {
            back > QUIE_TIME
        } else {
            fwd > QUIE_TIME
        }
    }
}

/// Creates the boot-time kernel-function capability in slot `cap_kern` of
/// the table behind `cap_captbl`. The capability covers the port's full
/// call range and is born with a reference so it can never be deleted.
pub fn kern_boot_crt(root: &RawCap, cap_captbl: usize, cap_kern: usize) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(captbl_op, abi::CaptblFlags::CRT.bits())?;

    let slot = captbl::slot(captbl_op, captbl::one_level(cap_kern)?)?;
    captbl::occupy(slot)?;

    slot.set_parent(0);
    // Kernel-function capabilities carry a call range, not an object.
    slot.set_object(0);
    slot.set_flags(abi::KERN_FULL_RANGE);
    captbl::publish_undeletable(slot, CapType::Kern);
    Ok(0)
}

/// Creates a boot-time kernel-memory capability covering `[start, end]`
/// (byte addresses; `end` exclusive, both rounded inward to slot
/// granularity) with create-mask `flags`. Born referenced, so undeletable.
pub fn kmem_boot_crt(
    root: &RawCap,
    cap_captbl: usize,
    cap_kmem: usize,
    start: usize,
    end: usize,
    flags: KmemFlags,
) -> KernResult {
    let captbl_op = captbl::lookup(root, cap_captbl, CapType::Captbl)?;
    captbl::cap_check(captbl_op, abi::CaptblFlags::CRT.bits())?;

    // Must at least allow creation of something.
    uassert!(!flags.is_empty());

    let kmem_start = (start + KOTBL_SLOT_SIZE - 1) & !(KOTBL_SLOT_SIZE - 1);
    let kmem_end = end & !(KOTBL_SLOT_SIZE - 1);
    if kmem_end <= kmem_start {
        return Err(Error::CapFlag);
    }

    let slot = captbl::slot(captbl_op, captbl::one_level(cap_kmem)?)?;
    captbl::occupy(slot)?;

    slot.set_parent(0);
    // Kernel-memory capabilities carry a range, not an object.
    slot.set_object(0);
    slot.set_flags(flags.bits());
    slot.set_info(0, kmem_start);
    slot.set_info(1, kmem_end - 1);
    captbl::publish_undeletable(slot, CapType::Kmem);
    Ok(0)
}

/// Checks that `kmem` permits creating an object kind `kind` over
/// `[vaddr, vaddr + size)`.
pub fn kmem_check(kmem: &RawCap, kind: KmemFlags, vaddr: usize, size: usize) -> KernResult<()> {
    if kmem.flags() & kind.bits() != kind.bits() {
        return Err(Error::CapFlag);
    }
    if size == 0 {
        return Err(Error::CapFlag);
    }
    let start = kmem.info(0);
    let end = kmem.info(1);
    let last = vaddr.checked_add(size - 1).ok_or(Error::CapFlag)?;
    if vaddr < start || last > end {
        return Err(Error::CapFlag);
    }
    Ok(())
}

/// Activates a kernel function: checks the capability's call range and
/// forwards to the architecture port. The port's return value (never
/// negative on success) becomes the system call's. A port function that
/// context switches takes over the return registers itself; for the rest,
/// the value is placed here, before any switch could have happened.
pub fn kern_act(
    root: &RawCap,
    reg: &mut crate::arch::SavedState,
    cap_kern: usize,
    func_id: usize,
    sub_id: usize,
    param1: usize,
    param2: usize,
) -> KernResult {
    use crate::arch::RegFile;

    let kern_op = captbl::lookup(root, cap_kern, CapType::Kern)?;
    // Kernel-function capabilities have no sub-operation bits; the check is
    // frozen state plus call range.
    captbl::cap_check(kern_op, 0)?;
    let range = kern_op.flags();
    if func_id > abi::kern_flag_high(range) || func_id < abi::kern_flag_low(range) {
        return Err(Error::CapFlag);
    }
    let value = crate::arch::kern_func(reg, func_id, sub_id, param1, param2)?;
    reg.set_retval(value as isize);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KOTBL_SLOT_ORDER;

    #[test]
    fn quiescence_wraps_like_a_32_bit_counter() {
        let k = crate::startup::test_kernel(64);
        // Freshly stamped: not quiescent.
        let stamp = k.now();
        assert!(!k.quiescent(stamp));
        for _ in 0..QUIE_TIME + 1 {
            k.advance_timestamp();
        }
        assert!(k.quiescent(stamp));
        // A stamp "in the future" (as after a wrap) reads as quiescent only
        // once the distance exceeds the window in the short direction.
        let future = k.now().wrapping_add(2);
        assert!(!k.quiescent(future));
    }

    #[test]
    fn kmem_check_honors_range_and_mask() {
        let k = crate::startup::test_kernel(64);
        let base = k.kot.base();
        let boot = crate::startup::boot_captbl(k, 16).unwrap();
        kmem_boot_crt(
            boot,
            crate::startup::BOOT_CAPTBL_SELF,
            3,
            base,
            base + (8 << KOTBL_SLOT_ORDER),
            KmemFlags::THD | KmemFlags::SIG,
        )
        .unwrap();
        let kmem = captbl::lookup(boot, 3, CapType::Kmem).unwrap();

        assert!(kmem_check(kmem, KmemFlags::THD, base, 256).is_ok());
        assert_eq!(
            kmem_check(kmem, KmemFlags::PGTBL, base, 256),
            Err(Error::CapFlag),
            "create-mask must gate object kinds"
        );
        assert_eq!(
            kmem_check(kmem, KmemFlags::SIG, base + (8 << KOTBL_SLOT_ORDER), 256),
            Err(Error::CapFlag),
            "out-of-range creation must be refused"
        );
    }
}
