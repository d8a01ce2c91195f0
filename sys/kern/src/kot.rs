// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-object table: the placement bitmap over the kernel memory region.
//!
//! Every kernel object occupies a whole number of `KOTBL_SLOT_SIZE`-byte
//! slots, and each slot has one bit here. Creating an object marks its
//! slots; destroying it erases them. Because `mark` fails unless the whole
//! range was free, two objects can never share backing storage, no matter
//! how creations race across cores.
//!
//! Only the boundary words of a range need compare-and-swap: a competing
//! marker must claim its own boundary word first, and the winner of that CAS
//! owns the overlap. Middle words are still claimed with CAS-from-zero so a
//! straddling racer is detected, but the unroll of a failed mark may use
//! plain stores, since the failed marker is the only writer of the bits it
//! set.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{Error, WORD_BITS};

use crate::config::{KOTBL_SLOT_ORDER, KOTBL_SLOT_SIZE};
use crate::KernResult;

/// Bits of a word from `bit` (inclusive) upward.
const fn mask_from(bit: usize) -> usize {
    !0 << bit
}

/// Bits of a word up to `bit` (inclusive).
const fn mask_to(bit: usize) -> usize {
    if bit >= WORD_BITS - 1 {
        !0
    } else {
        (1 << (bit + 1)) - 1
    }
}

/// The placement bitmap. Storage is supplied by startup out of kernel
/// static memory; the table itself never allocates.
pub struct Kot {
    /// Kernel address where the covered region starts.
    base: usize,
    /// Covered region size in bytes.
    size: usize,
    bits: &'static [AtomicUsize],
}

impl Kot {
    /// Builds the table over `[base, base + size)` using `bits` as backing.
    /// `base` and `size` must be slot-aligned and `bits` large enough for
    /// one bit per slot.
    pub fn new(base: usize, size: usize, bits: &'static [AtomicUsize]) -> Kot {
        uassert!(base % KOTBL_SLOT_SIZE == 0);
        uassert!(size % KOTBL_SLOT_SIZE == 0);
        let slots = size >> KOTBL_SLOT_ORDER;
        uassert!(bits.len() * WORD_BITS >= slots);
        for word in bits {
            word.store(0, Ordering::Relaxed);
        }
        Kot { base, size, bits }
    }

    /// Rounds an object size up to whole slots.
    pub const fn round(size: usize) -> usize {
        (size + KOTBL_SLOT_SIZE - 1) & !(KOTBL_SLOT_SIZE - 1)
    }

    /// Start of the covered region.
    pub fn base(&self) -> usize {
        self.base
    }

    /// One-past-the-end of the covered region.
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Computes the word/mask geometry of `[kaddr, kaddr + size)`, or
    /// refuses it for misalignment or range violations.
    fn extent(&self, kaddr: usize, size: usize) -> Result<Extent, Error> {
        if kaddr & (KOTBL_SLOT_SIZE - 1) != 0 || size == 0 {
            return Err(Error::KotBmp);
        }
        if kaddr < self.base || size > self.size || kaddr - self.base > self.size - size {
            return Err(Error::KotBmp);
        }
        let first = (kaddr - self.base) >> KOTBL_SLOT_ORDER;
        let last = (kaddr + size - 1 - self.base) >> KOTBL_SLOT_ORDER;
        Ok(Extent {
            start_word: first / WORD_BITS,
            start_mask: mask_from(first % WORD_BITS),
            end_word: last / WORD_BITS,
            end_mask: mask_to(last % WORD_BITS),
        })
    }

    /// Tries to OR `mask` into word `index`, demanding all masked bits were
    /// clear.
    fn claim(&self, index: usize, mask: usize) -> bool {
        let word = &self.bits[index];
        let mut old = word.load(Ordering::Relaxed);
        loop {
            if old & mask != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                old,
                old | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(v) => old = v,
            }
        }
    }

    /// Marks `[kaddr, kaddr + size)` as occupied. Fails without any effect
    /// if any slot in the range is already marked, or the range is
    /// malformed.
    pub fn mark(&self, kaddr: usize, size: usize) -> KernResult<()> {
        let ext = self.extent(kaddr, size)?;

        if ext.start_word == ext.end_word {
            let mask = ext.start_mask & ext.end_mask;
            if self.claim(ext.start_word, mask) {
                return Ok(());
            }
            return Err(Error::KotBmp);
        }

        if !self.claim(ext.start_word, ext.start_mask) {
            return Err(Error::KotBmp);
        }
        let mut claimed_to = ext.start_word;
        let mut failed = false;
        for index in ext.start_word + 1..ext.end_word {
            if !self.claim(index, !0) {
                failed = true;
                break;
            }
            claimed_to = index;
        }
        if !failed && !self.claim(ext.end_word, ext.end_mask) {
            failed = true;
        }

        if failed {
            // Unroll. Middle words are wholly ours, so plain stores suffice;
            // the boundary word may be shared and needs an atomic clear.
            for index in ext.start_word + 1..=claimed_to {
                self.bits[index].store(0, Ordering::Relaxed);
            }
            self.bits[ext.start_word].fetch_and(!ext.start_mask, Ordering::AcqRel);
            return Err(Error::KotBmp);
        }
        Ok(())
    }

    /// Erases the mark over `[kaddr, kaddr + size)`. The whole range must
    /// currently be marked; anything else means the placement accounting
    /// has been corrupted, which callers on the destruction path treat as
    /// kernel death.
    pub fn erase(&self, kaddr: usize, size: usize) -> KernResult<()> {
        let ext = self.extent(kaddr, size)?;

        if ext.start_word == ext.end_word {
            let mask = ext.start_mask & ext.end_mask;
            if self.bits[ext.start_word].load(Ordering::Relaxed) & mask != mask {
                return Err(Error::KotBmp);
            }
            self.bits[ext.start_word].fetch_and(!mask, Ordering::AcqRel);
            return Ok(());
        }

        if self.bits[ext.start_word].load(Ordering::Relaxed) & ext.start_mask != ext.start_mask {
            return Err(Error::KotBmp);
        }
        for index in ext.start_word + 1..ext.end_word {
            if self.bits[index].load(Ordering::Relaxed) != !0 {
                return Err(Error::KotBmp);
            }
        }
        if self.bits[ext.end_word].load(Ordering::Relaxed) & ext.end_mask != ext.end_mask {
            return Err(Error::KotBmp);
        }

        self.bits[ext.start_word].fetch_and(!ext.start_mask, Ordering::AcqRel);
        for index in ext.start_word + 1..ext.end_word {
            self.bits[index].store(0, Ordering::Relaxed);
        }
        self.bits[ext.end_word].fetch_and(!ext.end_mask, Ordering::AcqRel);
        Ok(())
    }

    /// True if every slot of the range is currently marked. Test aid.
    #[cfg(test)]
    pub fn is_marked(&self, kaddr: usize, size: usize) -> bool {
        let ext = match self.extent(kaddr, size) {
            Ok(e) => e,
            Err(_) => return false,
        };
        if ext.start_word == ext.end_word {
            let mask = ext.start_mask & ext.end_mask;
            return self.bits[ext.start_word].load(Ordering::Relaxed) & mask == mask;
        }
        if self.bits[ext.start_word].load(Ordering::Relaxed) & ext.start_mask != ext.start_mask {
            return false;
        }
        for index in ext.start_word + 1..ext.end_word {
            if self.bits[index].load(Ordering::Relaxed) != !0 {
                return false;
            }
        }
        self.bits[ext.end_word].load(Ordering::Relaxed) & ext.end_mask == ext.end_mask
    }

    /// Number of marked slots. Test aid.
    #[cfg(test)]
    pub fn popcount(&self) -> usize {
        self.bits
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

struct Extent {
    start_word: usize,
    start_mask: usize,
    end_word: usize,
    end_mask: usize,
}
