// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel failures such that they can be found by
//! tooling.
//!
//! An in-kernel invariant violation — bitmap corruption on erase, an empty
//! run queue, refcount underflow — is not reported to user level. Instead
//! the kernel writes the reason into a fixed "epitaph" buffer and reboots
//! through the architecture port, so a debugger attached post-mortem can
//! recover the last words. Under test, `die` panics so the harness can
//! observe the message.

#[cfg(not(test))]
use core::fmt::{Display, Write};
#[cfg(not(test))]
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(test))]
const EPITAPH_LEN: usize = 128;

/// Set once by the first failure, giving tools a one-stop shop for triage.
#[cfg(not(test))]
static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

/// Records up to `EPITAPH_LEN` bytes of failure description, NUL-padded.
#[cfg(not(test))]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Records the reason and reboots the machine. Does not return.
#[cfg(not(test))]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(not(test))]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    if !KERNEL_HAS_FAILED.swap(true, Ordering::SeqCst) {
        // First failure: we are the only writer of the epitaph.
        let buf = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) };
        let mut writer = Eulogist { dest: buf };
        write!(writer, "{}", msg).ok();
    }
    crate::arch::reboot()
}

#[cfg(test)]
pub fn die(msg: impl core::fmt::Display) -> ! {
    panic!("kernel died: {}", msg);
}

#[cfg(not(test))]
struct Eulogist {
    dest: &'static mut [u8],
}

#[cfg(not(test))]
impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}
