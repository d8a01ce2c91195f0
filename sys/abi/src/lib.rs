// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything user level needs to talk to the kernel lives here: capability
//! type tags, capability-ID encoding, service numbers, error codes,
//! per-capability sub-operation flags, and the scheduling sentinels. The
//! kernel crate reuses these definitions so the two cannot drift apart.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Machine word width in bits. The whole ABI is expressed in terms of this so
/// that 32-bit and 64-bit targets share one definition.
pub const WORD_BITS: usize = usize::BITS as usize;

/// Number of parameter words a system call carries besides the packed
/// (descriptor, capability-ID) word.
pub const SYSCALL_PARAMS: usize = 3;

//
// Capability types
//

/// Type tag of a capability slot, stored in the top bits of its `TypeRef`
/// word. `Nop` doubles as the empty-slot marker: a slot is empty exactly when
/// its whole `TypeRef` word is zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(usize)]
pub enum CapType {
    /// Empty slot.
    Nop = 0,
    /// Kernel function call range.
    Kern = 1,
    /// Kernel memory range plus create-mask.
    Kmem = 2,
    /// Capability table.
    Captbl = 3,
    /// Page table.
    Pgtbl = 4,
    /// Process.
    Proc = 5,
    /// Thread.
    Thd = 6,
    /// Synchronous invocation port.
    Inv = 7,
    /// Signal endpoint.
    Sig = 8,
}

impl CapType {
    /// Decodes a type tag read out of a `TypeRef` word. Tags outside the
    /// known set only appear if kernel memory has been corrupted.
    pub fn from_tag(tag: usize) -> Option<Self> {
        Some(match tag {
            0 => Self::Nop,
            1 => Self::Kern,
            2 => Self::Kmem,
            3 => Self::Captbl,
            4 => Self::Pgtbl,
            5 => Self::Proc,
            6 => Self::Thd,
            7 => Self::Inv,
            8 => Self::Sig,
            _ => return None,
        })
    }
}

//
// Capability IDs
//

/// A decoded capability ID.
///
/// The raw form is a non-negative word. If the two-level flag bit (the high
/// bit of the half-word ID field, `CapId::TWO_LEVEL`) is clear, the value
/// indexes the current capability table directly. If it is set, the bits
/// above the quarter-word boundary select a capability-table capability in
/// the current table and the bits below select an entry inside that child
/// table. Each of the two indices is `WORD_BITS/4 - 1` bits wide, which also
/// bounds how many entries one table may have.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CapId {
    /// Directly indexes the current table.
    One(usize),
    /// `(outer, inner)`: outer selects a child captbl cap, inner an entry.
    Two(usize, usize),
}

impl CapId {
    /// Flag bit distinguishing the two encodings.
    pub const TWO_LEVEL: usize = 1 << (WORD_BITS / 2 - 1);
    /// Shift of the outer index in a two-level ID.
    pub const OUTER_SHIFT: usize = WORD_BITS / 4;
    /// Width mask of either index field in a two-level ID.
    pub const FIELD_MASK: usize = (1 << (WORD_BITS / 4 - 1)) - 1;
    /// Upper bound (inclusive) on the entry count of one capability table.
    pub const MAX_ENTRIES: usize = 1 << (WORD_BITS / 4 - 1);

    /// Decodes a raw capability ID word taken from a syscall parameter.
    /// Negative values are rejected; the arbitrary-thread sentinel is not a
    /// capability ID and must be special-cased by the caller.
    pub fn decode(raw: usize) -> Result<Self, Error> {
        if (raw as isize) < 0 {
            return Err(Error::CapRange);
        }
        if raw & Self::TWO_LEVEL == 0 {
            Ok(Self::One(raw))
        } else {
            Ok(Self::Two(
                (raw >> Self::OUTER_SHIFT) & Self::FIELD_MASK,
                raw & Self::FIELD_MASK,
            ))
        }
    }

    /// Builds the raw two-level form from an outer and inner index.
    pub const fn encode_two(outer: usize, inner: usize) -> usize {
        Self::TWO_LEVEL
            | ((outer & Self::FIELD_MASK) << Self::OUTER_SHIFT)
            | (inner & Self::FIELD_MASK)
    }
}

/// Sentinel thread "capability" accepted by the thread-switch call only:
/// let the scheduler pick whatever runnable thread is most important.
pub const THD_ARBITRARY: isize = -1;

//
// Service numbers
//

/// Enumeration of system call service numbers. The dispatcher reads these
/// out of the low bits of the syscall descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Svc {
    InvRet = 0,
    InvAct = 1,
    SigSnd = 2,
    SigRcv = 3,
    KernAct = 4,
    ThdSchedPrio = 5,
    ThdSchedFree = 6,
    ThdTimeXfer = 7,
    ThdSwt = 8,
    CaptblCrt = 9,
    CaptblDel = 10,
    CaptblFrz = 11,
    CaptblAdd = 12,
    CaptblRem = 13,
    PgtblCrt = 14,
    PgtblDel = 15,
    PgtblAdd = 16,
    PgtblRem = 17,
    PgtblCon = 18,
    PgtblDes = 19,
    ProcCrt = 20,
    ProcDel = 21,
    ProcCpt = 22,
    ProcPgt = 23,
    ThdCrt = 24,
    ThdDel = 25,
    ThdExecSet = 26,
    ThdHypSet = 27,
    ThdSchedBind = 28,
    ThdSchedRcv = 29,
    SigCrt = 30,
    SigDel = 31,
    InvCrt = 32,
    InvDel = 33,
    InvSet = 34,
}

/// We use an explicit `TryFrom` impl instead of a derive crate because the
/// kernel doesn't otherwise depend on one and this seems okay.
impl core::convert::TryFrom<u32> for Svc {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        Ok(match x {
            0 => Self::InvRet,
            1 => Self::InvAct,
            2 => Self::SigSnd,
            3 => Self::SigRcv,
            4 => Self::KernAct,
            5 => Self::ThdSchedPrio,
            6 => Self::ThdSchedFree,
            7 => Self::ThdTimeXfer,
            8 => Self::ThdSwt,
            9 => Self::CaptblCrt,
            10 => Self::CaptblDel,
            11 => Self::CaptblFrz,
            12 => Self::CaptblAdd,
            13 => Self::CaptblRem,
            14 => Self::PgtblCrt,
            15 => Self::PgtblDel,
            16 => Self::PgtblAdd,
            17 => Self::PgtblRem,
            18 => Self::PgtblCon,
            19 => Self::PgtblDes,
            20 => Self::ProcCrt,
            21 => Self::ProcDel,
            22 => Self::ProcCpt,
            23 => Self::ProcPgt,
            24 => Self::ThdCrt,
            25 => Self::ThdDel,
            26 => Self::ThdExecSet,
            27 => Self::ThdHypSet,
            28 => Self::ThdSchedBind,
            29 => Self::ThdSchedRcv,
            30 => Self::SigCrt,
            31 => Self::SigDel,
            32 => Self::InvCrt,
            33 => Self::InvDel,
            34 => Self::InvSet,
            _ => return Err(()),
        })
    }
}

/// Mask extracting the service number from the syscall descriptor.
pub const SVC_NUM_MASK: usize = 0x3F;
/// Shift of the descriptor's extra field (kernel-function sub-ID,
/// page-table-create num-order).
pub const SVC_EXTRA_SHIFT: usize = 6;

/// Packs the (descriptor, capability-ID) word of a system call. `extra` is
/// the descriptor payload above the service number: the 16-bit sub-ID for
/// kernel-function calls, the num-order for page-table creation, the
/// kernel-memory create-mask for delegation; zero elsewhere.
pub const fn pack_call(svc: Svc, extra: usize, capid: usize) -> usize {
    (((svc as usize) | (extra << SVC_EXTRA_SHIFT)) << (WORD_BITS / 2))
        | (capid & ((1 << (WORD_BITS / 2)) - 1))
}

/// Splits a packed call word into `(service number, extra, capability ID)`.
pub const fn unpack_call(word: usize) -> (u32, usize, usize) {
    let descriptor = word >> (WORD_BITS / 2);
    (
        (descriptor & SVC_NUM_MASK) as u32,
        descriptor >> SVC_EXTRA_SHIFT,
        word & ((1 << (WORD_BITS / 2)) - 1),
    )
}

//
// Parameter-word packing helpers
//

/// High half of a parameter word.
pub const fn param_d1(w: usize) -> usize {
    w >> (WORD_BITS / 2)
}

/// Low half of a parameter word.
pub const fn param_d0(w: usize) -> usize {
    w & ((1 << (WORD_BITS / 2)) - 1)
}

/// Second quarter of a parameter word (bits `W/4 .. W/2`).
pub const fn param_q1(w: usize) -> usize {
    (w >> (WORD_BITS / 4)) & ((1 << (WORD_BITS / 4)) - 1)
}

/// Lowest quarter of a parameter word.
pub const fn param_q0(w: usize) -> usize {
    w & ((1 << (WORD_BITS / 4)) - 1)
}

/// Packs two half-word values into one parameter word.
pub const fn pack_d(hi: usize, lo: usize) -> usize {
    (hi << (WORD_BITS / 2)) | (lo & ((1 << (WORD_BITS / 2)) - 1))
}

//
// Error taxonomy
//

/// Kernel error codes, returned to user level as negative words. The values
/// are consecutive within each family and are part of the ABI.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(isize)]
pub enum Error {
    /// Capability ID out of table bounds.
    CapRange = -1,
    /// Capability type does not match the operation.
    CapType = -2,
    /// Destination slot is already occupied.
    CapExist = -3,
    /// Slot is empty (or was cleared by a racing destroyer).
    CapNull = -4,
    /// Slot is frozen (or, for delete/remove, not frozen).
    CapFrozen = -5,
    /// Insufficient rights, or an illegal flag narrowing.
    CapFlag = -6,
    /// A reference count forbids the operation.
    CapRefcnt = -7,
    /// Quiescence has not elapsed since the freeze.
    CapQuie = -8,
    /// The backing kernel memory is already occupied.
    CapKotbl = -9,

    /// The architecture port refused a page-table operation.
    PgtHw = -10,
    /// Mapping or unmapping hit an incompatible entry.
    PgtMap = -11,
    /// An address or position is out of range or misaligned.
    PgtAddr = -12,
    /// Permission flags exceed what may be granted.
    PgtPerm = -13,

    /// Thread or process is in a state that forbids the operation.
    PthInvstate = -14,
    /// Priority out of the permitted range.
    PthPrio = -15,
    /// Lost a binding race against another core.
    PthConflict = -16,
    /// No scheduler notification pending, or illegal self-parenting.
    PthNotif = -17,
    /// A process or scheduler reference count forbids the operation.
    PthRefcnt = -18,
    /// The target thread is in the fault state.
    PthFault = -19,
    /// A time-budget addition would overflow.
    PthOverflow = -20,

    /// The signal counter is saturated.
    SivFull = -21,
    /// Invocation return with an empty invocation stack.
    SivEmpty = -22,
    /// Endpoint or port is busy (active invocation, blocked receiver,
    /// unknown receive option).
    SivAct = -23,
    /// Lost a CAS race on an endpoint, or a kernel send to a pure user
    /// endpoint.
    SivConflict = -24,
    /// The thread was freed from its binding while blocked.
    SivFree = -25,
    /// A boot thread attempted to block.
    SivBoot = -26,
    /// Fault-return attempted where the port forbids it, or the value a
    /// fault-return delivers to the invocation's caller.
    SivFault = -27,

    /// Kernel-object bitmap refused the mark or erase.
    KotBmp = -28,

    /// The architecture port failed.
    HalFail = -29,
}

impl Error {
    /// The signed word this error crosses the syscall boundary as.
    pub const fn code(self) -> isize {
        self as isize
    }
}

//
// Sub-operation flags
//

bitflags::bitflags! {
    /// Operations permitted through a capability-table capability.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CaptblFlags: usize {
        /// Create kernel objects into this table.
        const CRT = 1 << 0;
        /// Delete root capabilities out of this table.
        const DEL = 1 << 1;
        /// Freeze capabilities in this table.
        const FRZ = 1 << 2;
        /// Delegate capabilities out of this table.
        const ADD_SRC = 1 << 3;
        /// Delegate capabilities into this table.
        const ADD_DST = 1 << 4;
        /// Remove delegated capabilities from this table.
        const REM = 1 << 5;
        /// Use this table as a process's capability space at creation.
        const PROC_CRT = 1 << 6;
        /// Install this table into an existing process.
        const PROC_CPT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Operations permitted through a process capability.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ProcFlags: usize {
        /// Create invocation ports into this process.
        const INV = 1 << 0;
        /// Create threads into this process.
        const THD = 1 << 1;
        /// Replace this process's capability table.
        const CPT = 1 << 2;
        /// Replace this process's page table.
        const PGT = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Operations permitted through a thread capability.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ThdFlags: usize {
        /// Set entry point and stack, and clear a pending fault.
        const EXEC_SET = 1 << 0;
        /// Redirect the register save area.
        const HYP_SET = 1 << 1;
        /// Bind this thread under a scheduler thread.
        const SCHED_CHILD = 1 << 2;
        /// Use this thread as a scheduler parent.
        const SCHED_PARENT = 1 << 3;
        /// Change this thread's priority.
        const SCHED_PRIO = 1 << 4;
        /// Unbind this thread from its core.
        const SCHED_FREE = 1 << 5;
        /// Receive scheduler notifications on this thread.
        const SCHED_RCV = 1 << 6;
        /// Yield to this thread.
        const SWT = 1 << 7;
        /// Donate time out of this thread.
        const XFER_SRC = 1 << 8;
        /// Donate time into this thread.
        const XFER_DST = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Operations permitted through a signal-endpoint capability. Each
    /// receive variant is gated separately so a supervisor can hand out
    /// send-only or poll-only references.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SigFlags: usize {
        const SND = 1 << 0;
        /// Blocking single receive.
        const RCV_BS = 1 << 1;
        /// Blocking multi receive.
        const RCV_BM = 1 << 2;
        /// Non-blocking single receive.
        const RCV_NS = 1 << 3;
        /// Non-blocking multi receive.
        const RCV_NM = 1 << 4;
        const RCV = Self::RCV_BS.bits() | Self::RCV_BM.bits()
            | Self::RCV_NS.bits() | Self::RCV_NM.bits();
    }
}

bitflags::bitflags! {
    /// Operations permitted through an invocation-port capability.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct InvFlags: usize {
        const SET = 1 << 0;
        const ACT = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Create-mask of a kernel-memory capability: which kernel object kinds
    /// may be placed in the covered range.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct KmemFlags: usize {
        const CAPTBL = 1 << 0;
        const PGTBL = 1 << 1;
        const PROC = 1 << 2;
        const THD = 1 << 3;
        const SIG = 1 << 4;
        const INV = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Per-page permission flags, as stored in page-table entries and as
    /// granted by the low byte of a page-table capability's flag word.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFlags: usize {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const CACHEABLE = 1 << 3;
        const BUFFERABLE = 1 << 4;
        /// The mapping never changes; MPU ports may pin it in a region slot.
        const STATIC = 1 << 5;
    }
}

//
// Page-table capability flag word: [ high | low | op bits ].
//
// `high` and `low` bound the entry positions that may be operated on through
// the capability; the low byte carries the operation bits. The layout mirrors
// the capability-ID arrangement: position fields live above the low byte,
// split at `WORD_BITS/2 + 4`.
//

bitflags::bitflags! {
    /// Operation bits of a page-table capability (the low byte of its flag
    /// word).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PgtblFlags: usize {
        /// Delegate pages out of this table.
        const ADD_SRC = 1 << 0;
        /// Delegate pages into this table.
        const ADD_DST = 1 << 1;
        /// Unmap pages from this table.
        const REM = 1 << 2;
        /// Use this table as a construction parent.
        const CON_PARENT = 1 << 3;
        /// Construct this table into a parent.
        const CON_CHILD = 1 << 4;
        /// Destruct child tables out of this table.
        const DES = 1 << 5;
        /// Use this table as a process's address space at creation.
        const PROC_CRT = 1 << 6;
        /// Install this table into an existing process.
        const PROC_PGT = 1 << 7;
    }
}

/// Shift of the inclusive position range high bound in a page-table
/// capability flag word.
pub const PGTBL_RANGE_HIGH_SHIFT: usize = WORD_BITS / 2 + 4;
/// Shift of the inclusive position range low bound.
pub const PGTBL_RANGE_LOW_SHIFT: usize = 8;
/// Width mask of the position range low bound.
pub const PGTBL_RANGE_LOW_MASK: usize = (1 << (WORD_BITS / 2 - 4)) - 1;

/// Extracts the position-range high bound of a page-table cap flag word.
pub const fn pgtbl_flag_high(flags: usize) -> usize {
    flags >> PGTBL_RANGE_HIGH_SHIFT
}

/// Extracts the position-range low bound of a page-table cap flag word.
pub const fn pgtbl_flag_low(flags: usize) -> usize {
    (flags >> PGTBL_RANGE_LOW_SHIFT) & PGTBL_RANGE_LOW_MASK
}

/// Extracts the operation bits of a page-table cap flag word.
pub const fn pgtbl_flag_ops(flags: usize) -> usize {
    flags & 0xFF
}

/// Packs a page-table cap flag word from a position range and operation bits.
pub const fn pgtbl_flag_pack(high: usize, low: usize, ops: usize) -> usize {
    (high << PGTBL_RANGE_HIGH_SHIFT)
        | ((low & PGTBL_RANGE_LOW_MASK) << PGTBL_RANGE_LOW_SHIFT)
        | (ops & 0xFF)
}

/// The position range of a boot-time page-table capability: everything.
pub const PGTBL_FULL_RANGE: usize = !0 << PGTBL_RANGE_HIGH_SHIFT;

//
// Kernel-function capability flag word: [ high | low ] call-range halves.
//

/// Extracts the inclusive high bound of a kernel-function call range.
pub const fn kern_flag_high(flags: usize) -> usize {
    flags >> (WORD_BITS / 2)
}

/// Extracts the inclusive low bound of a kernel-function call range.
pub const fn kern_flag_low(flags: usize) -> usize {
    flags & ((1 << (WORD_BITS / 2)) - 1)
}

/// Packs a kernel-function call range.
pub const fn kern_flag_pack(high: usize, low: usize) -> usize {
    pack_d(high, low)
}

/// The call range of the boot-time kernel-function capability: everything.
pub const KERN_FULL_RANGE: usize = pack_d((1 << (WORD_BITS / 2)) - 1, 0);

//
// Kernel-memory delegation range packing: slot-granular [ start | end ]
// halves, where each half counts kernel-memory slots, not bytes.
//

/// Packs a kernel-memory delegation range from byte addresses. Both bounds
/// are slot-granular; `end` is exclusive.
pub const fn kmem_range_pack(start: usize, end: usize, slot_order: usize) -> usize {
    pack_d(start >> slot_order, end >> slot_order)
}

/// Unpacks a kernel-memory delegation range into byte addresses.
pub const fn kmem_range_unpack(range: usize, slot_order: usize) -> (usize, usize) {
    (
        param_d1(range) << slot_order,
        param_d0(range) << slot_order,
    )
}

//
// Signal receive options
//

/// The four receive disciplines of a signal endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(usize)]
pub enum SigOption {
    /// Block if empty; take one signal.
    BlockSingle = 0,
    /// Block if empty; take every pending signal.
    BlockMulti = 1,
    /// Never block; take at most one signal.
    PollSingle = 2,
    /// Never block; take every pending signal.
    PollMulti = 3,
}

impl core::convert::TryFrom<usize> for SigOption {
    type Error = Error;

    fn try_from(x: usize) -> Result<Self, Error> {
        Ok(match x {
            0 => Self::BlockSingle,
            1 => Self::BlockMulti,
            2 => Self::PollSingle,
            3 => Self::PollMulti,
            _ => return Err(Error::SivAct),
        })
    }
}

//
// Thread scheduling state and time sentinels
//

/// Externally visible thread scheduling states.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ThdState {
    /// The thread is executing on its core.
    Running,
    /// The thread is on the run queue, waiting for its priority to become
    /// the highest.
    Ready,
    /// The thread is blocked on a signal endpoint.
    Blocked,
    /// The thread has no time budget left.
    Timeout,
    /// The thread was stopped by an unrecoverable fault. Cleared by a
    /// subsequent exec-set.
    Fault,
}

/// Time budget of a boot thread. Never decremented, never revocable.
pub const INIT_TIME: usize = !0 >> 1;
/// Infinite time budget. Never decremented, revocable by an `INIT_TIME`
/// transfer.
pub const INF_TIME: usize = INIT_TIME - 1;
/// Exclusive upper bound on a finite time budget.
pub const MAX_TIME: usize = INF_TIME;

/// CPU-binding sentinel for a thread bound to no core.
pub const THD_UNBOUND: usize = 1 << (WORD_BITS - 1);

/// High marker OR-ed into a TID returned by sched-receive when the child's
/// pending state change is a fault rather than a timeout.
pub const TID_FAULT_FLAG: usize = 1 << (WORD_BITS - 2);

/// Saturation bound of a signal endpoint's pending-send counter.
pub const MAX_SIG_NUM: usize = !0 >> 1;

/// Exception information recorded into a faulting thread's context by the
/// architecture port, readable by its supervisor.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ExcInfo {
    /// Port-specific cause word.
    pub cause: usize,
    /// Faulting address, if the port can name one; zero otherwise.
    pub addr: usize,
    /// Port-specific auxiliary value.
    pub value: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capid_one_level_round_trip() {
        for raw in [0usize, 1, 17, CapId::MAX_ENTRIES - 1] {
            assert_eq!(CapId::decode(raw), Ok(CapId::One(raw)));
        }
    }

    #[test]
    fn capid_two_level_round_trip() {
        for (outer, inner) in [(0usize, 0usize), (3, 5), (127, 1)] {
            let raw = CapId::encode_two(outer, inner);
            assert_eq!(CapId::decode(raw), Ok(CapId::Two(outer, inner)));
        }
    }

    #[test]
    fn capid_rejects_negative() {
        assert_eq!(CapId::decode(!0), Err(Error::CapRange));
    }

    #[test]
    fn call_word_round_trip() {
        let word = pack_call(Svc::ThdTimeXfer, 0x15, 42);
        let (svc, extra, capid) = unpack_call(word);
        assert_eq!(svc, Svc::ThdTimeXfer as u32);
        assert_eq!(extra, 0x15);
        assert_eq!(capid, 42);
    }

    #[test]
    fn pgtbl_flag_word_round_trip() {
        let ops = (PgtblFlags::ADD_SRC | PgtblFlags::DES).bits();
        let word = pgtbl_flag_pack(20, 4, ops);
        assert_eq!(pgtbl_flag_high(word), 20);
        assert_eq!(pgtbl_flag_low(word), 4);
        assert_eq!(pgtbl_flag_ops(word), ops);
    }

    #[test]
    fn full_range_pgtbl_flag_accepts_any_position() {
        assert_eq!(pgtbl_flag_low(PGTBL_FULL_RANGE), 0);
        assert!(pgtbl_flag_high(PGTBL_FULL_RANGE) >= CapId::MAX_ENTRIES);
    }

    #[test]
    fn time_sentinels_are_ordered() {
        assert!(INF_TIME < INIT_TIME);
        assert!(MAX_TIME == INF_TIME);
        assert!((1 << 20) < INF_TIME);
    }
}
