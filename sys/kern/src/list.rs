// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive circular doubly-linked list node.
//!
//! The run queue, the scheduler notification chain and the invocation stack
//! all thread through nodes embedded in kernel objects, so membership costs
//! no allocation. A detached node links to itself, which doubles as the
//! "no pending notification" marker.
//!
//! All operations take raw pointers because the nodes live inside objects
//! that are reached through raw kernel addresses. Callers must guarantee the
//! usual intrusive-list conditions: nodes are initialized before use, a node
//! is never inserted while attached, and never detached twice without a
//! reinsert in between. Every node involved must stay at a fixed address for
//! as long as it is linked.

/// One link in an intrusive circular list. A list head is just a node that
/// is not embedded in a payload.
#[repr(C)]
#[derive(Debug)]
pub struct ListNode {
    prev: *mut ListNode,
    next: *mut ListNode,
}

impl ListNode {
    /// A node that must be initialized in place before first use. The null
    /// links make accidental use before `init` fault loudly rather than
    /// corrupt a list.
    pub const fn poisoned() -> Self {
        Self {
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
        }
    }

    /// Links `node` to itself, making it an empty head (or a detached
    /// member).
    ///
    /// # Safety
    ///
    /// `node` must point to a live `ListNode` at its final address.
    pub unsafe fn init(node: *mut ListNode) {
        (*node).prev = node;
        (*node).next = node;
    }

    /// Returns true if `node` is linked only to itself.
    ///
    /// # Safety
    ///
    /// `node` must point to an initialized `ListNode`.
    pub unsafe fn is_detached(node: *const ListNode) -> bool {
        (*node).next as *const ListNode == node
    }

    /// Returns the successor of `node`; for a head this is the first
    /// member, or the head itself when the list is empty.
    ///
    /// # Safety
    ///
    /// `node` must point to an initialized `ListNode`.
    pub unsafe fn first(node: *const ListNode) -> *mut ListNode {
        (*node).next
    }

    /// Inserts `node` between `prev` and `next`, which must be adjacent.
    ///
    /// # Safety
    ///
    /// All three pointers must be valid; `node` must be detached or freshly
    /// initialized; `(*prev).next == next` must hold.
    pub unsafe fn insert(node: *mut ListNode, prev: *mut ListNode, next: *mut ListNode) {
        (*next).prev = node;
        (*node).next = next;
        (*node).prev = prev;
        (*prev).next = node;
    }

    /// Inserts `node` at the front of the list headed by `head`.
    ///
    /// # Safety
    ///
    /// As for `insert`.
    pub unsafe fn push_front(node: *mut ListNode, head: *mut ListNode) {
        let next = (*head).next;
        Self::insert(node, head, next);
    }

    /// Inserts `node` at the back of the list headed by `head`.
    ///
    /// # Safety
    ///
    /// As for `insert`.
    pub unsafe fn push_back(node: *mut ListNode, head: *mut ListNode) {
        let prev = (*head).prev;
        Self::insert(node, prev, head);
    }

    /// Unlinks `node` from its list and re-links it to itself, so that
    /// `is_detached` is true afterwards.
    ///
    /// # Safety
    ///
    /// `node` must be a linked member of a well-formed list.
    pub unsafe fn detach(node: *mut ListNode) {
        let prev = (*node).prev;
        let next = (*node).next;
        (*prev).next = next;
        (*next).prev = prev;
        Self::init(node);
    }
}
