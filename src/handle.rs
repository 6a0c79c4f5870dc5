//! # Handle Registry
//!
//! An intrusive doubly linked list whose nodes live in caller-owned storage.
//!
//! Publishers need a list of subscribers, but the firmware may not allocate.
//! Instead of the list owning its nodes, whoever registers owns a [`Handle`]
//! and the list only threads pointers through them. Dropping the handle
//! unlinks it, so a subscription lasts exactly as long as its handle.
//!
//! ## Locking
//!
//! There is no list-wide lock. Every link carries its own lock, stored in the
//! node the link starts from: `X.next` and its lock live in `X`, `X.prev` and
//! its lock also live in `X`. A splice takes the node's own locks and then
//! the neighbours' locks with `try_acquire`; if any attempt fails, everything
//! is released and the splice starts over after a short backoff. No context
//! ever waits on a lock while holding another node's lock, so task and
//! interrupt contexts can share a chain without deadlocking.
//!
//! A [`Cursor`] holds the lock of the edge leading into the node it stands
//! on, which keeps that node alive and in place. Stepping forward locks the
//! next edge before releasing the current one.
//!
//! ## Pinning
//!
//! A linked node must not move. [`Handle`] is `!Unpin`: it is created empty,
//! may be moved around while detached, and is only linked through
//! `Pin<&mut Handle>`. [`Handle::relocate_from`] takes over another handle's
//! place in the chain when a registration has to change storage.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::{PhantomData, PhantomPinned};
use core::pin::Pin;
use core::ptr;

use crate::ipc::{Backoff, LockGuard, RawLock, SpinLock};

/// One direction of a node's linkage: a pointer and the lock guarding it.
struct Link<P, L> {
    ptr: UnsafeCell<*const P>,
    lock: L,
}

impl<P, L: RawLock> Link<P, L> {
    const fn new() -> Self {
        Self {
            ptr: UnsafeCell::new(ptr::null()),
            lock: L::INIT,
        }
    }

    /// # Safety
    ///
    /// The caller must hold `self.lock`.
    unsafe fn get(&self) -> *const P {
        unsafe { *self.ptr.get() }
    }

    /// # Safety
    ///
    /// The caller must hold `self.lock`.
    unsafe fn set(&self, ptr: *const P) {
        unsafe { *self.ptr.get() = ptr };
    }
}

/// The head of a chain of [`Handle`]s.
///
/// The root carries no payload, only the link to the first node. Handles
/// borrow the root, so it always outlives the nodes linked into it.
pub struct HandleChainRoot<T, L: RawLock = SpinLock> {
    next: Link<Node<T, L>, L>,
}

// SAFETY: payloads are only handed out by shared reference, and every link is
// accessed under its lock.
unsafe impl<T: Send, L: RawLock + Send> Send for HandleChainRoot<T, L> {}
unsafe impl<T: Send + Sync, L: RawLock + Sync> Sync for HandleChainRoot<T, L> {}

impl<T, L: RawLock> HandleChainRoot<T, L> {
    /// Creates an empty chain.
    pub const fn new() -> Self {
        Self { next: Link::new() }
    }

    /// Links `slot` directly after the root, carrying `payload`.
    ///
    /// A slot that is already linked is removed first and its old payload
    /// dropped.
    pub fn insert<'r>(&'r self, slot: Pin<&mut Handle<'r, T, L>>, payload: T) {
        let node = &slot.node;
        drop(unsafe { node.unlink() });
        // SAFETY: the node is detached, so nothing else can observe the
        // payload, and the pin keeps the node in place while linked.
        unsafe {
            *node.payload.get() = Some(payload);
            node.link_after(self);
        }
    }

    /// Returns a cursor standing on the first node.
    pub fn cursor(&self) -> Cursor<'_, T, L> {
        let guard = LockGuard::new(&self.next.lock);
        // SAFETY: guarded by the lock just taken.
        let current = unsafe { self.next.get() };
        Cursor {
            guard: (!current.is_null()).then_some(guard),
            current,
            _root: PhantomData,
        }
    }

    /// Calls `f` with the payload of every node, in chain order.
    ///
    /// `f` runs while an edge lock is held. It must not unlink the node it is
    /// given, nor insert directly after the node preceding it.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        let mut cursor = self.cursor();
        while let Some(payload) = cursor.current() {
            f(payload);
            cursor.move_next();
        }
    }

    /// Returns the first non-`None` result of `f`, in chain order.
    ///
    /// The same restrictions as [`for_each`](Self::for_each) apply.
    pub fn find_map<R>(&self, mut f: impl FnMut(&T) -> Option<R>) -> Option<R> {
        let mut cursor = self.cursor();
        while let Some(payload) = cursor.current() {
            if let Some(found) = f(payload) {
                return Some(found);
            }
            cursor.move_next();
        }
        None
    }

    /// Counts the nodes by walking the chain.
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.for_each(|_| count += 1);
        count
    }

    /// Returns `true` if no node is linked.
    pub fn is_empty(&self) -> bool {
        let _guard = LockGuard::new(&self.next.lock);
        // SAFETY: guarded.
        unsafe { self.next.get().is_null() }
    }
}

impl<T, L: RawLock> Default for HandleChainRoot<T, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, L: RawLock> fmt::Debug for HandleChainRoot<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleChainRoot")
            .field("empty", &self.is_empty())
            .finish()
    }
}

struct Node<T, L: RawLock> {
    /// Outgoing link, shaped like a root so predecessors can be either.
    head: HandleChainRoot<T, L>,
    prev: Link<HandleChainRoot<T, L>, L>,
    payload: UnsafeCell<Option<T>>,
}

impl<T, L: RawLock> Node<T, L> {
    const fn new() -> Self {
        Self {
            head: HandleChainRoot::new(),
            prev: Link::new(),
            payload: UnsafeCell::new(None),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self as *const Self as usize)
    }

    fn is_linked(&self) -> bool {
        let _guard = LockGuard::new(&self.prev.lock);
        // SAFETY: guarded.
        unsafe { !self.prev.get().is_null() }
    }

    /// Links a detached node after `pred`.
    ///
    /// # Safety
    ///
    /// `self` must be detached, pinned, and exclusively owned by the caller.
    /// `pred` must be a root or a linked node that stays linked for the call.
    unsafe fn link_after(&self, pred: &HandleChainRoot<T, L>) {
        let mut backoff = self.backoff();
        while unsafe { self.try_link_after(pred) }.is_none() {
            backoff.spin();
        }
    }

    unsafe fn try_link_after(&self, pred: &HandleChainRoot<T, L>) -> Option<()> {
        let _own_prev = LockGuard::try_new(&self.prev.lock)?;
        let _own_next = LockGuard::try_new(&self.head.next.lock)?;
        let _pred_next = LockGuard::try_new(&pred.next.lock)?;

        let succ_ptr = unsafe { pred.next.get() };
        // SAFETY: a linked successor stays alive while its incoming edge lock
        // (held above) is taken.
        let succ = unsafe { succ_ptr.as_ref() };
        let _succ_prev = match succ {
            Some(succ) => Some(LockGuard::try_new(&succ.prev.lock)?),
            None => None,
        };

        // SAFETY: all four touched links are locked.
        unsafe {
            if let Some(succ) = succ {
                succ.prev.set(&self.head);
            }
            self.head.next.set(succ_ptr);
            self.prev.set(pred);
            pred.next.set(self);
        }
        Some(())
    }

    /// Unlinks the node and returns its payload. Detached nodes are left
    /// untouched.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own the handle containing this node.
    unsafe fn unlink(&self) -> Option<T> {
        let mut backoff = self.backoff();
        loop {
            if let Some(payload) = unsafe { self.try_unlink() } {
                return payload;
            }
            backoff.spin();
        }
    }

    unsafe fn try_unlink(&self) -> Option<Option<T>> {
        let _own_prev = LockGuard::try_new(&self.prev.lock)?;
        let _own_next = LockGuard::try_new(&self.head.next.lock)?;

        // SAFETY: own links are locked; neighbours stay alive while the
        // links pointing at them are locked.
        let Some(pred) = (unsafe { self.prev.get().as_ref() }) else {
            return Some(None);
        };
        let succ_ptr = unsafe { self.head.next.get() };
        let succ = unsafe { succ_ptr.as_ref() };

        let _pred_next = LockGuard::try_new(&pred.next.lock)?;
        let _succ_prev = match succ {
            Some(succ) => Some(LockGuard::try_new(&succ.prev.lock)?),
            None => None,
        };

        unsafe {
            pred.next.set(succ_ptr);
            if let Some(succ) = succ {
                succ.prev.set(pred);
            }
            self.prev.set(ptr::null());
            self.head.next.set(ptr::null());
            Some((*self.payload.get()).take())
        }
    }

    /// Moves `src` into this node's storage: its chain position and payload.
    ///
    /// # Safety
    ///
    /// `self` must be detached and pinned, and the caller must exclusively
    /// own both handles.
    unsafe fn take_over(&self, src: &Self) {
        let mut backoff = self.backoff();
        while unsafe { self.try_take_over(src) }.is_none() {
            backoff.spin();
        }
    }

    unsafe fn try_take_over(&self, src: &Self) -> Option<()> {
        let _src_prev = LockGuard::try_new(&src.prev.lock)?;
        let _src_next = LockGuard::try_new(&src.head.next.lock)?;

        let Some(pred) = (unsafe { src.prev.get().as_ref() }) else {
            return Some(());
        };
        let succ_ptr = unsafe { src.head.next.get() };
        let succ = unsafe { succ_ptr.as_ref() };

        let _pred_next = LockGuard::try_new(&pred.next.lock)?;
        let _succ_prev = match succ {
            Some(succ) => Some(LockGuard::try_new(&succ.prev.lock)?),
            None => None,
        };

        // SAFETY: `self` is unreachable until `pred.next` points at it, and
        // every path to it goes through a lock held here.
        unsafe {
            self.prev.set(pred);
            self.head.next.set(succ_ptr);
            pred.next.set(self);
            if let Some(succ) = succ {
                succ.prev.set(&self.head);
            }
            *self.payload.get() = (*src.payload.get()).take();
            src.prev.set(ptr::null());
            src.head.next.set(ptr::null());
        }
        Some(())
    }

    /// Swaps the payload of a linked node with `payload`.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own the handle containing this node.
    unsafe fn swap_payload(&self, payload: &mut Option<T>) {
        let mut backoff = self.backoff();
        while unsafe { self.try_swap_payload(payload) }.is_none() {
            backoff.spin();
        }
    }

    unsafe fn try_swap_payload(&self, payload: &mut Option<T>) -> Option<()> {
        let _own_prev = LockGuard::try_new(&self.prev.lock)?;
        // Cursors read the payload under the incoming edge lock.
        let _pred_next = match unsafe { self.prev.get().as_ref() } {
            Some(pred) => Some(LockGuard::try_new(&pred.next.lock)?),
            None => None,
        };
        unsafe { core::mem::swap(&mut *self.payload.get(), payload) };
        Some(())
    }
}

/// A registration token owning one node of a [`HandleChainRoot`].
///
/// The node is unlinked when the handle is dropped. Handles are created
/// empty and detached; a registration call links them through a pinned
/// reference, typically obtained with [`core::pin::pin!`] or `Box::pin`.
///
/// ```ignore
/// let mut handle = pin!(bus.listen_handle());
/// bus.listen(handle.as_mut(), Callback::new(&driver, Driver::on_message))?;
/// // `driver` receives messages until `handle` goes out of scope.
/// ```
pub struct Handle<'r, T, L: RawLock = SpinLock> {
    node: Node<T, L>,
    _root: PhantomData<&'r HandleChainRoot<T, L>>,
    _pinned: PhantomPinned,
}

// SAFETY: the payload is moved between contexts only by the owner, and
// shared access only ever yields `&T`.
unsafe impl<T: Send, L: RawLock + Send> Send for Handle<'_, T, L> {}
unsafe impl<T: Send + Sync, L: RawLock + Sync> Sync for Handle<'_, T, L> {}

/// Returned when inserting after a handle that is not in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NotLinked;

impl fmt::Display for NotLinked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("handle is not linked into a chain")
    }
}

impl<'r, T, L: RawLock> Handle<'r, T, L> {
    /// Creates an empty, detached handle.
    pub const fn new() -> Self {
        Self {
            node: Node::new(),
            _root: PhantomData,
            _pinned: PhantomPinned,
        }
    }

    /// Returns `true` while the handle is part of a chain.
    pub fn is_linked(&self) -> bool {
        self.node.is_linked()
    }

    /// Returns the payload of a linked handle.
    pub fn get(&self) -> Option<&T> {
        // SAFETY: the payload is only written through `&mut` access to this
        // handle, which cannot coexist with `&self`.
        unsafe { (*self.node.payload.get()).as_ref() }
    }

    /// Links `slot` directly after this handle, carrying `payload`.
    ///
    /// A slot that is already linked is removed first and its old payload
    /// dropped.
    pub fn insert_after(
        self: Pin<&Self>,
        slot: Pin<&mut Self>,
        payload: T,
    ) -> Result<(), NotLinked> {
        if !self.is_linked() {
            return Err(NotLinked);
        }
        let node = &slot.node;
        // SAFETY: `slot` is exclusively borrowed and pinned. `self` stays
        // linked because unlinking it requires a mutable borrow.
        unsafe {
            drop(node.unlink());
            *node.payload.get() = Some(payload);
            node.link_after(&self.node.head);
        }
        Ok(())
    }

    /// Unlinks the handle and returns its payload.
    ///
    /// Returns `None` for a detached handle.
    pub fn remove(self: Pin<&mut Self>) -> Option<T> {
        // SAFETY: exclusively borrowed.
        unsafe { self.node.unlink() }
    }

    /// Moves `src` into this handle, taking over its place in the chain.
    ///
    /// This is the counterpart of a move constructor: afterwards this handle
    /// sits exactly where `src` was, with `src`'s payload, and `src` is empty
    /// and detached. A cursor elsewhere in the chain sees the moved payload
    /// once, at its unchanged position. If this handle was linked, it is
    /// removed first and its payload dropped.
    pub fn relocate_from(self: Pin<&mut Self>, src: Pin<&mut Self>) {
        // SAFETY: both handles are exclusively borrowed and pinned, and
        // `self` is detached before taking over.
        unsafe {
            drop(self.node.unlink());
            self.node.take_over(&src.node);
        }
    }

    /// Moves `src`'s payload into this handle, keeping this handle's place.
    ///
    /// This is the counterpart of a move assignment. `src` is unlinked first,
    /// then its payload replaces the current one at this handle's position;
    /// the old payload is dropped. The two steps never hold the same lock,
    /// so adjacent handles need no special treatment.
    ///
    /// A detached handle behaves as [`relocate_from`](Self::relocate_from).
    /// Assigning from an empty `src` leaves this handle empty and detached.
    pub fn assign_from(self: Pin<&mut Self>, src: Pin<&mut Self>) {
        if !self.is_linked() {
            self.relocate_from(src);
            return;
        }
        // SAFETY: both handles are exclusively borrowed.
        let mut payload = unsafe { src.node.unlink() };
        if payload.is_none() {
            drop(self.remove());
            return;
        }
        unsafe { self.node.swap_payload(&mut payload) };
        drop(payload);
    }
}

impl<T, L: RawLock> Default for Handle<'_, T, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, L: RawLock> Drop for Handle<'_, T, L> {
    fn drop(&mut self) {
        // SAFETY: the handle is being destroyed by its owner.
        drop(unsafe { self.node.unlink() });
    }
}

impl<T: fmt::Debug, L: RawLock> fmt::Debug for Handle<'_, T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("payload", &self.get())
            .finish()
    }
}

/// A forward, lock-coupling position in a chain.
///
/// While the cursor stands on a node, it holds the lock of the link leading
/// into that node, so the node can neither be unlinked nor relocated until
/// the cursor moves on. Nodes inserted ahead of the cursor may or may not be
/// visited; every node that stays linked is visited exactly once.
pub struct Cursor<'a, T, L: RawLock> {
    guard: Option<LockGuard<'a, L>>,
    current: *const Node<T, L>,
    _root: PhantomData<&'a HandleChainRoot<T, L>>,
}

impl<T, L: RawLock> Cursor<'_, T, L> {
    /// The payload of the node the cursor stands on, or `None` at the end.
    pub fn current(&self) -> Option<&T> {
        // SAFETY: the held edge lock keeps the current node linked and its
        // payload unchanged.
        let node = unsafe { self.current.as_ref() }?;
        unsafe { (*node.payload.get()).as_ref() }
    }

    /// Steps to the next node. Does nothing at the end of the chain.
    pub fn move_next(&mut self) {
        // SAFETY: see `current`. The next edge lock lives in the current
        // node, which stays alive until that lock is released.
        let Some(node) = (unsafe { self.current.as_ref() }) else {
            return;
        };
        let next_guard = LockGuard::new(&node.head.next.lock);
        let next = unsafe { node.head.next.get() };
        match self.guard.as_mut() {
            Some(guard) => guard.hand_over(next_guard),
            None => self.guard = Some(next_guard),
        }
        self.current = next;
        if next.is_null() {
            self.guard = None;
        }
    }
}
