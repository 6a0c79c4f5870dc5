//! Edge locks for the handle registry.
//!
//! The registry never blocks on an event; it only spins for a short time
//! while another context finishes a splice. Two lock flavours are provided:
//!
//! - [`SpinLock`] masks interrupts (through `critical-section`) for as long as
//!   it is held, so it may be shared between tasks and interrupt handlers.
//! - [`AtomicLock`] is a plain compare-exchange spin lock for registries only
//!   touched from task context.

use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::RestoreState;

/// A lock that can be taken without blocking.
///
/// # Safety
///
/// `try_acquire` must only return `Some` if no other holder exists, and
/// `release` must only be called by the current holder with the state
/// returned by the matching acquisition (or a state exchanged through
/// [`LockGuard::hand_over`]).
pub unsafe trait RawLock {
    /// An unlocked instance.
    const INIT: Self;

    /// Context saved on acquisition and restored on release.
    type State: Copy;

    /// Attempts to take the lock without waiting.
    fn try_acquire(&self) -> Option<Self::State>;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock.
    unsafe fn release(&self, state: Self::State);

    /// Takes the lock, spinning until it becomes free.
    ///
    /// Each failed attempt fully backs out, so an interrupt-safe lock leaves
    /// interrupts enabled between attempts.
    fn acquire(&self) -> Self::State {
        loop {
            if let Some(state) = self.try_acquire() {
                return state;
            }
            core::hint::spin_loop();
        }
    }
}

/// Interrupt-safe spin lock.
///
/// While held, the current context is inside a critical section, so neither
/// the scheduler nor an interrupt handler can preempt the holder. The flag is
/// only touched inside that critical section, which makes the lock usable on
/// cores without compare-and-swap.
///
/// # Warning
///
/// Holding the lock disables interrupts; guarded sections must be short.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates an unlocked spin lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawLock for SpinLock {
    const INIT: Self = Self::new();

    type State = RestoreState;

    fn try_acquire(&self) -> Option<RestoreState> {
        // SAFETY: every path below either hands the state to the caller, who
        // must pass it back to `release`, or releases it immediately.
        let state = unsafe { critical_section::acquire() };
        if self.locked.load(Ordering::Relaxed) {
            unsafe { critical_section::release(state) };
            return None;
        }
        // The critical section orders the flag accesses.
        self.locked.store(true, Ordering::Relaxed);
        Some(state)
    }

    unsafe fn release(&self, state: RestoreState) {
        self.locked.store(false, Ordering::Release);
        // SAFETY: `state` originates from the acquisition of a lock the
        // caller holds.
        unsafe { critical_section::release(state) };
    }
}

/// Task-only spin lock.
///
/// Does not mask interrupts. Must never be taken from an interrupt handler
/// that can preempt a holder on the same core.
#[cfg(target_has_atomic = "8")]
pub struct AtomicLock {
    locked: AtomicBool,
}

#[cfg(target_has_atomic = "8")]
impl AtomicLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

#[cfg(target_has_atomic = "8")]
impl Default for AtomicLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_has_atomic = "8")]
unsafe impl RawLock for AtomicLock {
    const INIT: Self = Self::new();

    type State = ();

    fn try_acquire(&self) -> Option<()> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ())
    }

    unsafe fn release(&self, _state: ()) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Scoped ownership of a [`RawLock`].
///
/// Guards taken in sequence must be released in reverse order, which Rust's
/// drop order gives for locals. The one exception, releasing an older lock
/// while keeping a newer one, goes through [`LockGuard::hand_over`].
#[must_use]
pub struct LockGuard<'a, L: RawLock> {
    lock: &'a L,
    state: L::State,
}

impl<'a, L: RawLock> LockGuard<'a, L> {
    /// Takes `lock`, spinning while it is held elsewhere.
    pub fn new(lock: &'a L) -> Self {
        let state = lock.acquire();
        Self { lock, state }
    }

    /// Takes `lock` if it is free.
    pub fn try_new(lock: &'a L) -> Option<Self> {
        lock.try_acquire().map(|state| Self { lock, state })
    }

    /// Replaces this guard with `next`, releasing the lock held so far.
    ///
    /// The saved states are exchanged first: the guard released now carries
    /// the state of the newer acquisition, and the surviving guard restores
    /// the context that preceded both. For [`SpinLock`] this keeps interrupts
    /// masked until the last lock of the pair is released.
    pub fn hand_over(&mut self, mut next: LockGuard<'a, L>) {
        core::mem::swap(&mut self.state, &mut next.state);
        let released = core::mem::replace(self, next);
        drop(released);
    }
}

impl<L: RawLock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while the lock is held.
        unsafe { self.lock.release(self.state) };
    }
}

/// Bounded spin used between retries of a contended splice.
///
/// The delay grows with each failed attempt and is offset by a per-node seed
/// so two nodes contending for each other's locks stop retrying in lockstep.
pub(crate) struct Backoff {
    step: u32,
    seed: u32,
}

impl Backoff {
    const MAX_SHIFT: u32 = 6;

    pub(crate) fn new(seed: usize) -> Self {
        Self {
            step: 0,
            seed: ((seed >> 4) & 0x7) as u32,
        }
    }

    pub(crate) fn spin(&mut self) {
        let spins = (1u32 << self.step.min(Self::MAX_SHIFT)) + self.seed;
        for _ in 0..spins {
            core::hint::spin_loop();
        }
        self.step = self.step.saturating_add(1);
        if self.step == Self::MAX_SHIFT {
            trace!("handle splice contended {} times", self.step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_lock_excludes_second_holder() {
        let lock = SpinLock::new();
        let guard = LockGuard::try_new(&lock).expect("free lock");
        assert!(LockGuard::try_new(&lock).is_none());
        drop(guard);
        assert!(LockGuard::try_new(&lock).is_some());
    }

    #[test]
    fn spin_lock_survives_repeated_cycles() {
        let lock = SpinLock::new();
        for _ in 0..3 {
            let state = lock.try_acquire().expect("free lock");
            assert!(lock.try_acquire().is_none());
            unsafe { lock.release(state) };
        }
        drop(LockGuard::new(&lock));
    }

    #[test]
    fn hand_over_releases_previous_lock() {
        let first = SpinLock::new();
        let second = SpinLock::new();

        let mut guard = LockGuard::new(&first);
        guard.hand_over(LockGuard::new(&second));

        assert!(LockGuard::try_new(&first).is_some());
        assert!(LockGuard::try_new(&second).is_none());
        drop(guard);
        assert!(LockGuard::try_new(&second).is_some());
    }

    #[test]
    fn atomic_lock_try_acquire() {
        let lock = AtomicLock::new();
        let guard = LockGuard::new(&lock);
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }
}
