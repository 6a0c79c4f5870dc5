use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};

use crate::scheduling::Timeout;

/// A single-assignment result slot.
///
/// The slot starts empty and is written at most once, typically by a
/// [`Callback`](super::Callback) obtained with `Callback::from(&slot)` and
/// handed to a bus. The waiting side polls it with a deadline; there is no
/// wake-up signal.
///
/// Writing a slot that already holds a value keeps the first value. Debug
/// builds treat the second write as a bug and panic.
pub struct AsyncValue<T, M: RawMutex = CriticalSectionRawMutex> {
    value: Mutex<M, RefCell<Option<T>>>,
}

impl<T, M: RawMutex> AsyncValue<T, M> {
    /// Creates an empty slot.
    pub const fn new() -> Self {
        Self {
            value: Mutex::new(RefCell::new(None)),
        }
    }

    /// Returns `true` once a value has been written.
    pub fn is_set(&self) -> bool {
        self.value.lock(|cell| cell.borrow().is_some())
    }

    /// Removes and returns the value, leaving the slot empty.
    ///
    /// An emptied slot may be written again.
    pub fn take(&self) -> Option<T> {
        self.value.lock(|cell| cell.borrow_mut().take())
    }
}

impl<T: Clone, M: RawMutex> AsyncValue<T, M> {
    /// Stores `value` unless the slot already holds one.
    pub fn set(&self, value: &T) {
        self.value.lock(|cell| {
            let mut slot = cell.borrow_mut();
            debug_assert!(slot.is_none(), "async value written twice");
            if slot.is_none() {
                *slot = Some(value.clone());
            }
        });
    }

    /// Returns a copy of the value, if any.
    pub fn get(&self) -> Option<T> {
        self.value.lock(|cell| cell.borrow().clone())
    }

    /// Polls the slot until it holds a value or `timeout` expires.
    pub fn wait(&self, timeout: Timeout) -> Option<T> {
        timeout.poll(|| self.get())
    }

    /// Like [`wait`](Self::wait), but calls `pump` before every check.
    ///
    /// Used when the value is produced by work the waiting context must
    /// drive itself, such as polling a bus.
    pub fn wait_with(&self, timeout: Timeout, mut pump: impl FnMut()) -> Option<T> {
        timeout.poll(|| {
            pump();
            self.get()
        })
    }
}

impl<T, M: RawMutex> Default for AsyncValue<T, M> {
    fn default() -> Self {
        Self::new()
    }
}
