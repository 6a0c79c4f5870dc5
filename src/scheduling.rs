//! Deadlines and bounded polling.
//!
//! Waiting on a bus result is always explicit and bounded: a task creates a
//! [`Timeout`] and polls until the result shows up or the deadline passes.
//! Raw retry loops should go through [`Timeout::poll`] so a missing device
//! cannot stall a task forever.

use embassy_time::{Duration, Instant};

/// A deadline that starts running when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timeout {
    deadline: Instant,
}

impl Timeout {
    /// Starts a timeout that expires after `period`.
    ///
    /// Periods that overflow the clock never expire.
    pub fn new(period: Duration) -> Self {
        let deadline = Instant::now().checked_add(period).unwrap_or(Instant::MAX);
        Self { deadline }
    }

    /// Returns `true` once the period has elapsed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Busy-waits for the rest of the period.
    pub fn block(&self) {
        while !self.expired() {
            core::hint::spin_loop();
        }
    }

    /// Calls `f` until it yields a value or the timeout expires.
    ///
    /// `f` is not called at all if the timeout has already expired.
    pub fn poll<T>(&self, mut f: impl FnMut() -> Option<T>) -> Option<T> {
        while !self.expired() {
            if let Some(value) = f() {
                return Some(value);
            }
        }
        None
    }

    /// Calls `f` until it returns `true` or the timeout expires.
    ///
    /// Returns whether `f` succeeded in time.
    pub fn poll_until(&self, mut f: impl FnMut() -> bool) -> bool {
        self.poll(|| f().then_some(())).is_some()
    }
}

/// Makes a scope last at least a given period.
///
/// The delay happens when the guard is dropped, so the time spent inside the
/// scope counts towards the period:
///
/// ```ignore
/// {
///     let _frame = DelayGuard::new(Duration::from_millis(10));
///     send_to_motors();
/// } // at least 10 ms after the guard was created
/// ```
///
/// Dropping an unnamed guard straight away gives a plain delay.
#[must_use = "the delay happens when the guard is dropped"]
pub struct DelayGuard {
    timeout: Timeout,
}

impl DelayGuard {
    /// Starts a guard for `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            timeout: Timeout::new(period),
        }
    }
}

/// Spends whatever is left of a polling timeout.
impl From<Timeout> for DelayGuard {
    fn from(timeout: Timeout) -> Self {
        Self { timeout }
    }
}

impl Drop for DelayGuard {
    fn drop(&mut self) {
        if self.timeout.expired() {
            trace!("delay guard overran its period");
        }
        self.timeout.block();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_expired() {
        let timeout = Timeout::new(Duration::from_ticks(0));
        assert!(timeout.expired());
        assert_eq!(timeout.remaining(), Duration::from_ticks(0));
    }

    #[test]
    fn poll_returns_first_value() {
        let timeout = Timeout::new(Duration::from_secs(1));
        let mut calls = 0;
        let got = timeout.poll(|| {
            calls += 1;
            (calls == 4).then_some(calls)
        });
        assert_eq!(got, Some(4));
        assert!(!timeout.expired());
    }

    #[test]
    fn poll_until_gives_up_after_deadline() {
        let timeout = Timeout::new(Duration::from_millis(2));
        assert!(!timeout.poll_until(|| false));
        assert!(timeout.expired());
    }

    #[test]
    fn delay_guard_waits_out_period() {
        let start = Instant::now();
        drop(DelayGuard::new(Duration::from_millis(3)));
        assert!(start.elapsed() >= Duration::from_millis(3));
    }

    #[test]
    fn huge_period_never_expires() {
        let timeout = Timeout::new(Duration::MAX);
        assert!(!timeout.expired());
    }
}
