//! # Error Types
//!
//! Bus operations can fail in two independent ways: synchronously when the
//! operation is dispatched, and later when a result is delivered to a
//! registered callback. Each capability names both error types; a bus that
//! can never fail in one of the two ways uses [`Never`], which has no values
//! and therefore proves the error path unreachable.

use core::fmt;

/// The error type of an operation that cannot fail.
///
/// `Never` has no variants, so a `Result<T, Never>` is always `Ok`. Use
/// [`IntoOk::into_inner_ok`] to unwrap such results without a panic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Never {}

impl fmt::Display for Never {
    fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Never {
    fn format(&self, _: defmt::Formatter<'_>) {
        match *self {}
    }
}

/// A marker trait for types usable as the error half of a bus result.
///
/// Either a real error enum or [`Never`].
pub trait MaybeError: fmt::Debug {}

impl MaybeError for Never {}

impl<E: fmt::Debug> MaybeError for BusError<E> {}

/// Extracts the value of a result whose error type is uninhabited.
pub trait IntoOk<T> {
    /// Returns the contained `Ok` value.
    fn into_inner_ok(self) -> T;
}

impl<T> IntoOk<T> for Result<T, Never> {
    fn into_inner_ok(self) -> T {
        match self {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }
}

/// The primary error enum for bus operations.
///
/// It is generic over the driver error type `E`, allowing it to wrap
/// specific errors from the underlying peripheral (e.g., I2C, UART).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError<E> {
    /// An error occurred in the underlying driver.
    Driver(E),
    /// The outgoing queue has no room for another message.
    QueueFull,
    /// The payload does not fit into a single message of this bus.
    PayloadTooLarge,
    /// The address cannot be represented on this bus.
    InvalidAddress,
    /// The bus is already in use by the current context.
    Busy,
}

/// Allows `?` to lift driver errors into a `BusError`.
impl<E> From<E> for BusError<E> {
    fn from(err: E) -> Self {
        BusError::Driver(err)
    }
}

impl<E: fmt::Debug> fmt::Display for BusError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Driver(err) => write!(f, "driver error: {err:?}"),
            BusError::QueueFull => f.write_str("outgoing queue full"),
            BusError::PayloadTooLarge => f.write_str("payload too large"),
            BusError::InvalidAddress => f.write_str("invalid address"),
            BusError::Busy => f.write_str("bus busy"),
        }
    }
}
