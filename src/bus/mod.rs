//! # Buses
//!
//! A bus abstracts a communication medium up to, but not including, the
//! application layer. Rather than one large interface, a bus implements any
//! subset of four capabilities, and consumers require only the subset they
//! use:
//!
//! - [`SendBus`]: one-shot transmission.
//! - [`ListenBus`]: observe every incoming message.
//! - [`RequestBus`]: send a request and receive the response(s).
//! - [`ProcessBus`]: answer requests from remote devices.
//!
//! Every capability reports failure twice over: synchronously, when the
//! operation is dispatched, and later through the `Result` handed to the
//! registered callback. Buses that cannot fail one way use
//! [`Never`](crate::error::Never) for it.
//!
//! Registry-backed buses compose the [`mixin`] types, which implement
//! Listen, Request and Process on top of a
//! [`HandleChainRoot`](crate::handle::HandleChainRoot).
//!
//! Socket-style multi-party addressing is deliberately not supported.

use core::fmt;
use core::mem::size_of;

pub mod i2c;
pub mod loopback;
pub mod mixin;
mod traits;

pub use traits::{
    ListenBus, MessageFilter, NullFilter, ProcessBus, RequestBus, RequestIssuer, ResponseIssuer,
    SendBus,
};

/// A message sent or received on a bus.
///
/// Addresses need not name a physical device: a bus may reserve addresses
/// for multicast, loopback, or discarding.
pub trait Message {
    /// Where the message goes to or comes from.
    type Address: Copy + Eq + fmt::Debug;
    /// The payload.
    type Data: Default + Clone;

    /// Returns the address.
    fn address(&self) -> Self::Address;

    /// Returns the payload.
    fn data(&self) -> &Self::Data;
}

/// The message type for buses without special requirements.
///
/// Richer message types should convert to and from this one where feasible,
/// so users can ignore features they do not need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BasicMessage<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

impl<'a> BasicMessage<'a> {
    pub const fn new(address: u32, data: &'a [u8]) -> Self {
        Self { address, data }
    }
}

impl<'a> Message for BasicMessage<'a> {
    type Address = u32;
    type Data = &'a [u8];

    fn address(&self) -> u32 {
        self.address
    }

    fn data(&self) -> &&'a [u8] {
        &self.data
    }
}

/// A fixed-layout value that can be viewed as raw bytes.
///
/// Used to put C-style records on a bus without a serialisation step. For
/// portability, implementors should be tightly packed and built from
/// fixed-size integers.
///
/// # Safety
///
/// The type must contain no padding bytes, and every bit pattern of
/// `size_of::<Self>()` bytes must be a valid value.
pub unsafe trait PlainData: Copy {
    /// The bytes of `self`, exactly `size_of::<Self>()` of them.
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: no padding, so every byte is initialised.
        unsafe { core::slice::from_raw_parts((self as *const Self).cast(), size_of::<Self>()) }
    }

    /// Mutable bytes of `self`, for receiving straight into a value.
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: any bit pattern is a valid value.
        unsafe { core::slice::from_raw_parts_mut((self as *mut Self).cast(), size_of::<Self>()) }
    }

    /// Rebuilds a value from its bytes.
    ///
    /// Returns `None` unless `bytes` is exactly `size_of::<Self>()` long.
    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked; any bit pattern is valid.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast()) })
    }
}

macro_rules! impl_plain_data {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl PlainData for $ty {})*
    };
}

impl_plain_data!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, usize, isize);

unsafe impl<T: PlainData, const N: usize> PlainData for [T; N] {}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, packed)]
    #[derive(Clone, Copy)]
    struct Reading {
        foo: u16,
        bar: u8,
    }

    unsafe impl PlainData for Reading {}

    #[test]
    fn struct_view_has_exact_size() {
        let reading = Reading {
            foo: 0x1234,
            bar: 0x56,
        };
        assert_eq!(reading.as_bytes().len(), 3);
        assert_eq!(reading.as_bytes()[2], 0x56);
        assert_eq!(Reading::from_bytes(&[0; 2]).map(|r| r.bar), None);
        assert_eq!(Reading::from_bytes(&[0; 4]).map(|r| r.bar), None);
    }

    #[test]
    fn receive_into_value() {
        let mut word = 0u32;
        word.as_bytes_mut().copy_from_slice(&0xAABB_CCDDu32.to_ne_bytes());
        assert_eq!(word, 0xAABB_CCDD);
        assert_eq!(u32::from_bytes(word.as_bytes()), Some(0xAABB_CCDD));
    }

    #[test]
    fn arrays_are_plain() {
        let words = [1u16, 2, 3];
        let bytes = words.as_bytes();
        assert_eq!(bytes.len(), 6);
        assert_eq!(<[u16; 3]>::from_bytes(bytes), Some(words));
    }

    #[test]
    fn basic_message_accessors() {
        let msg = BasicMessage::new(0x76, &[0xD0]);
        assert_eq!(msg.address(), 0x76);
        assert_eq!(*msg.data(), &[0xD0][..]);
    }
}
