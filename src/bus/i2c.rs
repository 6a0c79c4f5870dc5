//! I2C controller bus over `embedded-hal`.
//!
//! I2C transfers are controller-driven and complete before the call
//! returns, so [`I2cBus`] needs no registry: it implements Send and Request
//! directly and invokes the callback before returning. Nothing is ever
//! registered, so the request handle is `()`.

use core::cell::RefCell;
use core::pin::Pin;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::{NoopRawMutex, RawMutex};
use embedded_hal::i2c::{Error, ErrorKind, I2c};

use super::{BasicMessage, RequestBus, SendBus};
use crate::error::{BusError, Never};
use crate::ipc::Callback;

/// Highest 7-bit device address.
const MAX_ADDRESS: u32 = 0x7F;

/// A shared I2C controller.
///
/// Message addresses are 7-bit device addresses. Callbacks run while the
/// controller is held, so starting another transfer from a callback fails
/// with [`BusError::Busy`].
///
/// The transfer and its callback run inside `M`'s lock. The default
/// `NoopRawMutex` keeps the bus to a single task and leaves interrupts
/// enabled, which interrupt- or DMA-driven HAL drivers need. Sharing the bus
/// between tasks requires an explicit `M`; `CriticalSectionRawMutex` masks
/// interrupts for the whole transaction.
pub struct I2cBus<I, M: RawMutex = NoopRawMutex> {
    i2c: Mutex<M, RefCell<I>>,
}

impl<I, M: RawMutex> I2cBus<I, M> {
    pub const fn new(i2c: I) -> Self {
        Self {
            i2c: Mutex::new(RefCell::new(i2c)),
        }
    }

    /// Returns the underlying driver.
    pub fn release(self) -> I {
        self.i2c.into_inner().into_inner()
    }
}

impl<I: I2c, M: RawMutex> I2cBus<I, M> {
    fn with_device<R>(
        &self,
        address: u32,
        f: impl FnOnce(&mut I, u8) -> Result<R, BusError<ErrorKind>>,
    ) -> Result<R, BusError<ErrorKind>> {
        if address > MAX_ADDRESS {
            return Err(BusError::InvalidAddress);
        }
        let address = address as u8;
        self.i2c.lock(|cell| {
            let mut i2c = cell.try_borrow_mut().map_err(|_| BusError::Busy)?;
            f(&mut i2c, address)
        })
    }
}

fn driver_error<E: Error>(err: E) -> BusError<ErrorKind> {
    let kind = err.kind();
    debug!("i2c transfer failed: {}", kind);
    BusError::Driver(kind)
}

impl<'c, I: I2c, M: RawMutex> SendBus<'c, BasicMessage<'c>> for I2cBus<I, M> {
    type SendHandle = ();
    type SendDispatchError = BusError<ErrorKind>;
    type SendCallbackError = Never;

    /// Writes the payload to the device.
    fn send(
        &self,
        msg: &BasicMessage<'c>,
        callback: Callback<'c, Result<BasicMessage<'c>, Never>>,
    ) -> Result<(), BusError<ErrorKind>> {
        self.with_device(msg.address, |i2c, address| {
            i2c.write(address, msg.data).map_err(driver_error)?;
            callback.call(&Ok(*msg));
            Ok(())
        })
    }
}

impl<'c, I: I2c, M: RawMutex> RequestBus<'c, BasicMessage<'c>, BasicMessage<'c>, &'c mut [u8]>
    for I2cBus<I, M>
{
    type RequestHandle<'b>
        = ()
    where
        Self: 'b;
    type RequestDispatchError = BusError<ErrorKind>;
    type RequestCallbackError = Never;

    /// Writes the request payload, then reads `buffer.len()` bytes back in
    /// one transaction. The response handed to `callback` borrows `buffer`.
    fn request<'b>(
        &'b self,
        _slot: Pin<&mut ()>,
        req: &BasicMessage<'c>,
        callback: Callback<'c, Result<BasicMessage<'c>, Never>>,
        buffer: &'c mut [u8],
    ) -> Result<(), BusError<ErrorKind>> {
        self.with_device(req.address, move |i2c, address| {
            i2c.write_read(address, req.data, buffer)
                .map_err(driver_error)?;
            let data: &'c [u8] = buffer;
            callback.call(&Ok(BasicMessage::new(req.address, data)));
            Ok(())
        })
    }
}
