//! # Allocation-free Bus Core for On-Board Computers
//!
//! `obc-bus` is the communication core of a microcontroller firmware. It lets
//! independent components exchange messages over heterogeneous buses (I2C,
//! radio links, in-memory loopback) without dynamic memory allocation and
//! without a mandatory scheduler.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** Every registration lives in storage owned by
//!   the caller; queues are sized at compile time with `heapless`.
//! - **Capability traits:** A bus implements any subset of
//!   [`SendBus`](bus::SendBus), [`ListenBus`](bus::ListenBus),
//!   [`RequestBus`](bus::RequestBus) and [`ProcessBus`](bus::ProcessBus);
//!   consumers ask only for what they use.
//! - **Typed callbacks:** [`Callback`](ipc::Callback) binds a method to an
//!   owner whose lifetime is checked at compile time.
//! - **Concurrent registry:** [`HandleChainRoot`](handle::HandleChainRoot)
//!   is an intrusive list with one lock per edge, so registrations can come
//!   and go while the chain is being walked from another context.
//! - **Interrupt-safe:** The default [`SpinLock`](ipc::SpinLock) is built on
//!   `critical-section`; [`AtomicLock`](ipc::AtomicLock) serves task-only
//!   code on targets with compare-and-swap.
//!
//! ## Architecture
//!
//! ### 1. Registering for messages
//!
//! Handles are slots in the caller's storage. They are pinned while linked
//! and unregister themselves when dropped:
//!
//! ```ignore
//! let listener = Telemetry::new();
//! let bus = LoopbackBus::<8, 32>::new();
//!
//! let mut handle = pin!(bus.listen_handle());
//! bus.listen(handle.as_mut(), Callback::new(&listener, Telemetry::on_frame))?;
//! ```
//!
//! ### 2. Implementing a bus
//!
//! Buses with a receive path compose the mixins from [`bus::mixin`] and feed
//! them from their receive routine; see [`bus::loopback`] for a complete
//! example. Buses whose transfers complete synchronously, like
//! [`bus::i2c::I2cBus`], implement the traits directly.
//!
//! ## Lifetime Model
//!
//! Callbacks borrow their owners for `'c`, and the bus stores callbacks, so
//! owners must be declared before the bus. Handles borrow the bus for `'b`
//! and must be declared after it.
//!
//! ## Cargo Features
//!
//! - `defmt`: diagnostics through `defmt`, and `defmt::Format` on public
//!   types.
//! - `log`: diagnostics through the `log` facade.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod bus;
pub mod error;
pub mod handle;
pub mod ipc;
pub mod scheduling;

pub use bus::{BasicMessage, ListenBus, Message, PlainData, ProcessBus, RequestBus, SendBus};
pub use error::{BusError, IntoOk, MaybeError, Never};
pub use handle::{Handle, HandleChainRoot};
pub use ipc::Callback;
