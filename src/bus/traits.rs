//! Bus capability contracts.
//!
//! Registration methods take the caller's handle slot as a pinned reference
//! and link it into the bus; the registration lasts until the handle is
//! dropped. Callbacks are bound for `'c`, so everything they point at must
//! outlive the bus.

use core::pin::Pin;

use crate::error::MaybeError;
use crate::ipc::Callback;

/// A bus that can send messages.
pub trait SendBus<'c, M> {
    /// Returned on successful dispatch. May be `()` for buses that need no
    /// state to complete a transmission.
    type SendHandle;
    type SendDispatchError: MaybeError;
    type SendCallbackError: MaybeError;

    /// Dispatches `msg`.
    ///
    /// `callback` is invoked once the transmission completes, with the sent
    /// message or the error that prevented delivery.
    fn send(
        &self,
        msg: &M,
        callback: Callback<'c, Result<M, Self::SendCallbackError>>,
    ) -> Result<Self::SendHandle, Self::SendDispatchError>;
}

/// A bus that can report every incoming message.
pub trait ListenBus<'c, M> {
    type ListenHandle<'b>: Default
    where
        Self: 'b;
    type ListenDispatchError: MaybeError;
    type ListenCallbackError: MaybeError;

    /// Registers `callback` for every incoming message accepted by `filter`.
    ///
    /// The bus may use the filter to skip invoking the callback; it is not a
    /// security boundary.
    fn listen_filtered<'b>(
        &'b self,
        slot: Pin<&mut Self::ListenHandle<'b>>,
        callback: Callback<'c, Result<M, Self::ListenCallbackError>>,
        filter: Callback<'c, Result<M, Self::ListenCallbackError>, bool>,
    ) -> Result<(), Self::ListenDispatchError>;

    /// Registers `callback` for every incoming message.
    fn listen<'b>(
        &'b self,
        slot: Pin<&mut Self::ListenHandle<'b>>,
        callback: Callback<'c, Result<M, Self::ListenCallbackError>>,
    ) -> Result<(), Self::ListenDispatchError> {
        self.listen_filtered(slot, callback, NullFilter.into())
    }
}

/// A bus that can request data from a remote device.
///
/// One request may be answered more than once; `callback` fires for every
/// matching response until the handle is dropped.
pub trait RequestBus<'c, Req, Res, Buf> {
    type RequestHandle<'b>: Default
    where
        Self: 'b;
    type RequestDispatchError: MaybeError;
    type RequestCallbackError: MaybeError;

    /// Sends `req` and registers `callback` for its responses.
    ///
    /// `buffer` is where the bus may place the response payload.
    fn request<'b>(
        &'b self,
        slot: Pin<&mut Self::RequestHandle<'b>>,
        req: &Req,
        callback: Callback<'c, Result<Res, Self::RequestCallbackError>>,
        buffer: Buf,
    ) -> Result<(), Self::RequestDispatchError>;
}

/// A bus that can answer requests from remote devices.
pub trait ProcessBus<'c, Req, Res> {
    type ProcessHandle<'b>: Default
    where
        Self: 'b;
    type ProcessDispatchError: MaybeError;
    type ProcessCallbackError: MaybeError;

    /// Registers a processor.
    ///
    /// The processor is offered every incoming message that may be a request
    /// and returns `Some` response if it handles it. Only the first response
    /// produced for a request is sent.
    fn process<'b>(
        &'b self,
        slot: Pin<&mut Self::ProcessHandle<'b>>,
        callback: Callback<'c, Result<Req, Self::ProcessCallbackError>, Option<Res>>,
    ) -> Result<(), Self::ProcessDispatchError>;
}

/// Puts a request on the wire.
///
/// Required by [`RequestMixin`](super::mixin::RequestMixin): the returned
/// filter recognises responses to this particular request and may carry
/// request-specific state such as a sequence number.
pub trait RequestIssuer<Req, Buf> {
    type Filter;
    type Error;

    fn issue_request(&self, req: &Req, buffer: Buf) -> Result<Self::Filter, Self::Error>;
}

/// Puts a response on the wire.
///
/// Required by [`ProcessMixin`](super::mixin::ProcessMixin). `req` carries
/// whatever addressing the response needs.
pub trait ResponseIssuer<Req, Res> {
    fn issue_response(&self, req: &Req, res: &Res);
}

/// Decides whether an incoming message is of interest.
pub trait MessageFilter<M, E> {
    fn matches(&self, msg: &Result<M, E>) -> bool;
}

impl<M, E> MessageFilter<M, E> for Callback<'_, Result<M, E>, bool> {
    fn matches(&self, msg: &Result<M, E>) -> bool {
        self.call(msg)
    }
}

/// A filter that accepts everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullFilter;

impl NullFilter {
    pub fn accept<A: ?Sized>(&self, _: &A) -> bool {
        true
    }
}

impl<M, E> MessageFilter<M, E> for NullFilter {
    fn matches(&self, _: &Result<M, E>) -> bool {
        true
    }
}

impl<A: ?Sized> From<NullFilter> for Callback<'_, A, bool> {
    fn from(_: NullFilter) -> Self {
        Callback::new(&NullFilter, NullFilter::accept::<A>)
    }
}
