//! Registry-backed implementations of the Listen, Request and Process
//! capabilities.
//!
//! A concrete bus embeds the mixins it needs, forwards its capability
//! methods to them, and calls the `feed_*` methods from its receive path.
//! Feed listeners first: requesters and processors may reuse the buffer the
//! message lives in.
//!
//! Callbacks run while the feed holds an edge lock of the chain. They must
//! not drop their own handle, and must not register on the same mixin.

use core::fmt;
use core::pin::Pin;

use super::{MessageFilter, RequestIssuer, ResponseIssuer};
use crate::error::Never;
use crate::handle::{Handle, HandleChainRoot};
use crate::ipc::{Callback, RawLock, SpinLock};

/// Payload of a listener registration.
pub struct ListenHandleData<'c, M, E> {
    callback: Callback<'c, Result<M, E>>,
    filter: Callback<'c, Result<M, E>, bool>,
}

impl<M, E> fmt::Debug for ListenHandleData<'_, M, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenHandleData")
            .field("callback", &self.callback)
            .field("filter", &self.filter)
            .finish()
    }
}

/// The handle type of [`ListenMixin`] registrations.
pub type ListenHandle<'b, 'c, M, E, L = SpinLock> = Handle<'b, ListenHandleData<'c, M, E>, L>;

/// Default Listen capability.
pub struct ListenMixin<'c, M, E, L: RawLock = SpinLock> {
    listeners: HandleChainRoot<ListenHandleData<'c, M, E>, L>,
}

impl<'c, M, E, L: RawLock> ListenMixin<'c, M, E, L> {
    pub const fn new() -> Self {
        Self {
            listeners: HandleChainRoot::new(),
        }
    }

    /// Links `slot` as a listener.
    pub fn listen<'b>(
        &'b self,
        slot: Pin<&mut ListenHandle<'b, 'c, M, E, L>>,
        callback: Callback<'c, Result<M, E>>,
        filter: Callback<'c, Result<M, E>, bool>,
    ) -> Result<(), Never> {
        self.listeners
            .insert(slot, ListenHandleData { callback, filter });
        Ok(())
    }

    /// Offers `msg` to every listener whose filter accepts it.
    ///
    /// Returns the number of callbacks invoked.
    pub fn feed_listeners(&self, msg: &Result<M, E>) -> usize {
        let mut invoked = 0;
        self.listeners.for_each(|entry| {
            if entry.filter.call(msg) {
                entry.callback.call(msg);
                invoked += 1;
            }
        });
        if invoked == 0 {
            debug!("message dropped: no listener accepted it");
        }
        invoked
    }
}

impl<M, E, L: RawLock> Default for ListenMixin<'_, M, E, L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload of a pending request.
pub struct RequestHandleData<'c, Res, E, F> {
    filter: F,
    callback: Callback<'c, Result<Res, E>>,
}

impl<Res, E, F: fmt::Debug> fmt::Debug for RequestHandleData<'_, Res, E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandleData")
            .field("filter", &self.filter)
            .field("callback", &self.callback)
            .finish()
    }
}

/// The handle type of [`RequestMixin`] registrations.
pub type RequestHandle<'b, 'c, Res, E, F, L = SpinLock> =
    Handle<'b, RequestHandleData<'c, Res, E, F>, L>;

/// Default Request capability.
///
/// `F` is the filter type produced by the bus's [`RequestIssuer`].
pub struct RequestMixin<'c, Res, E, F, L: RawLock = SpinLock> {
    requesters: HandleChainRoot<RequestHandleData<'c, Res, E, F>, L>,
}

impl<'c, Res, E, F, L: RawLock> RequestMixin<'c, Res, E, F, L> {
    pub const fn new() -> Self {
        Self {
            requesters: HandleChainRoot::new(),
        }
    }

    /// Issues `req` through `issuer` and links `slot` to await responses.
    ///
    /// The slot is left untouched if the request cannot be issued.
    pub fn request<'b, Req, Buf, I>(
        &'b self,
        slot: Pin<&mut RequestHandle<'b, 'c, Res, E, F, L>>,
        issuer: &I,
        req: &Req,
        callback: Callback<'c, Result<Res, E>>,
        buffer: Buf,
    ) -> Result<(), I::Error>
    where
        I: RequestIssuer<Req, Buf, Filter = F>,
    {
        let filter = issuer.issue_request(req, buffer)?;
        self.requesters
            .insert(slot, RequestHandleData { filter, callback });
        Ok(())
    }

    /// Delivers `res` to every pending request whose filter matches.
    ///
    /// Several requests may match one response. Returns the number of
    /// callbacks invoked.
    pub fn feed_requesters(&self, res: &Result<Res, E>) -> usize
    where
        F: MessageFilter<Res, E>,
    {
        let mut invoked = 0;
        self.requesters.for_each(|entry| {
            if entry.filter.matches(res) {
                entry.callback.call(res);
                invoked += 1;
            }
        });
        if invoked == 0 {
            debug!("response dropped: no pending request matched");
        }
        invoked
    }
}

impl<Res, E, F, L: RawLock> Default for RequestMixin<'_, Res, E, F, L> {
    fn default() -> Self {
        Self::new()
    }
}

type ProcessCallback<'c, Req, Res, E> = Callback<'c, Result<Req, E>, Option<Res>>;

/// The handle type of [`ProcessMixin`] registrations.
pub type ProcessHandle<'b, 'c, Req, Res, E, L = SpinLock> =
    Handle<'b, ProcessCallback<'c, Req, Res, E>, L>;

/// Default Process capability.
pub struct ProcessMixin<'c, Req, Res, E, L: RawLock = SpinLock> {
    processors: HandleChainRoot<ProcessCallback<'c, Req, Res, E>, L>,
}

impl<'c, Req, Res, E, L: RawLock> ProcessMixin<'c, Req, Res, E, L> {
    pub const fn new() -> Self {
        Self {
            processors: HandleChainRoot::new(),
        }
    }

    /// Links `slot` as a processor.
    pub fn process<'b>(
        &'b self,
        slot: Pin<&mut ProcessHandle<'b, 'c, Req, Res, E, L>>,
        callback: ProcessCallback<'c, Req, Res, E>,
    ) -> Result<(), Never> {
        self.processors.insert(slot, callback);
        Ok(())
    }

    /// Offers `req` to the processors in chain order until one answers.
    ///
    /// The first response is sent through `issuer` once the chain has been
    /// released; later processors are not consulted. Returns whether a
    /// response was sent.
    pub fn feed_processors<I>(&self, req: &Result<Req, E>, issuer: &I) -> bool
    where
        I: ResponseIssuer<Req, Res>,
    {
        let Some(res) = self.processors.find_map(|processor| processor.call(req)) else {
            debug!("request dropped: no processor answered");
            return false;
        };
        match req {
            Ok(req) => {
                issuer.issue_response(req, &res);
                true
            }
            Err(_) => {
                warn!("response to a failed request dropped");
                false
            }
        }
    }
}

impl<Req, Res, E, L: RawLock> Default for ProcessMixin<'_, Req, Res, E, L> {
    fn default() -> Self {
        Self::new()
    }
}
