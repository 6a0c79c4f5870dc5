//! # In-Memory Loopback Bus
//!
//! Every frame sent on a [`LoopbackBus`] is received by the same bus. It
//! implements all four capabilities through the [mixins](super::mixin) and
//! is used to exercise bus consumers on the host, and as the local endpoint
//! for tasks on the same board talking to each other.
//!
//! Transmission is queued: [`send`](SendBus::send) only enqueues the frame,
//! and [`LoopbackBus::poll`] delivers queued frames, completing sends and
//! feeding listeners, processors and pending requests. Frames from outside
//! can be injected with [`LoopbackBus::inject`], as a receive interrupt
//! would.

use core::cell::{Cell, RefCell};
use core::pin::Pin;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::{Deque, Vec};

use super::mixin::{
    ListenHandle, ListenMixin, ProcessHandle, ProcessMixin, RequestHandle, RequestMixin,
};
use super::{
    ListenBus, Message, MessageFilter, ProcessBus, RequestBus, RequestIssuer, ResponseIssuer,
    SendBus,
};
use crate::error::{BusError, Never};
use crate::handle::Handle;
use crate::ipc::{Callback, RawLock, SpinLock};

/// What a frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameKind {
    /// An unsolicited message.
    Message,
    /// A request, tagged with the sequence number its responses echo.
    Request(u16),
    /// A response to the request with this sequence number.
    Response(u16),
}

/// A message on a [`LoopbackBus`], carrying at most `MTU` payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame<const MTU: usize> {
    pub address: u16,
    pub kind: FrameKind,
    pub data: Vec<u8, MTU>,
}

impl<const MTU: usize> Frame<MTU> {
    /// Builds a plain message frame.
    pub fn new(address: u16, data: &[u8]) -> Result<Self, BusError<Never>> {
        Self::with_kind(address, FrameKind::Message, data)
    }

    /// Builds a frame of the given kind.
    pub fn with_kind(address: u16, kind: FrameKind, data: &[u8]) -> Result<Self, BusError<Never>> {
        let data = Vec::from_slice(data).map_err(|_| BusError::PayloadTooLarge)?;
        Ok(Self {
            address,
            kind,
            data,
        })
    }
}

impl<const MTU: usize> Default for Frame<MTU> {
    fn default() -> Self {
        Self {
            address: 0,
            kind: FrameKind::Message,
            data: Vec::new(),
        }
    }
}

impl<const MTU: usize> Message for Frame<MTU> {
    type Address = u16;
    type Data = Vec<u8, MTU>;

    fn address(&self) -> u16 {
        self.address
    }

    fn data(&self) -> &Vec<u8, MTU> {
        &self.data
    }
}

/// Recognises the responses to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResponseFilter {
    address: u16,
    seq: u16,
}

impl<const MTU: usize, E> MessageFilter<Frame<MTU>, E> for ResponseFilter {
    fn matches(&self, msg: &Result<Frame<MTU>, E>) -> bool {
        matches!(msg, Ok(frame) if frame.address == self.address && frame.kind == FrameKind::Response(self.seq))
    }
}

type SendCallback<'c, const MTU: usize> = Callback<'c, Result<Frame<MTU>, Never>>;

struct Pending<'c, const MTU: usize> {
    frame: Frame<MTU>,
    completion: Option<SendCallback<'c, MTU>>,
}

/// A bus that receives everything it sends.
///
/// `DEPTH` bounds the number of queued frames, `MTU` the payload of each
/// frame, and `L` selects the lock used by the registries.
pub struct LoopbackBus<'c, const DEPTH: usize, const MTU: usize, L: RawLock = SpinLock> {
    queue: Mutex<CriticalSectionRawMutex, RefCell<Deque<Pending<'c, MTU>, DEPTH>>>,
    next_seq: Mutex<CriticalSectionRawMutex, Cell<u16>>,
    listeners: ListenMixin<'c, Frame<MTU>, Never, L>,
    requesters: RequestMixin<'c, Frame<MTU>, Never, ResponseFilter, L>,
    processors: ProcessMixin<'c, Frame<MTU>, Frame<MTU>, Never, L>,
}

impl<'c, const DEPTH: usize, const MTU: usize, L: RawLock> LoopbackBus<'c, DEPTH, MTU, L> {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(RefCell::new(Deque::new())),
            next_seq: Mutex::new(Cell::new(0)),
            listeners: ListenMixin::new(),
            requesters: RequestMixin::new(),
            processors: ProcessMixin::new(),
        }
    }

    /// An empty slot for [`ListenBus::listen`] on this bus.
    pub const fn listen_handle<'b>(&'b self) -> ListenHandle<'b, 'c, Frame<MTU>, Never, L> {
        Handle::new()
    }

    /// An empty slot for [`RequestBus::request`] on this bus.
    pub const fn request_handle<'b>(
        &'b self,
    ) -> RequestHandle<'b, 'c, Frame<MTU>, Never, ResponseFilter, L> {
        Handle::new()
    }

    /// An empty slot for [`ProcessBus::process`] on this bus.
    pub const fn process_handle<'b>(
        &'b self,
    ) -> ProcessHandle<'b, 'c, Frame<MTU>, Frame<MTU>, Never, L> {
        Handle::new()
    }

    /// Number of frames waiting for [`poll`](Self::poll).
    pub fn pending(&self) -> usize {
        self.queue.lock(|queue| queue.borrow().len())
    }

    /// Delivers queued frames until the queue is empty.
    ///
    /// Frames queued while polling, such as responses produced by
    /// processors, are delivered in the same call. Returns the number of
    /// frames delivered.
    pub fn poll(&self) -> usize {
        let mut delivered = 0;
        while let Some(pending) = self.queue.lock(|queue| queue.borrow_mut().pop_front()) {
            if let Some(completion) = pending.completion {
                completion.call(&Ok(pending.frame.clone()));
            }
            self.receive(pending.frame);
            delivered += 1;
        }
        delivered
    }

    /// Receives `frame` as if it had arrived from the wire.
    pub fn inject(&self, frame: Frame<MTU>) {
        self.receive(frame);
    }

    fn receive(&self, frame: Frame<MTU>) {
        trace!("loopback frame for address {}", frame.address);
        let kind = frame.kind;
        let msg = Ok(frame);
        self.listeners.feed_listeners(&msg);
        match kind {
            FrameKind::Message => {}
            FrameKind::Request(_) => {
                self.processors.feed_processors(&msg, self);
            }
            FrameKind::Response(_) => {
                self.requesters.feed_requesters(&msg);
            }
        }
    }

    fn enqueue(
        &self,
        frame: Frame<MTU>,
        completion: Option<SendCallback<'c, MTU>>,
    ) -> Result<(), BusError<Never>> {
        self.queue.lock(|queue| {
            queue
                .borrow_mut()
                .push_back(Pending { frame, completion })
                .map_err(|_| BusError::QueueFull)
        })
    }

    fn next_seq(&self) -> u16 {
        self.next_seq.lock(|seq| {
            let current = seq.get();
            seq.set(current.wrapping_add(1));
            current
        })
    }
}

impl<const DEPTH: usize, const MTU: usize, L: RawLock> Default for LoopbackBus<'_, DEPTH, MTU, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'c, const DEPTH: usize, const MTU: usize, L: RawLock> SendBus<'c, Frame<MTU>>
    for LoopbackBus<'c, DEPTH, MTU, L>
{
    type SendHandle = ();
    type SendDispatchError = BusError<Never>;
    type SendCallbackError = Never;

    fn send(
        &self,
        msg: &Frame<MTU>,
        callback: SendCallback<'c, MTU>,
    ) -> Result<(), BusError<Never>> {
        self.enqueue(msg.clone(), Some(callback))
    }
}

impl<'c, const DEPTH: usize, const MTU: usize, L: RawLock> ListenBus<'c, Frame<MTU>>
    for LoopbackBus<'c, DEPTH, MTU, L>
{
    type ListenHandle<'b>
        = ListenHandle<'b, 'c, Frame<MTU>, Never, L>
    where
        Self: 'b;
    type ListenDispatchError = Never;
    type ListenCallbackError = Never;

    fn listen_filtered<'b>(
        &'b self,
        slot: Pin<&mut Self::ListenHandle<'b>>,
        callback: Callback<'c, Result<Frame<MTU>, Never>>,
        filter: Callback<'c, Result<Frame<MTU>, Never>, bool>,
    ) -> Result<(), Never> {
        self.listeners.listen(slot, callback, filter)
    }
}

impl<'c, const DEPTH: usize, const MTU: usize, L: RawLock> RequestIssuer<Frame<MTU>, ()>
    for LoopbackBus<'c, DEPTH, MTU, L>
{
    type Filter = ResponseFilter;
    type Error = BusError<Never>;

    fn issue_request(&self, req: &Frame<MTU>, _: ()) -> Result<ResponseFilter, BusError<Never>> {
        let seq = self.next_seq();
        let frame = Frame {
            address: req.address,
            kind: FrameKind::Request(seq),
            data: req.data.clone(),
        };
        self.enqueue(frame, None)?;
        Ok(ResponseFilter {
            address: req.address,
            seq,
        })
    }
}

impl<'c, const DEPTH: usize, const MTU: usize, L: RawLock> RequestBus<'c, Frame<MTU>, Frame<MTU>, ()>
    for LoopbackBus<'c, DEPTH, MTU, L>
{
    type RequestHandle<'b>
        = RequestHandle<'b, 'c, Frame<MTU>, Never, ResponseFilter, L>
    where
        Self: 'b;
    type RequestDispatchError = BusError<Never>;
    type RequestCallbackError = Never;

    fn request<'b>(
        &'b self,
        slot: Pin<&mut Self::RequestHandle<'b>>,
        req: &Frame<MTU>,
        callback: Callback<'c, Result<Frame<MTU>, Never>>,
        buffer: (),
    ) -> Result<(), BusError<Never>> {
        self.requesters.request(slot, self, req, callback, buffer)
    }
}

impl<'c, const DEPTH: usize, const MTU: usize, L: RawLock> ResponseIssuer<Frame<MTU>, Frame<MTU>>
    for LoopbackBus<'c, DEPTH, MTU, L>
{
    fn issue_response(&self, req: &Frame<MTU>, res: &Frame<MTU>) {
        let FrameKind::Request(seq) = req.kind else {
            warn!("response to a frame that is not a request dropped");
            return;
        };
        let frame = Frame {
            address: req.address,
            kind: FrameKind::Response(seq),
            data: res.data.clone(),
        };
        if self.enqueue(frame, None).is_err() {
            warn!("response to address {} dropped: queue full", req.address);
        }
    }
}

impl<'c, const DEPTH: usize, const MTU: usize, L: RawLock> ProcessBus<'c, Frame<MTU>, Frame<MTU>>
    for LoopbackBus<'c, DEPTH, MTU, L>
{
    type ProcessHandle<'b>
        = ProcessHandle<'b, 'c, Frame<MTU>, Frame<MTU>, Never, L>
    where
        Self: 'b;
    type ProcessDispatchError = Never;
    type ProcessCallbackError = Never;

    fn process<'b>(
        &'b self,
        slot: Pin<&mut Self::ProcessHandle<'b>>,
        callback: Callback<'c, Result<Frame<MTU>, Never>, Option<Frame<MTU>>>,
    ) -> Result<(), Never> {
        self.processors.process(slot, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IntoOk;
    use core::pin::pin;
    use core::sync::atomic::{AtomicU32, Ordering};

    type Bus<'c> = LoopbackBus<'c, 4, 8>;

    #[derive(Default)]
    struct Counter {
        hits: AtomicU32,
    }

    impl Counter {
        fn hit(&self, _: &Result<Frame<8>, Never>) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        fn hits(&self) -> u32 {
            self.hits.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn send_completes_on_poll() {
        let done = Counter::default();
        let bus = Bus::new();
        let frame = Frame::new(0x20, &[1, 2, 3]).unwrap();

        bus.send(&frame, Callback::new(&done, Counter::hit)).unwrap();
        assert_eq!(done.hits(), 0);
        assert_eq!(bus.pending(), 1);
        assert_eq!(bus.poll(), 1);
        assert_eq!(done.hits(), 1);
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn full_queue_rejects_send() {
        let done = Counter::default();
        let bus = Bus::new();
        let frame = Frame::new(0x20, &[]).unwrap();
        for _ in 0..4 {
            bus.send(&frame, Callback::new(&done, Counter::hit)).unwrap();
        }
        assert_eq!(
            bus.send(&frame, Callback::new(&done, Counter::hit)),
            Err(BusError::QueueFull)
        );
        assert_eq!(bus.poll(), 4);
        assert_eq!(done.hits(), 4);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert_eq!(
            Frame::<2>::new(0, &[1, 2, 3]),
            Err(BusError::PayloadTooLarge)
        );
    }

    #[test]
    fn injected_frames_reach_listeners_immediately() {
        let seen = Counter::default();
        let bus = Bus::new();
        let mut handle = pin!(bus.listen_handle());
        bus.listen(handle.as_mut(), Callback::new(&seen, Counter::hit))
            .into_inner_ok();

        bus.inject(Frame::new(0x01, &[9]).unwrap());
        assert_eq!(seen.hits(), 1);
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn request_is_tagged_and_answered() {
        struct Echo;
        impl Echo {
            fn answer(&self, req: &Result<Frame<8>, Never>) -> Option<Frame<8>> {
                let req = req.as_ref().ok()?;
                Frame::new(req.address, &[req.data[0] + 1]).ok()
            }
        }

        let got = crate::ipc::AsyncValue::<Result<Frame<8>, Never>>::new();
        let bus = Bus::new();
        let mut processor = pin!(bus.process_handle());
        let mut request = pin!(bus.request_handle());
        bus.process(processor.as_mut(), Callback::new(&Echo, Echo::answer))
            .into_inner_ok();
        bus.request(
            request.as_mut(),
            &Frame::new(0x42, &[41]).unwrap(),
            Callback::from(&got),
            (),
        )
        .unwrap();

        // request, then response
        assert_eq!(bus.poll(), 2);
        let response = got.get().unwrap().into_inner_ok();
        assert_eq!(response.address, 0x42);
        assert_eq!(response.kind, FrameKind::Response(0));
        assert_eq!(&response.data[..], &[42]);
    }

    #[test]
    fn response_filter_checks_address_and_sequence() {
        let filter = ResponseFilter {
            address: 3,
            seq: 7,
        };
        let hit = Frame::<8>::with_kind(3, FrameKind::Response(7), &[]).unwrap();
        let wrong_seq = Frame::<8>::with_kind(3, FrameKind::Response(8), &[]).unwrap();
        let request = Frame::<8>::with_kind(3, FrameKind::Request(7), &[]).unwrap();
        assert!(MessageFilter::<_, Never>::matches(&filter, &Ok(hit)));
        assert!(!MessageFilter::<_, Never>::matches(&filter, &Ok(wrong_seq)));
        assert!(!MessageFilter::<_, Never>::matches(&filter, &Ok(request)));
    }
}
