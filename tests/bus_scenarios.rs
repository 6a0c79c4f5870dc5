use std::pin::{Pin, pin};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use obc_bus::bus::loopback::{Frame, FrameKind, LoopbackBus};
use obc_bus::bus::{ListenBus, PlainData, ProcessBus, RequestBus, SendBus};
use obc_bus::error::{IntoOk, Never};
use obc_bus::ipc::{AsyncValue, Callback, RequiredSignature};

type Bus<'c> = LoopbackBus<'c, 8, 8>;
type Received = Result<Frame<8>, Never>;

#[derive(Default)]
struct Recorder {
    frames: Mutex<Vec<Frame<8>>>,
}

impl Recorder {
    fn record(&self, msg: &Received) {
        if let Ok(frame) = msg {
            self.frames.lock().unwrap().push(frame.clone());
        }
    }

    fn frames(&self) -> Vec<Frame<8>> {
        self.frames.lock().unwrap().clone()
    }

    fn responses(&self) -> Vec<Frame<8>> {
        self.frames()
            .into_iter()
            .filter(|frame| matches!(frame.kind, FrameKind::Response(_)))
            .collect()
    }
}

#[derive(Default)]
struct Counter {
    hits: AtomicU32,
}

impl Counter {
    fn hit(&self, _: &Received) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn hits(&self) -> u32 {
        self.hits.load(Ordering::Relaxed)
    }
}

struct Processor {
    answer: Option<u8>,
    offers: AtomicU32,
}

impl Processor {
    fn new(answer: Option<u8>) -> Self {
        Self {
            answer,
            offers: AtomicU32::new(0),
        }
    }

    fn offer(&self, req: &Received) -> Option<Frame<8>> {
        self.offers.fetch_add(1, Ordering::Relaxed);
        let req = req.as_ref().ok()?;
        Frame::new(req.address, &[self.answer?]).ok()
    }

    fn offers(&self) -> u32 {
        self.offers.load(Ordering::Relaxed)
    }
}

fn request_frame(seq: u16) -> Frame<8> {
    Frame::with_kind(0x30, FrameKind::Request(seq), &[1]).unwrap()
}

#[test]
fn listener_sees_message_once_and_late_listener_sees_nothing() {
    let a = Recorder::default();
    let b = AsyncValue::<Received>::new();
    let bus = Bus::new();

    let mut handle_a = pin!(bus.listen_handle());
    bus.listen(handle_a.as_mut(), Callback::new(&a, Recorder::record))
        .into_inner_ok();

    let msg = Frame::new(0xF0, &[0x42, 0xB0, 0xF2, 0x41]).unwrap();
    bus.inject(msg.clone());

    let mut handle_b = pin!(bus.listen_handle());
    bus.listen(handle_b.as_mut(), Callback::from(&b)).into_inner_ok();
    assert_eq!(bus.poll(), 0);

    assert_eq!(a.frames(), [msg]);
    assert!(b.get().is_none());
}

#[test]
fn responses_fan_out_to_matching_request_only() {
    let first = Counter::default();
    let second = Counter::default();
    let bus = Bus::new();

    let mut request_1 = Box::pin(bus.request_handle());
    let mut request_2 = pin!(bus.request_handle());
    bus.request(
        request_1.as_mut(),
        &Frame::new(0x10, &[]).unwrap(),
        Callback::new(&first, Counter::hit),
        (),
    )
    .unwrap();
    bus.request(
        request_2.as_mut(),
        &Frame::new(0x20, &[]).unwrap(),
        Callback::new(&second, Counter::hit),
        (),
    )
    .unwrap();
    // nobody processes the requests themselves
    assert_eq!(bus.poll(), 2);

    for _ in 0..2 {
        bus.inject(Frame::with_kind(0x10, FrameKind::Response(0), &[7]).unwrap());
    }
    assert_eq!(first.hits(), 2);
    assert_eq!(second.hits(), 0);

    // dropping the handle ends the registration
    drop(request_1);
    bus.inject(Frame::with_kind(0x10, FrameKind::Response(0), &[7]).unwrap());
    assert_eq!(first.hits(), 2);
}

#[test]
fn only_one_response_from_the_processor_that_answers() {
    let answering = Processor::new(Some(0xAA));
    let declining = Processor::new(None);
    let wire = Recorder::default();
    let bus = Bus::new();

    let mut tap = pin!(bus.listen_handle());
    bus.listen(tap.as_mut(), Callback::new(&wire, Recorder::record))
        .into_inner_ok();
    // the newest registration is offered requests first
    let mut older = pin!(bus.process_handle());
    let mut newer = pin!(bus.process_handle());
    bus.process(older.as_mut(), Callback::new(&answering, Processor::offer))
        .into_inner_ok();
    bus.process(newer.as_mut(), Callback::new(&declining, Processor::offer))
        .into_inner_ok();

    bus.inject(request_frame(5));
    assert_eq!(bus.poll(), 1);

    assert_eq!(declining.offers(), 1);
    assert_eq!(answering.offers(), 1);
    let responses = wire.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].address, 0x30);
    assert_eq!(responses[0].kind, FrameKind::Response(5));
    assert_eq!(&responses[0].data[..], &[0xAA]);
}

#[test]
fn first_answer_wins() {
    let older = Processor::new(Some(1));
    let newer = Processor::new(Some(2));
    let wire = Recorder::default();
    let bus = Bus::new();

    let mut tap = pin!(bus.listen_handle());
    bus.listen(tap.as_mut(), Callback::new(&wire, Recorder::record))
        .into_inner_ok();
    let mut older_handle = pin!(bus.process_handle());
    let mut newer_handle = pin!(bus.process_handle());
    bus.process(older_handle.as_mut(), Callback::new(&older, Processor::offer))
        .into_inner_ok();
    bus.process(newer_handle.as_mut(), Callback::new(&newer, Processor::offer))
        .into_inner_ok();

    bus.inject(request_frame(9));
    bus.poll();

    assert_eq!(newer.offers(), 1);
    assert_eq!(older.offers(), 0);
    let responses = wire.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(&responses[0].data[..], &[2]);
}

#[test]
fn unanswered_request_issues_nothing() {
    let first = Processor::new(None);
    let second = Processor::new(None);
    let wire = Recorder::default();
    let bus = Bus::new();

    let mut tap = pin!(bus.listen_handle());
    bus.listen(tap.as_mut(), Callback::new(&wire, Recorder::record))
        .into_inner_ok();
    let mut first_handle = pin!(bus.process_handle());
    let mut second_handle = pin!(bus.process_handle());
    bus.process(first_handle.as_mut(), Callback::new(&first, Processor::offer))
        .into_inner_ok();
    bus.process(second_handle.as_mut(), Callback::new(&second, Processor::offer))
        .into_inner_ok();

    bus.inject(request_frame(1));
    assert_eq!(bus.poll(), 0);

    assert_eq!(first.offers(), 1);
    assert_eq!(second.offers(), 1);
    assert!(wire.responses().is_empty());
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Attitude {
    roll: i16,
    pitch: i16,
    yaw: i16,
    flags: u8,
}

unsafe impl PlainData for Attitude {}

#[test]
fn plain_data_survives_a_loop_through_the_bus() {
    let sent = Counter::default();
    let wire = Recorder::default();
    let bus = Bus::new();

    let mut tap = pin!(bus.listen_handle());
    bus.listen(tap.as_mut(), Callback::new(&wire, Recorder::record))
        .into_inner_ok();

    let attitude = Attitude {
        roll: -120,
        pitch: 45,
        yaw: 3599,
        flags: 0b101,
    };
    assert_eq!(attitude.as_bytes().len(), 7);
    bus.send(
        &Frame::new(0x50, attitude.as_bytes()).unwrap(),
        Callback::new(&sent, Counter::hit),
    )
    .unwrap();
    bus.poll();

    assert_eq!(sent.hits(), 1);
    let frames = wire.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(Attitude::from_bytes(&frames[0].data), Some(attitude));
}

#[test]
fn request_result_can_be_awaited() {
    use embassy_time::Duration;
    use obc_bus::scheduling::Timeout;

    struct Doubler;
    impl Doubler {
        fn answer(&self, req: &Received) -> Option<Frame<8>> {
            let req = req.as_ref().ok()?;
            Frame::new(req.address, &[req.data[0] * 2]).ok()
        }
    }

    let result = AsyncValue::<Received>::new();
    let bus = Bus::new();
    let mut processor = pin!(bus.process_handle());
    bus.process(processor.as_mut(), Callback::new(&Doubler, Doubler::answer))
        .into_inner_ok();

    let mut request = pin!(bus.request_handle());
    bus.request(
        request.as_mut(),
        &Frame::new(0x11, &[21]).unwrap(),
        Callback::from(&result),
        (),
    )
    .unwrap();

    let response = result
        .wait_with(Timeout::new(Duration::from_millis(100)), || {
            bus.poll();
        })
        .map(IntoOk::into_inner_ok);
    assert_eq!(response.map(|frame| frame.data[0]), Some(42));
}

/// Compiles only if the loopback bus accepts listeners and processors of
/// these shapes.
#[allow(dead_code)]
fn loopback_capabilities<'b, 'c>(
    bus: &'b Bus<'c>,
    listen: Pin<&mut <Bus<'c> as ListenBus<'c, Frame<8>>>::ListenHandle<'b>>,
    process: Pin<&mut <Bus<'c> as ProcessBus<'c, Frame<8>, Frame<8>>>::ProcessHandle<'b>>,
    on_message: RequiredSignature<Received>,
    on_request: RequiredSignature<Received, Option<Frame<8>>>,
) {
    <Bus<'c> as ListenBus<'c, Frame<8>>>::listen(bus, listen, on_message.into()).into_inner_ok();
    <Bus<'c> as ProcessBus<'c, Frame<8>, Frame<8>>>::process(bus, process, on_request.into())
        .into_inner_ok();
}

#[test]
fn capability_check_compiles() {
    let _check = loopback_capabilities;
}
