use std::collections::HashSet;
use std::pin::{Pin, pin};
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use obc_bus::handle::{Handle, HandleChainRoot};
use obc_bus::ipc::{AtomicLock, RawLock, SpinLock};

type Root<L> = HandleChainRoot<usize, L>;
type Slot<'r, L> = Pin<Box<Handle<'r, usize, L>>>;

const WRITERS: usize = 4;
const ROUNDS: usize = 400;
const KEEP_EVERY: usize = 50;
const KEPT_BASE: usize = 1_000_000;

#[test]
fn concurrent_insert_and_destroy_leave_consistent_chain() {
    insert_and_destroy_concurrently::<AtomicLock>();
}

#[test]
fn concurrent_insert_and_destroy_with_interrupt_safe_locks() {
    insert_and_destroy_concurrently::<SpinLock>();
}

fn insert_and_destroy_concurrently<L: RawLock + Send + Sync>() {
    let root = Root::<L>::new();
    let ready = Barrier::new(WRITERS + 1);
    let counted = Barrier::new(WRITERS + 1);
    let writing = AtomicUsize::new(WRITERS);
    let duplicates = AtomicUsize::new(0);

    let (len, values) = thread::scope(|s| {
        for writer in 0..WRITERS {
            let (root, ready, counted, writing) = (&root, &ready, &counted, &writing);
            s.spawn(move || {
                let mut kept: Vec<Slot<'_, L>> = Vec::new();
                for round in 0..ROUNDS {
                    let mut churn = pin!(Handle::new());
                    root.insert(churn.as_mut(), writer * ROUNDS + round);
                    if round % KEEP_EVERY == 0 {
                        let mut slot = Box::pin(Handle::new());
                        root.insert(slot.as_mut(), KEPT_BASE + writer * ROUNDS + round);
                        kept.push(slot);
                    }
                }
                writing.fetch_sub(1, Ordering::Release);
                ready.wait();
                counted.wait();
                drop(kept);
            });
        }

        s.spawn(|| {
            while writing.load(Ordering::Acquire) > 0 {
                let mut seen = HashSet::new();
                root.for_each(|value| {
                    if !seen.insert(*value) {
                        duplicates.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        ready.wait();
        let mut values = Vec::new();
        root.for_each(|value| values.push(*value));
        let len = root.len();
        counted.wait();
        (len, values)
    });

    assert_eq!(len, WRITERS * ROUNDS / KEEP_EVERY);
    assert_eq!(values.len(), len);
    assert!(values.iter().all(|value| *value >= KEPT_BASE));
    assert_eq!(values.iter().collect::<HashSet<_>>().len(), len);
    assert!(root.is_empty());
    assert_eq!(duplicates.load(Ordering::Relaxed), 0);
}

#[test]
fn relocation_is_seen_exactly_once_by_concurrent_iteration() {
    relocate_under_iteration::<AtomicLock>();
}

#[test]
fn relocation_with_interrupt_safe_locks() {
    relocate_under_iteration::<SpinLock>();
}

fn relocate_under_iteration<L: RawLock + Send + Sync>() {
    const MOVER: usize = 99;
    const MOVES: usize = 2_000;

    let root = Root::<L>::new();
    let moving = AtomicBool::new(true);
    let finished = Barrier::new(2);
    let bad_passes = AtomicUsize::new(0);

    let mut fixed: Vec<Slot<'_, L>> = (0..3).map(|_| Box::pin(Handle::new())).collect();
    for (value, slot) in fixed.iter_mut().enumerate() {
        root.insert(slot.as_mut(), value);
    }
    let mut a: Slot<'_, L> = Box::pin(Handle::new());
    let mut b: Slot<'_, L> = Box::pin(Handle::new());
    root.insert(a.as_mut(), MOVER);

    thread::scope(|s| {
        let (moving, finished) = (&moving, &finished);
        s.spawn(move || {
            for round in 0..MOVES {
                if round % 2 == 0 {
                    b.as_mut().relocate_from(a.as_mut());
                } else {
                    a.as_mut().relocate_from(b.as_mut());
                }
            }
            moving.store(false, Ordering::Release);
            finished.wait();
        });

        while moving.load(Ordering::Acquire) {
            let mut movers = 0;
            let mut total = 0;
            root.for_each(|value| {
                total += 1;
                if *value == MOVER {
                    movers += 1;
                }
            });
            if movers != 1 || total != 4 {
                bad_passes.fetch_add(1, Ordering::Relaxed);
            }
        }
        finished.wait();
    });

    assert_eq!(bad_passes.load(Ordering::Relaxed), 0);
    assert_eq!(root.len(), 3);
    drop(fixed);
    assert!(root.is_empty());
}

#[test]
fn dropped_handle_is_never_observed_afterwards() {
    let root = Root::<SpinLock>::new();
    let mut keep = pin!(Handle::new());
    root.insert(keep.as_mut(), 1);
    {
        let mut gone = pin!(Handle::new());
        root.insert(gone.as_mut(), 2);
        assert_eq!(root.len(), 2);
    }
    let mut values = Vec::new();
    root.for_each(|value| values.push(*value));
    assert_eq!(values, [1]);
}
