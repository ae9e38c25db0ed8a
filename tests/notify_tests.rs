//! These tests ensure that, when a driving future is dropped, another
//! future is notified and can finish the batch, and that cache waiters are
//! woken when their key resolves.

use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{future, FutureExt};
use std::{
    future::Future,
    num::NonZeroUsize,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};
use streamloader::{BatchLoader, BatchRules, LoadFuture};

/// A waker that stores true if it has been awoken
#[derive(Debug, Clone, Default)]
struct BoolWaker {
    cell: Arc<AtomicBool>,
}

impl BoolWaker {
    fn reset(&self) {
        self.cell.store(false, Ordering::SeqCst)
    }

    fn is_signaled(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }
}

impl WakeRef for BoolWaker {
    fn wake_by_ref(&self) {
        self.cell.store(true, Ordering::SeqCst)
    }
}

impl Wake for BoolWaker {}

/// A future that stays pending until the test opens it. It never wakes
/// anyone itself, so all wakeups observed by the tests come from the
/// loader's own notification logic.
#[derive(Debug, Clone, Default)]
struct Gate {
    opened: Arc<AtomicBool>,
}

impl Gate {
    fn open(&self) {
        self.opened.store(true, Ordering::SeqCst)
    }
}

impl Future for Gate {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _ctx: &mut Context<'_>) -> Poll<()> {
        match self.opened.load(Ordering::SeqCst) {
            true => Poll::Ready(()),
            false => Poll::Pending,
        }
    }
}

/// A manually polled future with its own signal-recording waker.
struct Task<F: Future + Unpin> {
    fut: F,
    signal: BoolWaker,
    waker: Waker,
}

impl<F: Future + Unpin> Task<F> {
    fn new(fut: F) -> Self {
        let signal = BoolWaker::default();

        Task {
            fut,
            waker: Box::new(signal.clone()).into_waker(),
            signal,
        }
    }

    fn poll(&mut self) -> Poll<F::Output> {
        self.signal.reset();
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    fn is_signaled(&self) -> bool {
        self.signal.is_signaled()
    }
}

type GatedLoader = BatchLoader<
    u32,
    u32,
    (),
    Box<dyn Fn(Vec<u32>) -> future::BoxFuture<'static, Result<Vec<u32>, ()>> + Send + Sync>,
    fn(&u32) -> u32,
    fn() -> future::Ready<()>,
>;

fn gated_loader(gate: &Gate) -> GatedLoader {
    let gate = gate.clone();
    BatchLoader::new(BatchRules {
        loader: Box::new(move |ids: Vec<u32>| {
            let gate = gate.clone();
            async move {
                gate.await;
                Ok(ids)
            }
            .boxed()
        }),
        args_from_item: |id: &u32| *id,
        window: || future::ready(()),
        batch_size: NonZeroUsize::new(100).unwrap(),
        max_items: None,
    })
}

fn assert_found(result: Poll<Result<Option<u32>, streamloader::LoadError<()>>>, id: u32) {
    match result {
        Poll::Ready(Ok(Some(found))) => assert_eq!(found, id),
        other => panic!("expected a resolved item, got {:?}", other),
    }
}

#[test]
fn dropping_the_driving_future_wakes_another() {
    let gate = Gate::default();
    let loader = gated_loader(&gate);

    let mut task1 = Task::new(loader.load(10));
    let mut task2 = Task::new(loader.load(20));

    // task1 closes the window and starts the batch; task2 polls later and
    // takes over as the driver
    assert!(task1.poll().is_pending());
    assert!(task2.poll().is_pending());

    task1.signal.reset();
    drop(task2);

    // the dropped driver must hand the batch to task1
    assert!(task1.is_signaled());

    gate.open();
    assert_found(task1.poll(), 10);
}

#[test]
fn dropping_a_non_driving_future_wakes_nobody() {
    let gate = Gate::default();
    let loader = gated_loader(&gate);

    let mut task1 = Task::new(loader.load(10));
    let mut task2 = Task::new(loader.load(20));
    assert!(task1.poll().is_pending());
    assert!(task2.poll().is_pending());

    task2.signal.reset();
    drop(task1);

    // task2 is still the driver; no handoff is needed
    assert!(!task2.is_signaled());

    gate.open();
    assert_found(task2.poll(), 20);
}

#[test]
fn cache_waiters_are_woken_when_the_batch_resolves() {
    let gate = Gate::default();
    let loader = gated_loader(&gate);

    let mut driver = Task::new(loader.load(10));
    assert!(driver.poll().is_pending());

    // the window is already running, so a second load of the same key
    // waits on the cache slot instead
    let mut waiter: Task<LoadFuture<u32, u32, ()>> = Task::new(loader.load(10));
    assert!(waiter.poll().is_pending());

    waiter.signal.reset();
    gate.open();
    assert_found(driver.poll(), 10);

    // resolving the slot signalled the waiter
    assert!(waiter.is_signaled());
    assert_found(waiter.poll(), 10);
}
