//! Streaming key-join of two fallible streams.

use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use futures::stream::{Stream, StreamExt};
use tracing::trace;

/// One joined emission: an item from each side that shared a key, or a
/// single-sided item whose partner never arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPair<TA, TB> {
    pub a: Option<TA>,
    pub b: Option<TB>,
}

/// A buffered item waiting for its partner, remembering which side it
/// came from. At most one entry is held per key.
enum Tagged<TA, TB> {
    A(TA),
    B(TB),
}

/// Joins two streams by key, pairing each item with the first
/// opposite-side item sharing its key.
///
/// An item whose key is already buffered from the *other* side emits a
/// full pair and removes the buffered entry. Otherwise the item is
/// buffered, replacing any older same-side entry for that key (newest
/// wins). When one side completes, every buffered entry from the *other*
/// side is flushed as a single-sided pair, and later items from the
/// still-running side emit single-sided immediately instead of buffering.
/// The join ends once both sides have completed and all flushes drained;
/// an error on either side is forwarded and ends it at once.
///
/// The two sides are polled with alternating priority so neither can
/// starve the other.
pub fn zip_diff<SA, SB, KeyA, KeyB, K, TA, TB, E>(
    a: SA,
    b: SB,
    key_a: KeyA,
    key_b: KeyB,
) -> ZipDiff<SA, SB, KeyA, KeyB, K, TA, TB>
where
    SA: Stream<Item = Result<TA, E>> + Unpin,
    SB: Stream<Item = Result<TB, E>> + Unpin,
    KeyA: Fn(&TA) -> K,
    KeyB: Fn(&TB) -> K,
    K: Eq + Hash,
{
    ZipDiff {
        a,
        b,
        key_a,
        key_b,
        buffer: HashMap::new(),
        ready: VecDeque::new(),
        a_done: false,
        b_done: false,
        terminated: false,
        b_first: false,
    }
}

/// [`zip_diff`] with a single key function serving both sides, for joins
/// between streams of the same item type.
pub fn zip_diff_on<SA, SB, KeyFn, K, T, E>(
    a: SA,
    b: SB,
    key_fn: KeyFn,
) -> ZipDiff<SA, SB, KeyFn, KeyFn, K, T, T>
where
    SA: Stream<Item = Result<T, E>> + Unpin,
    SB: Stream<Item = Result<T, E>> + Unpin,
    KeyFn: Fn(&T) -> K + Clone,
    K: Eq + Hash,
{
    zip_diff(a, b, key_fn.clone(), key_fn)
}

/// The stream returned by [`zip_diff`].
pub struct ZipDiff<SA, SB, KeyA, KeyB, K, TA, TB> {
    a: SA,
    b: SB,
    key_a: KeyA,
    key_b: KeyB,
    buffer: HashMap<K, Tagged<TA, TB>>,
    // matches and flushes waiting to be emitted
    ready: VecDeque<JoinPair<TA, TB>>,
    a_done: bool,
    b_done: bool,
    terminated: bool,
    b_first: bool,
}

enum Step {
    Advanced,
    Idle,
}

impl<SA, SB, KeyA, KeyB, K, TA, TB, E> ZipDiff<SA, SB, KeyA, KeyB, K, TA, TB>
where
    SA: Stream<Item = Result<TA, E>> + Unpin,
    SB: Stream<Item = Result<TB, E>> + Unpin,
    KeyA: Fn(&TA) -> K,
    KeyB: Fn(&TB) -> K,
    K: Eq + Hash,
{
    fn poll_a(&mut self, ctx: &mut Context<'_>) -> Result<Step, E> {
        match self.a.poll_next_unpin(ctx) {
            Poll::Pending => Ok(Step::Idle),
            Poll::Ready(Some(Err(err))) => Err(err),
            Poll::Ready(Some(Ok(item))) => {
                let key = (self.key_a)(&item);
                match self.buffer.remove(&key) {
                    Some(Tagged::B(partner)) => self.ready.push_back(JoinPair {
                        a: Some(item),
                        b: Some(partner),
                    }),
                    other => {
                        // an older same-side entry (if any) is dropped;
                        // the newest representative wins
                        drop(other);
                        if self.b_done {
                            self.ready.push_back(JoinPair {
                                a: Some(item),
                                b: None,
                            });
                        } else {
                            self.buffer.insert(key, Tagged::A(item));
                        }
                    }
                }
                Ok(Step::Advanced)
            }
            Poll::Ready(None) => {
                if self.a_done {
                    return Ok(Step::Idle);
                }
                self.a_done = true;
                self.flush_side_b();
                Ok(Step::Advanced)
            }
        }
    }

    fn poll_b(&mut self, ctx: &mut Context<'_>) -> Result<Step, E> {
        match self.b.poll_next_unpin(ctx) {
            Poll::Pending => Ok(Step::Idle),
            Poll::Ready(Some(Err(err))) => Err(err),
            Poll::Ready(Some(Ok(item))) => {
                let key = (self.key_b)(&item);
                match self.buffer.remove(&key) {
                    Some(Tagged::A(partner)) => self.ready.push_back(JoinPair {
                        a: Some(partner),
                        b: Some(item),
                    }),
                    other => {
                        drop(other);
                        if self.a_done {
                            self.ready.push_back(JoinPair {
                                a: None,
                                b: Some(item),
                            });
                        } else {
                            self.buffer.insert(key, Tagged::B(item));
                        }
                    }
                }
                Ok(Step::Advanced)
            }
            Poll::Ready(None) => {
                if self.b_done {
                    return Ok(Step::Idle);
                }
                self.b_done = true;
                self.flush_side_a();
                Ok(Step::Advanced)
            }
        }
    }

    /// A has completed: buffered B entries can never be matched, so they
    /// go out single-sided. Buffered A entries stay matchable.
    fn flush_side_b(&mut self) {
        let mut flushed = 0;
        for (key, entry) in mem::take(&mut self.buffer) {
            match entry {
                Tagged::B(item) => {
                    flushed += 1;
                    self.ready.push_back(JoinPair {
                        a: None,
                        b: Some(item),
                    });
                }
                keeper => {
                    self.buffer.insert(key, keeper);
                }
            }
        }
        trace!(flushed, "left side completed");
    }

    fn flush_side_a(&mut self) {
        let mut flushed = 0;
        for (key, entry) in mem::take(&mut self.buffer) {
            match entry {
                Tagged::A(item) => {
                    flushed += 1;
                    self.ready.push_back(JoinPair {
                        a: Some(item),
                        b: None,
                    });
                }
                keeper => {
                    self.buffer.insert(key, keeper);
                }
            }
        }
        trace!(flushed, "right side completed");
    }
}

impl<SA, SB, KeyA, KeyB, K, TA, TB, E> Stream for ZipDiff<SA, SB, KeyA, KeyB, K, TA, TB>
where
    SA: Stream<Item = Result<TA, E>> + Unpin,
    SB: Stream<Item = Result<TB, E>> + Unpin,
    KeyA: Fn(&TA) -> K,
    KeyB: Fn(&TB) -> K,
    K: Eq + Hash,
    Self: Unpin,
{
    type Item = Result<JoinPair<TA, TB>, E>;

    fn poll_next(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let unpinned = self.get_mut();

        loop {
            if let Some(pair) = unpinned.ready.pop_front() {
                return Poll::Ready(Some(Ok(pair)));
            }

            if unpinned.terminated || (unpinned.a_done && unpinned.b_done) {
                unpinned.terminated = true;
                return Poll::Ready(None);
            }

            // alternate which side gets polled first so a chatty side
            // cannot starve the other
            unpinned.b_first = !unpinned.b_first;
            let order = if unpinned.b_first {
                [Side::B, Side::A]
            } else {
                [Side::A, Side::B]
            };

            let mut advanced = false;
            for side in order {
                let step = match side {
                    Side::A if !unpinned.a_done => unpinned.poll_a(ctx),
                    Side::B if !unpinned.b_done => unpinned.poll_b(ctx),
                    _ => Ok(Step::Idle),
                };
                match step {
                    Ok(Step::Advanced) => advanced = true,
                    Ok(Step::Idle) => {}
                    Err(err) => {
                        unpinned.terminated = true;
                        unpinned.buffer.clear();
                        unpinned.ready.clear();
                        return Poll::Ready(Some(Err(err)));
                    }
                }
            }

            if !advanced {
                return Poll::Pending;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    A,
    B,
}
