//! Grouping of consecutive equal-keyed items into buffered runs.

use std::{
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use futures::stream::{self, Stream, StreamExt};

/// Groups consecutive items whose keys are equal into one `Vec`.
///
/// A buffered run is emitted when an item with a different key arrives
/// (that item starts the next run) and when the source ends with a
/// non-empty buffer. An upstream error discards the open run and is
/// forwarded.
pub fn buffer_distinct<S, KeyFn, K, T, E>(
    source: S,
    key_fn: KeyFn,
) -> BufferDistinct<S, KeyFn, stream::Pending<()>, K, T>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    KeyFn: Fn(&T) -> K,
    K: PartialEq,
{
    BufferDistinct {
        source,
        key_fn,
        flush: None,
        buffer: Vec::new(),
        run: None,
        terminated: false,
    }
}

/// [`buffer_distinct`] with an external flush trigger.
///
/// Whenever `flush` yields, the current non-empty buffer is force-emitted
/// and the run is blanked, so the next source item starts a new run even
/// if its key matches the flushed one. The flush stream's items are only
/// used as a signal; their values are ignored.
pub fn buffer_distinct_with_flush<S, KeyFn, Flush, K, T, E>(
    source: S,
    key_fn: KeyFn,
    flush: Flush,
) -> BufferDistinct<S, KeyFn, Flush, K, T>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    KeyFn: Fn(&T) -> K,
    Flush: Stream + Unpin,
    K: PartialEq,
{
    BufferDistinct {
        source,
        key_fn,
        flush: Some(flush),
        buffer: Vec::new(),
        run: None,
        terminated: false,
    }
}

/// The stream returned by [`buffer_distinct`] and
/// [`buffer_distinct_with_flush`].
pub struct BufferDistinct<S, KeyFn, Flush, K, T> {
    source: S,
    key_fn: KeyFn,
    flush: Option<Flush>,
    buffer: Vec<T>,
    // key of the open run; None right after a flush or an emission at
    // source end, so any next item starts fresh
    run: Option<K>,
    terminated: bool,
}

impl<S, KeyFn, Flush, K, T, E> Stream for BufferDistinct<S, KeyFn, Flush, K, T>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    KeyFn: Fn(&T) -> K,
    Flush: Stream + Unpin,
    K: PartialEq,
    Self: Unpin,
{
    type Item = Result<Vec<T>, E>;

    fn poll_next(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let unpinned = self.get_mut();

        if unpinned.terminated {
            return Poll::Ready(None);
        }

        if let Some(flush) = &mut unpinned.flush {
            loop {
                match flush.poll_next_unpin(ctx) {
                    Poll::Pending => break,
                    Poll::Ready(Some(_)) => {
                        unpinned.run = None;
                        if !unpinned.buffer.is_empty() {
                            return Poll::Ready(Some(Ok(mem::take(&mut unpinned.buffer))));
                        }
                    }
                    Poll::Ready(None) => {
                        unpinned.flush = None;
                        break;
                    }
                }
            }
        }

        loop {
            match unpinned.source.poll_next_unpin(ctx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(item))) => {
                    let key = (unpinned.key_fn)(&item);
                    match &unpinned.run {
                        Some(run) if *run == key => unpinned.buffer.push(item),
                        Some(_) => {
                            unpinned.run = Some(key);
                            let emitted = mem::replace(&mut unpinned.buffer, vec![item]);
                            return Poll::Ready(Some(Ok(emitted)));
                        }
                        None => {
                            unpinned.run = Some(key);
                            unpinned.buffer.push(item);
                        }
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    unpinned.terminated = true;
                    unpinned.buffer.clear();
                    unpinned.run = None;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    unpinned.terminated = true;
                    return match unpinned.buffer.is_empty() {
                        true => Poll::Ready(None),
                        false => Poll::Ready(Some(Ok(mem::take(&mut unpinned.buffer)))),
                    };
                }
            }
        }
    }
}
