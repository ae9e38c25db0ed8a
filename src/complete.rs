//! Graceful-end detection for fallible streams.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::stream::{Stream, StreamExt};

/// Sentinel emitted by [`completion_signal`] when its source ends
/// gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Complete;

/// Collapses a fallible stream into its termination event.
///
/// Items are consumed and discarded. When the source ends gracefully the
/// output yields exactly one `Ok(Complete)` and ends; a source error is
/// forwarded instead and no sentinel follows. Useful as a timing trigger,
/// e.g. as the flush stream of
/// [`buffer_distinct_with_flush`](crate::buffer_distinct_with_flush).
pub fn completion_signal<S, T, E>(source: S) -> CompletionSignal<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    CompletionSignal {
        source,
        terminated: false,
    }
}

/// The stream returned by [`completion_signal`].
#[derive(Debug)]
pub struct CompletionSignal<S> {
    source: S,
    terminated: bool,
}

impl<S, T, E> Stream for CompletionSignal<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    type Item = Result<Complete, E>;

    fn poll_next(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let unpinned = self.get_mut();

        if unpinned.terminated {
            return Poll::Ready(None);
        }

        loop {
            match unpinned.source.poll_next_unpin(ctx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(err))) => {
                    unpinned.terminated = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    unpinned.terminated = true;
                    return Poll::Ready(Some(Ok(Complete)));
                }
            }
        }
    }
}
