//! Windowed request batching on top of the single-flight cache.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tracing::{debug, trace};

use crate::{
    error::LoadError,
    key::encode_args,
    keycache::{KeyCache, Lookup, SharedSlot, SlotFuture},
    payload::Payload,
    wakerset::{WakerSet, WakerToken},
};

/// Behavior for a [`BatchLoader`].
pub struct BatchRules<Loader, GetArgs, Windower> {
    /// The bulk fetch: takes every argument value of one sub-batch and
    /// returns the items it could find. Missing keys are fine; their
    /// requests resolve to "not found".
    pub loader: Loader,

    /// Recovers the argument value an item answers, so bulk results can be
    /// matched back to their requests through the same canonical key
    /// encoding.
    pub args_from_item: GetArgs,

    /// Factory for the buffering-window delay. Requests arriving while the
    /// delay runs are coalesced into one batch. Any timer future works
    /// (e.g. `futures_timer::Delay`); tests can use `future::ready(())`
    /// to close the window on first poll.
    pub window: Windower,

    /// Maximum keys per bulk call. A window holding more is split into
    /// sub-batches dispatched one at a time, in buffered order.
    pub batch_size: NonZeroUsize,

    /// Optional bound on the underlying [`KeyCache`].
    pub max_items: Option<NonZeroUsize>,
}

/// Everything a window resolves: each key of the window mapped to its own
/// outcome. Sub-batches fail independently, so one window can hold both
/// found items and errors.
type WindowOutcome<I, E> = HashMap<String, Result<Option<I>, LoadError<E>>>;

type Dispatch<A, I, E> =
    Box<dyn FnOnce(Vec<Payload<A, I>>) -> BoxFuture<'static, WindowOutcome<I, E>> + Send>;

/// One batching window, shared by every future enrolled in it and driven
/// by whichever of them polls. The delay and the batch job are boxed so
/// the state (and the futures holding it) stays independent of the
/// loader's closure types.
enum WindowState<A, I, E> {
    Accumulating {
        payloads: Vec<Payload<A, I>>,
        keys: HashSet<String>,
        delay: BoxFuture<'static, ()>,
        dispatch: Dispatch<A, I, E>,
        wakers: WakerSet,
    },
    Running {
        fut: BoxFuture<'static, WindowOutcome<I, E>>,
        wakers: WakerSet,
    },
    Done(WindowOutcome<I, E>),
}

type SharedWindow<A, I, E> = Arc<Mutex<WindowState<A, I, E>>>;

struct LoaderInner<A, I, E, Loader, GetArgs, Windower> {
    rules: BatchRules<Loader, GetArgs, Windower>,
    cache: KeyCache<A, I>,
    // The currently accumulating window, if any. Weak: once every future
    // of a window is gone the window goes with them.
    window: Mutex<Weak<Mutex<WindowState<A, I, E>>>>,
}

/// Coalesces individual keyed requests into windowed bulk calls.
///
/// Each [`load`] converts its arguments into a canonical key and consults
/// the single-flight cache: a key someone already resolved replays
/// immediately, a key someone is already fetching joins that fetch, and a
/// fresh key is enrolled in the open buffering window (opening one if
/// needed). When the window's delay elapses, its unique keys are split
/// into `batch_size` chunks and the bulk loader is called once per chunk,
/// strictly in order. Every request of the window then resolves from the
/// matched results, and each resolution is saved back through the cache so
/// joiners of the same key get the same item.
///
/// The batch job is not spawned anywhere: it is driven by the enrolled
/// futures themselves, with waker handoff keeping it moving if the driving
/// future is dropped. Dropping every future of a window abandons the
/// window; its keys keep their pending slots until [`clear`]ed.
///
/// [`load`]: BatchLoader::load
/// [`clear`]: BatchLoader::clear
pub struct BatchLoader<A, I, E, Loader, GetArgs, Windower> {
    inner: Arc<LoaderInner<A, I, E, Loader, GetArgs, Windower>>,
}

impl<A, I, E, Loader, GetArgs, Windower> Clone for BatchLoader<A, I, E, Loader, GetArgs, Windower> {
    fn clone(&self) -> Self {
        BatchLoader {
            inner: self.inner.clone(),
        }
    }
}

impl<A, I, E, Loader, Fut, GetArgs, Windower, Delay>
    BatchLoader<A, I, E, Loader, GetArgs, Windower>
where
    A: Serialize + Clone + Send + Sync + 'static,
    I: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    Loader: Fn(Vec<A>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<I>, E>> + Send + 'static,
    GetArgs: Fn(&I) -> A + Send + Sync + 'static,
    Windower: Fn() -> Delay + Send + Sync + 'static,
    Delay: Future<Output = ()> + Send + 'static,
{
    pub fn new(rules: BatchRules<Loader, GetArgs, Windower>) -> Self {
        let cache = match rules.max_items {
            Some(max_items) => KeyCache::bounded("batch-loader", max_items),
            None => KeyCache::new("batch-loader"),
        };
        BatchLoader::with_cache(rules, cache)
    }

    /// Builds a loader around an existing cache, sharing its slots (and
    /// ignoring `rules.max_items`).
    pub fn with_cache(rules: BatchRules<Loader, GetArgs, Windower>, cache: KeyCache<A, I>) -> Self {
        BatchLoader {
            inner: Arc::new(LoaderInner {
                rules,
                cache,
                window: Mutex::new(Weak::new()),
            }),
        }
    }

    /// The cache backing this loader.
    pub fn cache(&self) -> &KeyCache<A, I> {
        &self.inner.cache
    }

    /// Forgets any cached or in-flight state for these arguments, so the
    /// next load fetches afresh.
    pub fn clear(&self, args: &A) -> Result<(), LoadError<E>> {
        let key = encode_args(args)?;
        self.inner.cache.clear_key(&key);
        Ok(())
    }

    /// Requests the item for one argument value. The returned future
    /// resolves with the matched item, `None` if the bulk loader returned
    /// nothing for this key, or the error that failed this key's
    /// sub-batch.
    pub fn load(&self, args: A) -> LoadFuture<A, I, E> {
        let key = match encode_args(&args) {
            Ok(key) => key,
            Err(err) => return LoadFuture::ready(Err(err.into())),
        };

        let mut current = self.inner.window.lock().unwrap();

        // A key already enrolled in the open window joins it as another
        // driver; this is what makes two loads of one key within a window
        // produce a single bulk-loader occurrence.
        if let Some(window) = current.upgrade() {
            let enrolled = {
                let state = window.lock().unwrap();
                matches!(
                    &*state,
                    WindowState::Accumulating { keys, .. } if keys.contains(&key)
                )
            };
            if enrolled {
                trace!(%key, "coalesced into open window");
                return LoadFuture::drive(window, key);
            }
        }

        match self.inner.cache.claim(&key) {
            Lookup::Hit(payload) => LoadFuture::ready(Ok(payload.item)),
            Lookup::Wait(slot) => LoadFuture::wait(slot),
            Lookup::Claimed => {
                let payload = Payload::with_key(args, key.clone());

                if let Some(window) = current.upgrade() {
                    let mut state = window.lock().unwrap();
                    if let WindowState::Accumulating { payloads, keys, .. } = &mut *state {
                        keys.insert(key.clone());
                        payloads.push(payload);
                        drop(state);
                        return LoadFuture::drive(window, key);
                    }
                }

                let window = self.open_window(payload);
                *current = Arc::downgrade(&window);
                LoadFuture::drive(window, key)
            }
        }
    }

    fn open_window(&self, payload: Payload<A, I>) -> SharedWindow<A, I, E> {
        debug!(key = %payload.key, "opening batch window");

        let inner = self.inner.clone();
        let dispatch: Dispatch<A, I, E> =
            Box::new(move |payloads| batch_job(inner, payloads).boxed());

        let mut keys = HashSet::new();
        keys.insert(payload.key.clone());

        Arc::new(Mutex::new(WindowState::Accumulating {
            payloads: vec![payload],
            keys,
            delay: (self.inner.rules.window)().boxed(),
            dispatch,
            wakers: WakerSet::default(),
        }))
    }
}

/// The batch job for one closed window: split into sub-batches, call the
/// bulk loader once per sub-batch (strictly one at a time), match results
/// back by canonical key, and save every resolution through the cache so
/// slot waiters are released.
///
/// Sub-batches that already completed keep their results when a later one
/// fails: the failure is recorded only for the keys of the failed call and
/// of the calls that never ran. Those keys' slots stay pending until
/// cleared.
async fn batch_job<A, I, E, Loader, Fut, GetArgs, Windower>(
    inner: Arc<LoaderInner<A, I, E, Loader, GetArgs, Windower>>,
    payloads: Vec<Payload<A, I>>,
) -> WindowOutcome<I, E>
where
    A: Serialize + Clone + Send + Sync + 'static,
    I: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    Loader: Fn(Vec<A>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<I>, E>> + Send,
    GetArgs: Fn(&I) -> A + Send + Sync,
{
    let mut outcome = HashMap::with_capacity(payloads.len());
    let mut chunks = payloads.chunks(inner.rules.batch_size.get());

    while let Some(chunk) = chunks.next() {
        let args: Vec<A> = chunk.iter().map(|payload| payload.args.clone()).collect();
        trace!(size = args.len(), "dispatching sub-batch");

        let error = match (inner.rules.loader)(args).await {
            Ok(items) => match index_by_key(&inner.rules.args_from_item, items) {
                Ok(mut by_key) => {
                    for payload in chunk {
                        let done = payload.clone().resolve(by_key.remove(&payload.key));
                        inner.cache.resolve(&done);
                        outcome.insert(done.key.clone(), Ok(done.item));
                    }
                    continue;
                }
                Err(err) => err,
            },
            Err(err) => LoadError::Loader(err),
        };

        debug!("sub-batch failed");
        for payload in chunk.iter().chain(chunks.by_ref().flatten()) {
            outcome.insert(payload.key.clone(), Err(error.clone()));
        }
        break;
    }

    debug!(keys = outcome.len(), "batch window resolved");
    outcome
}

fn index_by_key<A, I, E>(
    args_from_item: impl Fn(&I) -> A,
    items: Vec<I>,
) -> Result<HashMap<String, I>, LoadError<E>>
where
    A: Serialize,
{
    let mut by_key = HashMap::with_capacity(items.len());
    for item in items {
        let key = encode_args(&args_from_item(&item))?;
        by_key.insert(key, item);
    }
    Ok(by_key)
}

enum LoadFutureInner<A, I, E> {
    /// Result already known (cache hit or key-encoding failure).
    Ready(Option<Result<Option<I>, LoadError<E>>>),
    /// Waiting on another caller's in-flight fetch.
    Wait(SlotFuture<A, I>),
    /// Enrolled in a window; this future helps drive it.
    Drive {
        window: Option<SharedWindow<A, I, E>>,
        key: String,
        token: Option<WakerToken>,
    },
}

/// The future returned by [`BatchLoader::load`].
pub struct LoadFuture<A, I, E> {
    inner: LoadFutureInner<A, I, E>,
}

impl<A, I, E> LoadFuture<A, I, E> {
    fn ready(result: Result<Option<I>, LoadError<E>>) -> Self {
        LoadFuture {
            inner: LoadFutureInner::Ready(Some(result)),
        }
    }

    fn wait(slot: SharedSlot<A, I>) -> Self {
        LoadFuture {
            inner: LoadFutureInner::Wait(SlotFuture::new(slot)),
        }
    }

    fn drive(window: SharedWindow<A, I, E>, key: String) -> Self {
        LoadFuture {
            inner: LoadFutureInner::Drive {
                window: Some(window),
                key,
                token: None,
            },
        }
    }
}

// No field is structurally pinned: the window and slot are shared handles
// behind Arcs and the batch future is boxed, so a LoadFuture can move
// freely even when items or errors cannot.
impl<A, I, E> Unpin for LoadFuture<A, I, E> {}

impl<A, I, E> Future for LoadFuture<A, I, E>
where
    A: Clone,
    I: Clone,
    E: Clone,
{
    type Output = Result<Option<I>, LoadError<E>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = self.get_mut();
        match &mut unpinned.inner {
            LoadFutureInner::Ready(result) => {
                Poll::Ready(result.take().expect("polled LoadFuture after completion"))
            }
            LoadFutureInner::Wait(slot) => {
                Pin::new(slot).poll(ctx).map(|payload| Ok(payload.item))
            }
            LoadFutureInner::Drive { window, key, token } => {
                let shared = window
                    .as_ref()
                    .expect("polled LoadFuture after completion")
                    .clone();
                let result = poll_window(&shared, key, token, ctx);
                if result.is_ready() {
                    *window = None;
                }
                result
            }
        }
    }
}

fn poll_window<A, I, E>(
    window: &SharedWindow<A, I, E>,
    key: &str,
    token: &mut Option<WakerToken>,
    ctx: &mut Context<'_>,
) -> Poll<Result<Option<I>, LoadError<E>>>
where
    I: Clone,
    E: Clone,
{
    // This lock is only held for the duration of one poll, never across
    // an await, so it is safe in an async context.
    let mut state = window.lock().unwrap();

    if let WindowState::Accumulating { delay, wakers, .. } = &mut *state {
        if delay.poll_unpin(ctx).is_pending() {
            // This waker now drives the window's delay.
            wakers.register(token, ctx.waker());
            return Poll::Pending;
        }

        // The window has closed; hand its payloads to the batch job. The
        // placeholder is overwritten before the lock is released.
        let closed = mem::replace(&mut *state, WindowState::Done(HashMap::new()));
        if let WindowState::Accumulating {
            payloads,
            dispatch,
            wakers,
            ..
        } = closed
        {
            debug!(keys = payloads.len(), "batch window closed");
            *state = WindowState::Running {
                fut: dispatch(payloads),
                wakers,
            };
        }
    }

    if let WindowState::Running { fut, wakers } = &mut *state {
        match fut.poll_unpin(ctx) {
            Poll::Pending => {
                // This waker now drives the batch job.
                wakers.register(token, ctx.waker());
                return Poll::Pending;
            }
            Poll::Ready(result) => {
                // Signal every other waiting future to come take its
                // result; this one is about to grab its own.
                let wakers = wakers.take();
                wakers.wake_all_except(token.take());
                *state = WindowState::Done(result);
            }
        }
    }

    match &*state {
        WindowState::Done(outcome) => {
            // Every key of the window is present in the outcome map.
            let result = outcome
                .get(key)
                .cloned()
                .expect("batch window resolved without this key");
            Poll::Ready(result)
        }
        _ => unreachable!("window state failed to advance"),
    }
}

impl<A, I, E> Drop for LoadFuture<A, I, E> {
    fn drop(&mut self) {
        // If this future was driving a window, another enrolled future
        // must be woken to take over; the batch itself is not cancelled,
        // since its results populate the cache for every joiner.
        if let LoadFutureInner::Drive {
            window: Some(window),
            token: Some(token),
            ..
        } = &mut self.inner
        {
            if let Ok(mut state) = window.lock() {
                match &mut *state {
                    WindowState::Accumulating { wakers, .. }
                    | WindowState::Running { wakers, .. } => wakers.discard_and_wake(*token),
                    WindowState::Done(_) => {}
                }
            }
        }
    }
}
