//! Per-key single-flight broadcast cache.

use std::{
    collections::HashMap,
    future::Future,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::{
    payload::{CacheLayer, Payload},
    wakerset::{WakerSet, WakerToken},
};

/// The broadcast cell behind one key: either still waiting for whoever
/// owns the fetch to call `save`, or resolved and replayable to any number
/// of subscribers. A slot resolves at most once.
enum SlotState<A, I> {
    Pending(WakerSet),
    Resolved(Payload<A, I>),
}

pub(crate) struct Slot<A, I> {
    state: SlotState<A, I>,
}

pub(crate) type SharedSlot<A, I> = Arc<Mutex<Slot<A, I>>>;

struct SlotEntry<A, I> {
    slot: SharedSlot<A, I>,
    last_used: u64,
}

struct CacheState<A, I> {
    slots: HashMap<String, SlotEntry<A, I>>,
    // monotonic touch stamp for LRU ordering
    stamp: u64,
}

/// What [`KeyCache::claim`] found for a key.
pub(crate) enum Lookup<A, I> {
    /// The key is resolved; here is a replay of the cached payload.
    Hit(Payload<A, I>),
    /// Another caller owns the fetch; wait on its slot.
    Wait(SharedSlot<A, I>),
    /// No slot existed. A pending one has been created and the caller now
    /// owns the fetch for this key.
    Claimed,
}

/// A single-flight cache: at most one fetch is ever in flight per key.
///
/// The first `load` for a key passes the payload through unchanged,
/// signalling that the caller should go fetch it, and opens a pending slot.
/// Every later `load` for the same key waits on that slot instead of
/// fetching, and `save` resolves the slot, broadcasting the resolved
/// payload to all current waiters and replaying it to later ones. `clear`
/// deletes the slot so the next `load` misses afresh.
///
/// With a `max_items` bound, slots are evicted in least-recently-used
/// order, whether or not they have resolved. Evicting (or clearing) a slot
/// does not disturb futures already waiting on it; if no caller saves that
/// key they stay pending, the same unresolved-slot gap left by a fetch
/// that errors before saving. Callers manage both with `clear`.
pub struct KeyCache<A, I> {
    name: String,
    max_items: Option<NonZeroUsize>,
    state: Arc<Mutex<CacheState<A, I>>>,
}

impl<A, I> Clone for KeyCache<A, I> {
    fn clone(&self) -> Self {
        KeyCache {
            name: self.name.clone(),
            max_items: self.max_items,
            state: self.state.clone(),
        }
    }
}

impl<A, I> KeyCache<A, I> {
    /// Creates an unbounded cache.
    pub fn new(name: impl Into<String>) -> Self {
        KeyCache {
            name: name.into(),
            max_items: None,
            state: Arc::new(Mutex::new(CacheState {
                slots: HashMap::new(),
                stamp: 0,
            })),
        }
    }

    /// Creates a cache holding at most `max_items` slots, evicting the
    /// least recently used slot when the bound is exceeded.
    pub fn bounded(name: impl Into<String>, max_items: NonZeroUsize) -> Self {
        KeyCache {
            max_items: Some(max_items),
            ..KeyCache::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live slots, pending and resolved alike.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes any slot for `key`, letting the next load miss afresh.
    pub fn clear_key(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if state.slots.remove(key).is_some() {
            trace!(cache = %self.name, %key, "cleared slot");
        }
    }
}

impl<A, I> KeyCache<A, I>
where
    A: Clone,
    I: Clone,
{
    /// Looks up `key`, claiming it with a fresh pending slot if nothing
    /// holds it yet. Touches the slot for LRU purposes either way.
    pub(crate) fn claim(&self, key: &str) -> Lookup<A, I> {
        let mut state = self.state.lock().unwrap();
        state.stamp += 1;
        let stamp = state.stamp;

        if let Some(entry) = state.slots.get_mut(key) {
            entry.last_used = stamp;
            let slot = entry.slot.clone();
            let found = match &slot.lock().unwrap().state {
                SlotState::Resolved(payload) => {
                    trace!(cache = %self.name, %key, "hit");
                    Some(payload.clone())
                }
                SlotState::Pending(_) => {
                    trace!(cache = %self.name, %key, "joining in-flight fetch");
                    None
                }
            };
            return match found {
                Some(payload) => Lookup::Hit(payload),
                None => Lookup::Wait(slot),
            };
        }

        trace!(cache = %self.name, %key, "miss, claiming");
        let slot = Arc::new(Mutex::new(Slot {
            state: SlotState::Pending(WakerSet::default()),
        }));
        state.slots.insert(key.to_string(), SlotEntry { slot, last_used: stamp });

        if let Some(max_items) = self.max_items {
            if state.slots.len() > max_items.get() {
                self.evict_lru(&mut state.slots, key);
            }
        }

        Lookup::Claimed
    }

    /// Resolves the pending slot for this payload's key, if there is one,
    /// waking every waiter. A slot that already resolved is left alone.
    pub(crate) fn resolve(&self, payload: &Payload<A, I>) {
        let mut state = self.state.lock().unwrap();
        state.stamp += 1;
        let stamp = state.stamp;

        if let Some(entry) = state.slots.get_mut(&payload.key) {
            entry.last_used = stamp;
            let mut slot = entry.slot.lock().unwrap();
            if let SlotState::Pending(wakers) = &mut slot.state {
                let wakers = wakers.take();
                slot.state = SlotState::Resolved(payload.clone());
                drop(slot);
                trace!(cache = %self.name, key = %payload.key, "slot resolved");
                wakers.wake_all();
            }
        }
    }

    fn evict_lru(&self, slots: &mut HashMap<String, SlotEntry<A, I>>, keep: &str) {
        let victim = slots
            .iter()
            .filter(|(key, _)| *key != keep)
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());

        if let Some(victim) = victim {
            debug!(cache = %self.name, key = %victim, "evicting least-recently-used slot");
            slots.remove(&victim);
        }
    }

    /// Single-flight load. A miss claims the key and returns the payload
    /// unchanged; a join waits for whoever claimed it; a hit replays the
    /// resolved payload.
    pub async fn load(&self, payload: Payload<A, I>) -> Payload<A, I> {
        match self.claim(&payload.key) {
            Lookup::Hit(cached) => cached,
            Lookup::Wait(slot) => SlotFuture::new(slot).await,
            Lookup::Claimed => payload,
        }
    }

    /// Resolves the key's pending slot with this payload, broadcasting to
    /// every waiter. Passes the payload through unchanged regardless.
    pub async fn save(&self, payload: Payload<A, I>) -> Payload<A, I> {
        self.resolve(&payload);
        payload
    }

    /// Deletes the key's slot and passes the payload through unchanged.
    pub async fn clear(&self, payload: Payload<A, I>) -> Payload<A, I> {
        self.clear_key(&payload.key);
        payload
    }
}

#[async_trait]
impl<A, I, E> CacheLayer<A, I, E> for KeyCache<A, I>
where
    A: Clone + Send + Sync + 'static,
    I: Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, payload: Payload<A, I>) -> Result<Payload<A, I>, E> {
        Ok(KeyCache::load(self, payload).await)
    }

    async fn save(&self, payload: Payload<A, I>) -> Result<Payload<A, I>, E> {
        Ok(KeyCache::save(self, payload).await)
    }

    async fn clear(&self, payload: Payload<A, I>) -> Result<Payload<A, I>, E> {
        Ok(KeyCache::clear(self, payload).await)
    }
}

/// Waits for a slot to be resolved by whoever owns its fetch, then yields
/// a clone of the broadcast payload.
pub(crate) struct SlotFuture<A, I> {
    slot: SharedSlot<A, I>,
    token: Option<WakerToken>,
}

impl<A, I> SlotFuture<A, I> {
    pub(crate) fn new(slot: SharedSlot<A, I>) -> Self {
        SlotFuture { slot, token: None }
    }
}

impl<A, I> Future for SlotFuture<A, I>
where
    A: Clone,
    I: Clone,
{
    type Output = Payload<A, I>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = self.get_mut();
        let mut slot = unpinned.slot.lock().unwrap();
        match &mut slot.state {
            SlotState::Resolved(payload) => {
                unpinned.token = None;
                Poll::Ready(payload.clone())
            }
            SlotState::Pending(wakers) => {
                wakers.register(&mut unpinned.token, ctx.waker());
                Poll::Pending
            }
        }
    }
}

impl<A, I> Drop for SlotFuture<A, I> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Ok(mut slot) = self.slot.lock() {
                if let SlotState::Pending(wakers) = &mut slot.state {
                    wakers.discard(token);
                }
            }
        }
    }
}
