//! Single-flight cache behavior and layered chain fallback.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use futures::{executor, FutureExt};
use streamloader::{CacheChain, CacheLayer, KeyCache, Payload, Source};

fn request(id: u32) -> Payload<u32, String> {
    Payload::new(id).unwrap()
}

#[test]
fn miss_claims_and_waiters_join() {
    let cache = KeyCache::<u32, String>::new("memory");

    // first load misses: the payload comes back unresolved, meaning this
    // caller owns the fetch
    let first = executor::block_on(cache.load(request(1)));
    assert!(!first.is_resolved());
    assert_eq!(cache.len(), 1);

    // a second load joins the in-flight fetch instead of fetching
    let mut waiter = Box::pin(cache.load(request(1)));
    assert!(waiter.as_mut().now_or_never().is_none());

    // resolving broadcasts to the waiter
    executor::block_on(cache.save(request(1).resolve(Some("one".to_string()))));
    let got = executor::block_on(waiter);
    assert_eq!(got.item.as_deref(), Some("one"));
}

#[test]
fn resolved_slots_replay() {
    let cache = KeyCache::<u32, String>::new("memory");

    executor::block_on(cache.load(request(1)));
    executor::block_on(cache.save(request(1).resolve(Some("one".to_string()))));

    let replay = executor::block_on(cache.load(request(1)));
    assert_eq!(replay.item.as_deref(), Some("one"));

    // not-found resolutions replay the same way
    executor::block_on(cache.load(request(2)));
    executor::block_on(cache.save(request(2).resolve(None)));
    let replay = executor::block_on(cache.load(request(2)));
    assert!(!replay.is_resolved());
    assert_eq!(cache.len(), 2);
}

#[test]
fn clear_makes_the_next_load_miss() {
    let cache = KeyCache::<u32, String>::new("memory");

    executor::block_on(cache.load(request(1)));
    executor::block_on(cache.save(request(1).resolve(Some("one".to_string()))));
    executor::block_on(cache.clear(request(1)));
    assert!(cache.is_empty());

    let fresh = executor::block_on(cache.load(request(1)));
    assert!(!fresh.is_resolved());
}

#[test]
fn bounded_cache_evicts_least_recently_used() {
    let cache = KeyCache::<u32, String>::bounded("memory", 2.try_into().unwrap());

    executor::block_on(cache.load(request(1)));
    executor::block_on(cache.save(request(1).resolve(Some("one".to_string()))));
    executor::block_on(cache.load(request(2)));
    executor::block_on(cache.save(request(2).resolve(Some("two".to_string()))));

    // touch key 1 so key 2 becomes the eviction candidate
    executor::block_on(cache.load(request(1)));

    executor::block_on(cache.load(request(3)));
    assert_eq!(cache.len(), 2);

    // key 1 survived the eviction
    let kept = executor::block_on(cache.load(request(1)));
    assert_eq!(kept.item.as_deref(), Some("one"));

    // key 2 did not: this load is a fresh miss
    let evicted = executor::block_on(cache.load(request(2)));
    assert!(!evicted.is_resolved());
}

/// A fixed lookup table layer that counts how it is used. `save` stores
/// into the table, so write-back is observable.
struct TableLayer {
    name: &'static str,
    items: Mutex<HashMap<String, String>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
    clears: AtomicUsize,
}

impl TableLayer {
    fn new(name: &'static str, entries: &[(u32, &str)]) -> Arc<Self> {
        let items = entries
            .iter()
            .map(|(id, item)| (request(*id).key, item.to_string()))
            .collect();
        Arc::new(TableLayer {
            name,
            items: Mutex::new(items),
            loads: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CacheLayer<u32, String, &'static str> for TableLayer {
    fn name(&self) -> &str {
        self.name
    }

    async fn load(
        &self,
        payload: Payload<u32, String>,
    ) -> Result<Payload<u32, String>, &'static str> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let item = self.items.lock().unwrap().get(&payload.key).cloned();
        Ok(payload.resolve(item))
    }

    async fn save(
        &self,
        payload: Payload<u32, String>,
    ) -> Result<Payload<u32, String>, &'static str> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if let Some(item) = &payload.item {
            self.items
                .lock()
                .unwrap()
                .insert(payload.key.clone(), item.clone());
        }
        Ok(payload)
    }

    async fn clear(
        &self,
        payload: Payload<u32, String>,
    ) -> Result<Payload<u32, String>, &'static str> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.items.lock().unwrap().remove(&payload.key);
        Ok(payload)
    }
}

struct FailingLayer;

#[async_trait]
impl CacheLayer<u32, String, &'static str> for FailingLayer {
    fn name(&self) -> &str {
        "failing"
    }

    async fn load(
        &self,
        _payload: Payload<u32, String>,
    ) -> Result<Payload<u32, String>, &'static str> {
        Err("layer exploded")
    }
}

#[test]
fn chain_hit_writes_back_through_missed_layers() {
    let outer = TableLayer::new("outer", &[]);
    let middle = TableLayer::new("middle", &[(1, "one")]);
    let lower = TableLayer::new("lower", &[(1, "stale")]);

    let chain = CacheChain::new("chain")
        .layer_arc(outer.clone() as Arc<dyn CacheLayer<u32, String, &'static str>>)
        .layer_arc(middle.clone() as Arc<dyn CacheLayer<u32, String, &'static str>>)
        .layer_arc(lower.clone() as Arc<dyn CacheLayer<u32, String, &'static str>>);

    let found = executor::block_on(chain.load(request(1))).unwrap();
    assert_eq!(found.item.as_deref(), Some("one"));
    assert_eq!(found.source, Some(Source::Layer("middle".to_string())));

    // the layer below the hit is never consulted
    assert_eq!(lower.loads.load(Ordering::SeqCst), 0);
    // only the layer above the hit is written back
    assert_eq!(outer.saves.load(Ordering::SeqCst), 1);
    assert_eq!(middle.saves.load(Ordering::SeqCst), 0);

    // the write-back makes the next lookup hit the outer layer
    let again = executor::block_on(chain.load(request(1))).unwrap();
    assert_eq!(again.source, Some(Source::Layer("outer".to_string())));
    assert_eq!(middle.loads.load(Ordering::SeqCst), 1);
}

#[test]
fn chain_full_miss_has_no_source() {
    let outer = TableLayer::new("outer", &[]);
    let lower = TableLayer::new("lower", &[]);

    let chain = CacheChain::new("chain")
        .layer_arc(outer.clone() as Arc<dyn CacheLayer<u32, String, &'static str>>)
        .layer_arc(lower.clone() as Arc<dyn CacheLayer<u32, String, &'static str>>);

    let missed = executor::block_on(chain.load(request(9))).unwrap();
    assert!(!missed.is_resolved());
    assert_eq!(missed.source, None);

    // the miss still writes back through every layer above the innermost
    assert_eq!(outer.saves.load(Ordering::SeqCst), 1);
    assert_eq!(lower.saves.load(Ordering::SeqCst), 0);
}

#[test]
fn full_miss_resolves_single_flight_layers() {
    let memory = KeyCache::<u32, String>::new("memory");
    let backend = TableLayer::new("backend", &[]);

    let chain = CacheChain::new("chain")
        .layer(memory.clone())
        .layer_arc(backend.clone() as Arc<dyn CacheLayer<u32, String, &'static str>>);

    let missed = executor::block_on(chain.load(request(9))).unwrap();
    assert!(!missed.is_resolved());

    // the full-miss write-back resolved the memory layer's slot, so a
    // repeat lookup replays not-found instead of waiting on the first
    // lookup's fetch
    let mut repeat = Box::pin(chain.load(request(9)));
    let replay = repeat
        .as_mut()
        .now_or_never()
        .expect("repeat lookup must not wait")
        .unwrap();
    assert!(!replay.is_resolved());
    assert_eq!(backend.loads.load(Ordering::SeqCst), 2);
}

#[test]
fn chain_passes_resolved_input_through() {
    let outer = TableLayer::new("outer", &[]);

    let chain =
        CacheChain::new("chain").layer_arc(outer.clone() as Arc<dyn CacheLayer<u32, String, _>>);

    let input = request(1).resolve(Some("given".to_string()));
    let out = executor::block_on(chain.load(input)).unwrap();
    assert_eq!(out.source, Some(Source::Input));
    assert_eq!(outer.loads.load(Ordering::SeqCst), 0);
    assert_eq!(outer.saves.load(Ordering::SeqCst), 0);
}

#[test]
fn chain_propagates_layer_errors() {
    let lower = TableLayer::new("lower", &[(1, "one")]);

    let chain = CacheChain::new("chain")
        .layer(FailingLayer)
        .layer_arc(lower.clone() as Arc<dyn CacheLayer<u32, String, _>>);

    let result = executor::block_on(chain.load(request(1)));
    assert_eq!(result.unwrap_err(), "layer exploded");
    assert_eq!(lower.loads.load(Ordering::SeqCst), 0);
}

#[test]
fn chain_clear_reaches_every_layer() {
    let outer = TableLayer::new("outer", &[(1, "one")]);
    let lower = TableLayer::new("lower", &[(1, "one")]);

    let chain = CacheChain::new("chain")
        .layer_arc(outer.clone() as Arc<dyn CacheLayer<u32, String, &'static str>>)
        .layer_arc(lower.clone() as Arc<dyn CacheLayer<u32, String, &'static str>>);

    executor::block_on(chain.clear(request(1))).unwrap();
    assert_eq!(outer.clears.load(Ordering::SeqCst), 1);
    assert_eq!(lower.clears.load(Ordering::SeqCst), 1);

    let missed = executor::block_on(chain.load(request(1))).unwrap();
    assert!(!missed.is_resolved());
}

#[test]
fn key_cache_slots_into_a_chain() {
    let memory = KeyCache::<u32, String>::new("memory");
    let backend = TableLayer::new("backend", &[(1, "one")]);

    let chain = CacheChain::new("chain")
        .layer(memory.clone())
        .layer_arc(backend.clone() as Arc<dyn CacheLayer<u32, String, &'static str>>);

    let found = executor::block_on(chain.load(request(1))).unwrap();
    assert_eq!(found.source, Some(Source::Layer("backend".to_string())));

    // the write-back resolved the memory slot, so the next lookup stops
    // there
    let again = executor::block_on(chain.load(request(1))).unwrap();
    assert_eq!(again.source, Some(Source::Layer("memory".to_string())));
    assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
}
