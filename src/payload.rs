//! The payload type that flows through every cache operator, and the
//! layer trait that caches implement.

use async_trait::async_trait;
use serde::Serialize;

use crate::key::{encode_args, KeyError};

/// Where a chain lookup was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// The payload already carried an item when it entered the chain.
    Input,
    /// The named layer produced the item.
    Layer(String),
}

/// A keyed request travelling through the cache operators.
///
/// `item` is `None` until the request is resolved; a resolved payload with
/// `item == None` means the request completed but nothing was found. Cache
/// operators compare and route payloads only by `key`.
#[derive(Debug, Clone)]
pub struct Payload<A, I> {
    pub args: A,
    pub key: String,
    pub item: Option<I>,
    pub source: Option<Source>,
}

impl<A, I> Payload<A, I> {
    /// Creates an unresolved payload, deriving the canonical key from the
    /// arguments.
    pub fn new(args: A) -> Result<Self, KeyError>
    where
        A: Serialize,
    {
        let key = encode_args(&args)?;
        Ok(Payload::with_key(args, key))
    }

    /// Creates an unresolved payload with a precomputed key.
    pub fn with_key(args: A, key: String) -> Self {
        Payload {
            args,
            key,
            item: None,
            source: None,
        }
    }

    /// Marks this payload resolved with the given lookup result. `None`
    /// records a completed fetch that found nothing.
    pub fn resolve(mut self, item: Option<I>) -> Self {
        self.item = item;
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.item.is_some()
    }
}

/// One layer in a cache stack.
///
/// A layer is anything that can look a payload up by key. `save` and
/// `clear` are optional capabilities: the default implementations pass the
/// payload through untouched, so read-only sources only implement `load`.
///
/// `load` must behave as a pipeline stage: it consumes a payload and
/// returns a payload, filling `item` in when the layer can resolve the
/// key. Errors propagate to the caller unchanged; the core never retries.
#[async_trait]
pub trait CacheLayer<A, I, E>: Send + Sync
where
    A: Send + 'static,
    I: Send + 'static,
    E: Send + 'static,
{
    /// The layer's name, used for [`Source`] tagging.
    fn name(&self) -> &str;

    async fn load(&self, payload: Payload<A, I>) -> Result<Payload<A, I>, E>;

    async fn save(&self, payload: Payload<A, I>) -> Result<Payload<A, I>, E> {
        Ok(payload)
    }

    async fn clear(&self, payload: Payload<A, I>) -> Result<Payload<A, I>, E> {
        Ok(payload)
    }
}
