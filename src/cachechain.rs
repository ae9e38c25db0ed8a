//! Ordered composition of cache layers into a single lookup unit.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::payload::{CacheLayer, Payload, Source};

/// A stack of cache layers checked outermost-first.
///
/// `load` walks the layers downward until one of them fills the payload's
/// item, then writes the result back up through the `save` of every layer
/// that missed above the hit, so faster layers cache it for next time.
/// Layers below the hit are never consulted and layers that did not miss
/// are never written. A full miss is written back the same way through
/// every layer above the innermost, so layers that record in-flight
/// lookups learn that nothing was found; only the innermost layer's
/// `save` is skipped. The payload's [`Source`] tag records where the
/// lookup was satisfied: `Input` if it arrived already resolved, the
/// hitting layer's name otherwise; a full miss carries no tag.
///
/// `clear` is a broadcast: it applies every layer's `clear` in order,
/// regardless of what any layer holds.
///
/// A chain implements [`CacheLayer`] itself (with a pass-through `save`),
/// so chains can be stacked inside other chains.
pub struct CacheChain<A, I, E> {
    name: String,
    layers: Vec<Arc<dyn CacheLayer<A, I, E>>>,
}

impl<A, I, E> CacheChain<A, I, E>
where
    A: Send + 'static,
    I: Send + 'static,
    E: Send + 'static,
{
    /// Creates an empty chain. With no layers, `load` and `clear` pass
    /// payloads through untouched.
    pub fn new(name: impl Into<String>) -> Self {
        CacheChain {
            name: name.into(),
            layers: Vec::new(),
        }
    }

    /// Appends a layer below every layer added so far.
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: CacheLayer<A, I, E> + 'static,
    {
        self.layers.push(Arc::new(layer));
        self
    }

    /// Appends an already-shared layer below every layer added so far.
    pub fn layer_arc(mut self, layer: Arc<dyn CacheLayer<A, I, E>>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descending lookup with ascending write-back.
    pub async fn load(&self, mut payload: Payload<A, I>) -> Result<Payload<A, I>, E> {
        if payload.is_resolved() {
            payload.source = Some(Source::Input);
            return Ok(payload);
        }

        let mut hit = None;
        for (index, layer) in self.layers.iter().enumerate() {
            payload = layer.load(payload).await?;
            if payload.is_resolved() {
                trace!(chain = %self.name, layer = layer.name(), key = %payload.key, "hit");
                payload.source = Some(Source::Layer(layer.name().to_string()));
                hit = Some(index);
                break;
            }
        }

        // write the result back through the layers that missed, from just
        // above the hit up to the outermost; a full miss writes back the
        // unresolved payload through everything above the innermost layer
        let missed_above = match hit {
            Some(index) => index,
            None => {
                trace!(chain = %self.name, key = %payload.key, "miss on every layer");
                payload.source = None;
                self.layers.len().saturating_sub(1)
            }
        };
        for layer in self.layers[..missed_above].iter().rev() {
            payload = layer.save(payload).await?;
        }

        Ok(payload)
    }

    /// Applies every layer's `clear`, outermost first.
    pub async fn clear(&self, mut payload: Payload<A, I>) -> Result<Payload<A, I>, E> {
        for layer in &self.layers {
            payload = layer.clear(payload).await?;
        }
        Ok(payload)
    }
}

#[async_trait]
impl<A, I, E> CacheLayer<A, I, E> for CacheChain<A, I, E>
where
    A: Send + Sync + 'static,
    I: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, payload: Payload<A, I>) -> Result<Payload<A, I>, E> {
        CacheChain::load(self, payload).await
    }

    async fn clear(&self, payload: Payload<A, I>) -> Result<Payload<A, I>, E> {
        CacheChain::clear(self, payload).await
    }
}
