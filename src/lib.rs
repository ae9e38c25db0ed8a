//! Streamloader is a toolkit of composable async data-fetching primitives:
//! request batching and coalescing in the style of the
//! [dataloader pattern](https://github.com/graphql/dataloader), single-flight
//! caching, layered cache fallback, and keyed joins over fallible streams.
//! It hides the batching and caching logic from requesters: each caller asks
//! for one item and awaits one future, without knowing anything about the
//! bulk operations happening underneath.
//!
//! Everything is keyed by a canonical encoding of the request arguments
//! ([`args_to_key`]), so two requests are "the same" exactly when their
//! arguments are structurally equal, regardless of field order or
//! null-valued entries.
//!
//! ## Overview
//!
//! Suppose you have an API that fetches user data and supports batching:
//! supply several user ids in one request and it returns results for all of
//! them. Wrap the bulk call in a [`BatchLoader`] and callers can request
//! users one at a time; requests arriving within the same buffering window
//! are coalesced into one bulk call, duplicate keys collapse to a single
//! occurrence, and every key's result is cached so later requests replay it
//! without refetching:
//!
//! ```
//! use std::num::NonZeroUsize;
//!
//! use futures::{executor::block_on, future, join};
//! use serde::Serialize;
//! use streamloader::{BatchLoader, BatchRules};
//!
//! #[derive(Debug, Clone, Serialize)]
//! struct UserId(u64);
//!
//! #[derive(Debug, Clone)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! async fn fetch_users(ids: Vec<UserId>) -> Result<Vec<User>, String> {
//!     // one bulk API call for the whole batch
//!     Ok(ids
//!         .into_iter()
//!         .map(|UserId(id)| User {
//!             id,
//!             name: format!("user-{}", id),
//!         })
//!         .collect())
//! }
//!
//! let loader = BatchLoader::new(BatchRules {
//!     loader: |ids| fetch_users(ids),
//!     args_from_item: |user: &User| UserId(user.id),
//!     // close each buffering window on its first poll; production code
//!     // would use a timer future here
//!     window: || future::ready(()),
//!     batch_size: NonZeroUsize::new(100).unwrap(),
//!     max_items: None,
//! });
//!
//! let (alice, bob) = block_on(async {
//!     join!(loader.load(UserId(1)), loader.load(UserId(2)))
//! });
//!
//! assert_eq!(alice.unwrap().unwrap().name, "user-1");
//! assert_eq!(bob.unwrap().unwrap().name, "user-2");
//! ```
//!
//! The loader is runtime-agnostic: nothing is spawned, and the shared batch
//! work is driven by whichever requesting future is polled. Dropping a
//! future hands the driving role to another requester of the same batch.
//!
//! ## Caching
//!
//! The cache inside the loader is available standalone as [`KeyCache`], a
//! single-flight broadcast cache: at most one fetch is ever in flight per
//! key, and its resolution is shared with every waiter. Caches (and any
//! other [`CacheLayer`]) stack into a [`CacheChain`], which checks layers
//! outermost-first and writes hits back up through the layers that missed.
//!
//! ## Stream operators
//!
//! Three operators over `Stream<Item = Result<T, E>>` round out the kit:
//! [`completion_signal`] collapses a stream into a single end-of-stream
//! sentinel, [`buffer_distinct`] groups runs of consecutive equal-keyed
//! items, and [`zip_diff`] joins two streams by key, emitting matched pairs
//! as they meet and single-sided leftovers when a side completes.
//!
//! Keys are compared by their canonical encoding:
//!
//! ```
//! use serde_json::json;
//! use streamloader::args_to_key;
//!
//! // field order and null-valued entries never affect the key
//! assert_eq!(
//!     args_to_key(&json!({"page": 2, "tag": null, "q": "hats"})),
//!     args_to_key(&json!({"q": "hats", "page": 2})),
//! );
//! ```

mod buffer_distinct;
mod cachechain;
mod complete;
mod error;
mod key;
mod keycache;
mod loader;
mod payload;
mod wakerset;
mod zip_diff;

pub use buffer_distinct::{buffer_distinct, buffer_distinct_with_flush, BufferDistinct};
pub use cachechain::CacheChain;
pub use complete::{completion_signal, Complete, CompletionSignal};
pub use error::LoadError;
pub use key::{args_to_key, encode_args, KeyError};
pub use keycache::KeyCache;
pub use loader::{BatchLoader, BatchRules, LoadFuture};
pub use payload::{CacheLayer, Payload, Source};
pub use zip_diff::{zip_diff, zip_diff_on, JoinPair, ZipDiff};
