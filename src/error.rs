//! Error types for the batching loader.

use thiserror::Error;

use crate::key::KeyError;

/// The ways a single [`load`] request can fail.
///
/// The user-supplied bulk loader's error type `E` stays generic; when one
/// bulk call fails, its error is cloned and broadcast to every future that
/// joined the same batch window.
///
/// [`load`]: crate::BatchLoader::load
#[derive(Debug, Clone, Error)]
pub enum LoadError<E> {
    /// The request arguments could not be encoded into a canonical key.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The bulk loader call covering this request failed.
    #[error("bulk loader failed")]
    Loader(E),
}
