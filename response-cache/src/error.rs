use thiserror::Error;

/// Generic boxed error type used at the contract boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `Result` typedef defaulting to [`CacheError`].
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors produced by the cache contracts and the policy engine.
///
/// The first three variants are the well-known [`Cacher::load`] outcomes:
/// they are expected conditions, not failures, and the middleware treats
/// them accordingly (cold miss, advisory expiry, full bypass).
///
/// [`Cacher::load`]: crate::Cacher::load
#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry exists for the request key.
    #[error("cache not found")]
    NotFound,
    /// An entry exists but the cacher considers it expired. Advisory: the
    /// policy engine makes the final freshness call.
    #[error("cache expired")]
    Expired,
    /// The cacher declares the request ineligible for caching. The
    /// middleware bypasses the cache entirely and never stores.
    #[error("should not use cache")]
    ShouldNotUseCache,
    /// A cache backend failure other than the conditions above.
    #[error("cache backend error: {0}")]
    Backend(#[source] BoxError),
    /// The origin handler failed at the transport level.
    #[error("origin request failed: {0}")]
    Origin(#[source] BoxError),
    /// A request or response body could not be read.
    #[error("body read failed: {0}")]
    Body(#[source] BoxError),
    /// Invalid construction-time options. Fatal to setup, never to requests.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Wraps an arbitrary backend error.
    pub fn backend<E: Into<BoxError>>(err: E) -> Self {
        Self::Backend(err.into())
    }

    /// Wraps an arbitrary origin transport error.
    pub fn origin<E: Into<BoxError>>(err: E) -> Self {
        Self::Origin(err.into())
    }

    /// Wraps an arbitrary body read error.
    pub fn body<E: Into<BoxError>>(err: E) -> Self {
        Self::Body(err.into())
    }

    /// Returns true for the load outcomes that behave as a cold miss.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::NotFound | Self::Expired)
    }
}
