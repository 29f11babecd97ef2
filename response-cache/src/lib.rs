#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
//! A shared (server-side) HTTP response cache core implementing the
//! RFC 9111 caching rules together with the RFC 5861 extensions
//! (`stale-while-revalidate`, `stale-if-error`).
//!
//! This crate is the decision layer of a reverse-proxy response cache.
//! It answers two questions:
//!
//! - **Storability** — may this origin response be stored, and until when?
//! - **Handling** — given a stored request/response pair, may it be served
//!   as-is, must it be revalidated against the origin, or must the origin
//!   be contacted unconditionally?
//!
//! The physical store and the HTTP transport are deliberately out of
//! scope: integrators implement the [`Cacher`] contract for the former and
//! mount the companion `response-cache-tower` middleware (or their own
//! adapter) for the latter.
//!
//! # Storability
//!
//! ```rust
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use response_cache::rfc9111::Shared;
//! use std::time::SystemTime;
//!
//! let shared = Shared::new();
//! let req = Request::get("https://example.com/assets/logo.png")
//!     .body(Bytes::new())
//!     .unwrap();
//! let mut res = Response::builder()
//!     .status(200)
//!     .header("cache-control", "s-maxage=10")
//!     .body(Bytes::new())
//!     .unwrap();
//!
//! let decision = shared.storable(&req, &mut res, SystemTime::now());
//! assert!(decision.storable);
//! assert!(decision.expires.is_some());
//! ```
//!
//! # Custom policies
//!
//! The built-in engine can be tuned through [`Shared::builder`], or
//! replaced wholesale by implementing [`Handler`]. A [`Cacher`] that also
//! implements [`Handler`] declares the capability through
//! [`Cacher::as_handler`] and is adopted by the middleware when it is
//! constructed. Responses without any `Cache-Control` header can be made
//! cacheable through ordered [`ExtendedRule`]s, similar to
//! `proxy_cache_valid` in NGINX.

pub mod entry;
mod error;
pub mod rfc9111;

use std::{sync::Arc, time::SystemTime};

use bytes::Bytes;
use http::{Request, Response};

pub use error::{BoxError, CacheError, Result};
pub use rfc9111::{ExtendedRule, Shared, SharedBuilder};

/// A buffered request as exchanged with the cache.
///
/// Bodies are fully buffered [`Bytes`]; the middleware's recorder owns the
/// buffering, the policy engine never reads them.
pub type CachedRequest = Request<Bytes>;

/// A buffered response as exchanged with the cache.
pub type CachedResponse = Response<Bytes>;

/// The outcome of [`Handler::handle`].
#[derive(Debug)]
pub struct Handled {
    /// True when the response below is the stored one (possibly after a
    /// successful revalidation), false when it came from the origin.
    pub cache_used: bool,
    /// The response to serve to the client. When `cache_used`, its `Age`
    /// header has been set per RFC 9111 §4.2.3.
    pub response: CachedResponse,
}

/// The outcome of [`Handler::storable`].
#[derive(Debug, Clone, Copy)]
pub struct Storability {
    /// Whether the response may be stored.
    pub storable: bool,
    /// Absolute expiration instant. `None` means no expiration could be
    /// computed; such an entry is immediately stale but may still be
    /// served after revalidation.
    pub expires: Option<SystemTime>,
}

impl Storability {
    /// A negative storability decision.
    pub const NO: Storability = Storability { storable: false, expires: None };
}

/// The request/response cache store, implemented by the integrator.
///
/// Keys are derived from the request however the store sees fit; the
/// stored request must retain method, target URI and the header fields
/// needed for `Vary` matching, because [`Handler::handle`] re-checks all
/// of them on load.
#[async_trait::async_trait]
pub trait Cacher: Send + Sync + 'static {
    /// Loads the cached pair for a request.
    ///
    /// Expected non-entries are signalled through [`CacheError::NotFound`]
    /// (cold), [`CacheError::Expired`] (advisory; the policy engine still
    /// makes the freshness call) and [`CacheError::ShouldNotUseCache`]
    /// (the middleware bypasses the cache entirely for this request).
    async fn load(
        &self,
        req: &CachedRequest,
    ) -> Result<(CachedRequest, CachedResponse)>;

    /// Stores a response under the request's key. Called only when the
    /// policy engine decided the response is storable.
    async fn store(
        &self,
        req: &CachedRequest,
        res: &CachedResponse,
        expires: Option<SystemTime>,
    ) -> Result<()>;

    /// Capability probe for policy override, consulted once when the
    /// middleware is constructed.
    ///
    /// A cacher that also implements [`Handler`] returns itself here and
    /// its `handle`/`storable` decisions are used verbatim in place of
    /// the built-in RFC 9111 engine:
    ///
    /// ```rust,ignore
    /// fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
    ///     Some(self)
    /// }
    /// ```
    ///
    /// The default declares no such capability.
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        None
    }
}

/// Forwards a request to the origin handler.
///
/// Implemented by the middleware; handed to [`Handler::handle`] behind an
/// [`Arc`] so that detached background tasks (stale-while-revalidate) can
/// outlive the originating request.
#[async_trait::async_trait]
pub trait OriginRequester: Send + Sync {
    /// Performs the origin round trip and returns the buffered response.
    async fn forward(&self, req: CachedRequest) -> Result<CachedResponse>;
}

/// The cache policy: storability and handling decisions.
///
/// [`Shared`] is the built-in RFC 9111 implementation. An integrator may
/// supply its own to override the policy while keeping the middleware's
/// lifecycle (duplication, streaming, asynchronous store).
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Decides how to satisfy `req` given the stored pair, forwarding to
    /// the origin as needed.
    async fn handle(
        &self,
        req: CachedRequest,
        cached: Option<(CachedRequest, CachedResponse)>,
        origin: Arc<dyn OriginRequester>,
        now: SystemTime,
    ) -> Result<Handled>;

    /// Decides whether an origin response may be stored and until when.
    ///
    /// Takes the response mutably: a matching [`ExtendedRule`] synthesizes
    /// an `Expires` header into the response before it is stored.
    fn storable(
        &self,
        req: &CachedRequest,
        res: &mut CachedResponse,
        now: SystemTime,
    ) -> Storability;
}

/// Clones a buffered request: method, URI, version, headers and body.
///
/// Extensions are not carried over; they are request-scoped and must not
/// escape into stored entries or background tasks.
pub fn clone_request(req: &CachedRequest) -> CachedRequest {
    let mut out = Request::new(req.body().clone());
    *out.method_mut() = req.method().clone();
    *out.uri_mut() = req.uri().clone();
    *out.version_mut() = req.version();
    *out.headers_mut() = req.headers().clone();
    out
}

/// Clones a buffered response: status, version, headers and body.
pub fn clone_response(res: &CachedResponse) -> CachedResponse {
    let mut out = Response::new(res.body().clone());
    *out.status_mut() = res.status();
    *out.version_mut() = res.version();
    *out.headers_mut() = res.headers().clone();
    out
}
