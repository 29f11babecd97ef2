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
//! Server-side HTTP response caching middleware for Tower.
//!
//! [`CacheLayer`] wraps a downstream service (the origin handler) and
//! satisfies requests from a [`Cacher`] when the RFC 9111 policy engine of
//! the `response-cache` crate allows it. This is a **shared cache**: a
//! stored response is served to every client whose request matches the
//! entry, which is exactly why the policy engine refuses `private`
//! responses, `Set-Cookie` responses and `Authorization` requests without
//! an explicit shared-caching directive.
//!
//! Per request the middleware:
//!
//! 1. bypasses the cache entirely for websocket upgrades;
//! 2. duplicates the request, keeping an untouched copy as the key while
//!    the forwarded copy may gain validator headers during revalidation;
//! 3. loads any stored pair from the [`Cacher`] and hands both to the
//!    policy engine together with an origin invoker;
//! 4. streams the chosen response to the client in bounded chunks;
//! 5. when the origin was contacted, records its response and stores it
//!    from a detached task so the client never waits on the store.
//!
//! # Single-flight
//!
//! There is no single-flight coordination: concurrent misses for the same
//! key each reach the origin and each store their response, and the store
//! backend decides the tie-break. Keeping the miss path coordination-free
//! is intentional; origins that cannot tolerate request duplication need
//! their own collapsing.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use http_body_util::Full;
//! use response_cache::{CacheError, CachedRequest, CachedResponse, Cacher};
//! use response_cache_tower::CacheLayer;
//! use std::collections::HashMap;
//! use std::sync::{Arc, Mutex};
//! use std::time::SystemTime;
//! use tower::{Layer, Service, ServiceExt};
//!
//! #[derive(Clone, Default)]
//! struct MemoryCacher {
//!     entries: Arc<Mutex<HashMap<String, (CachedRequest, CachedResponse)>>>,
//! }
//!
//! #[async_trait::async_trait]
//! impl Cacher for MemoryCacher {
//!     async fn load(
//!         &self,
//!         req: &CachedRequest,
//!     ) -> response_cache::Result<(CachedRequest, CachedResponse)> {
//!         let key = format!("{} {}", req.method(), req.uri());
//!         let entries = self.entries.lock().unwrap();
//!         let (req, res) = entries.get(&key).ok_or(CacheError::NotFound)?;
//!         Ok((response_cache::clone_request(req), response_cache::clone_response(res)))
//!     }
//!
//!     async fn store(
//!         &self,
//!         req: &CachedRequest,
//!         res: &CachedResponse,
//!         _expires: Option<SystemTime>,
//!     ) -> response_cache::Result<()> {
//!         let key = format!("{} {}", req.method(), req.uri());
//!         self.entries.lock().unwrap().insert(
//!             key,
//!             (response_cache::clone_request(req), response_cache::clone_response(res)),
//!         );
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let layer = CacheLayer::new(MemoryCacher::default());
//! let origin = tower::service_fn(|_req: Request<Full<Bytes>>| async {
//!     Ok::<_, std::io::Error>(
//!         Response::builder()
//!             .header("cache-control", "max-age=60")
//!             .body(Full::new(Bytes::from("hello")))
//!             .unwrap(),
//!     )
//! });
//! let mut service = layer.layer(origin);
//! let res = service
//!     .ready()
//!     .await
//!     .unwrap()
//!     .call(Request::get("http://example.com/").body(Full::new(Bytes::new())).unwrap())
//!     .await
//!     .unwrap();
//! assert_eq!(res.status(), 200);
//! # });
//! ```

mod classify;
mod copybuf;

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::SystemTime,
};

use bytes::{Buf, Bytes};
use http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use response_cache::{
    clone_request, BoxError, CacheError, CachedRequest, CachedResponse,
    Cacher, Handler, OriginRequester, Shared,
};
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, error};

pub use classify::{classify_copy_error, CopyErrorClass};

/// Middleware-level options. The policy options live on
/// [`Shared`](response_cache::Shared) and custom [`Handler`]s.
#[derive(Debug, Clone)]
pub struct MiddlewareOptions {
    /// Buffer the request body once and give both duplicated requests
    /// independent readers over it, making the body available to the
    /// cacher for key derivation. Buffering the whole body is only
    /// correct when request sizes are bounded upstream.
    pub use_request_body: bool,
    /// Header names replaced by `*****` before any header map reaches a
    /// log event. Masking works on a clone; the real maps are untouched.
    pub masked_headers: Vec<HeaderName>,
}

impl Default for MiddlewareOptions {
    fn default() -> Self {
        Self {
            use_request_body: false,
            masked_headers: vec![
                header::AUTHORIZATION,
                header::COOKIE,
                header::SET_COOKIE,
            ],
        }
    }
}

/// Returns a copy of `headers` with the configured names masked out.
pub fn mask_headers(headers: &HeaderMap, names: &[HeaderName]) -> HeaderMap {
    let mut masked = headers.clone();
    for name in names {
        if masked.contains_key(name) {
            masked.insert(name.clone(), HeaderValue::from_static("*****"));
        }
    }
    masked
}

/// Tower layer producing [`CacheService`].
pub struct CacheLayer<C> {
    cacher: Arc<C>,
    handler: Arc<dyn Handler>,
    options: MiddlewareOptions,
}

impl<C> fmt::Debug for CacheLayer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<C> Clone for CacheLayer<C> {
    fn clone(&self) -> Self {
        Self {
            cacher: Arc::clone(&self.cacher),
            handler: Arc::clone(&self.handler),
            options: self.options.clone(),
        }
    }
}

impl<C: Cacher> CacheLayer<C> {
    /// Creates a cache layer around `cacher`.
    ///
    /// The cacher is probed for a policy override here, once: a cacher
    /// that also implements [`Handler`] (declared through
    /// [`Cacher::as_handler`]) has its `handle`/`storable` decisions
    /// adopted verbatim; otherwise the built-in RFC 9111 engine with
    /// default options is bound.
    pub fn new(cacher: C) -> Self {
        let cacher = Arc::new(cacher);
        let handler = Arc::clone(&cacher)
            .as_handler()
            .unwrap_or_else(|| Arc::new(Shared::new()));
        Self { cacher, handler, options: MiddlewareOptions::default() }
    }

    /// Creates a cache layer with an explicit policy, skipping the
    /// capability probe. Hand in a configured
    /// [`Shared`](response_cache::Shared) or any other [`Handler`].
    pub fn with_handler<H: Handler>(cacher: C, handler: H) -> Self {
        Self {
            cacher: Arc::new(cacher),
            handler: Arc::new(handler),
            options: MiddlewareOptions::default(),
        }
    }

    /// Replaces the middleware options.
    pub fn with_options(mut self, options: MiddlewareOptions) -> Self {
        self.options = options;
        self
    }
}

impl<S, C: Cacher> Layer<S> for CacheLayer<C> {
    type Service = CacheService<S, C>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            cacher: Arc::clone(&self.cacher),
            handler: Arc::clone(&self.handler),
            options: self.options.clone(),
        }
    }
}

/// Tower service that serves responses from the cache when permitted and
/// stores origin responses asynchronously.
///
/// The service keeps no per-request state: every `call` owns its clones
/// of the cacher and handler handles, so it is freely re-entrant.
pub struct CacheService<S, C> {
    inner: S,
    cacher: Arc<C>,
    handler: Arc<dyn Handler>,
    options: MiddlewareOptions,
}

impl<S: fmt::Debug, C> fmt::Debug for CacheService<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheService")
            .field("inner", &self.inner)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S: Clone, C> Clone for CacheService<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cacher: Arc::clone(&self.cacher),
            handler: Arc::clone(&self.handler),
            options: self.options.clone(),
        }
    }
}

impl<S, C, ReqBody, ResBody> Service<Request<ReqBody>> for CacheService<S, C>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    C: Cacher,
    ReqBody: HttpBody + From<Bytes> + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<BoxError>,
    ResBody: HttpBody + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<CacheBody<ResBody>>;
    type Error = BoxError;
    type Future = Pin<
        Box<
            dyn Future<Output = Result<Self::Response, Self::Error>>
                + Send
                + 'static,
        >,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service the caller drove to readiness, leave a fresh
        // clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let cacher = Arc::clone(&self.cacher);
        let handler = Arc::clone(&self.handler);
        let options = self.options.clone();
        Box::pin(handle_request(inner, cacher, handler, options, req))
    }
}

async fn handle_request<S, C, ReqBody, ResBody>(
    inner: S,
    cacher: Arc<C>,
    handler: Arc<dyn Handler>,
    options: MiddlewareOptions,
    req: Request<ReqBody>,
) -> Result<Response<CacheBody<ResBody>>, BoxError>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    C: Cacher,
    ReqBody: HttpBody + From<Bytes> + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<BoxError>,
    ResBody: HttpBody + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    let now = SystemTime::now();

    // Upgraded connections cannot be cached or recorded; hand them
    // straight to the origin.
    if is_upgrade_request(req.headers()) {
        debug!(
            method = %req.method(),
            url = %req.uri(),
            "bypassing cache for connection upgrade"
        );
        let res = inner.oneshot(req).await.map_err(Into::into)?;
        return Ok(res.map(CacheBody::passthrough));
    }

    // Duplicate the request: `key_req` stays untouched for load and
    // store, the forwarded copy may be mutated during revalidation.
    let (parts, body) = req.into_parts();
    let (body_source, key_body) = if options.use_request_body {
        let bytes = match copybuf::copy_body(body).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let err: BoxError = err.into();
                error!(error = %err, url = %parts.uri, "failed to read request body");
                return Err(err);
            }
        };
        (BodySource::Buffered(bytes.clone()), bytes)
    } else {
        (BodySource::Stream(body), Bytes::new())
    };
    let key_req = Request::from_parts(parts.clone(), key_body.clone());
    let log = LogContext::new(&key_req, &options.masked_headers);

    let cached = match cacher.load(&key_req).await {
        Ok(pair) => Some(pair),
        Err(CacheError::NotFound) => {
            debug!(host = %log.host, method = %log.method, url = %log.url, headers = ?log.headers, "cache not found");
            None
        }
        Err(CacheError::Expired) => {
            debug!(host = %log.host, method = %log.method, url = %log.url, headers = ?log.headers, "cache expired");
            None
        }
        Err(CacheError::ShouldNotUseCache) => {
            debug!(host = %log.host, method = %log.method, url = %log.url, headers = ?log.headers, "should not use cache");
            let req = rebuild_request(parts, body_source);
            let res = inner.oneshot(req).await.map_err(Into::into)?;
            return Ok(res.map(CacheBody::passthrough));
        }
        Err(err) => {
            error!(error = %err, host = %log.host, method = %log.method, url = %log.url, headers = ?log.headers, "failed to load cache");
            None
        }
    };

    let invoker = Arc::new(OriginInvoker {
        service: Mutex::new(inner),
        body: Mutex::new(Some(body_source)),
        key_req,
        cacher,
        handler: Arc::clone(&handler),
        masked_headers: options.masked_headers.clone(),
        now,
    });
    let engine_req = Request::from_parts(parts, key_body);

    match handler.handle(engine_req, cached, invoker, now).await {
        Ok(handled) => {
            if handled.cache_used {
                debug!(
                    host = %log.host,
                    method = %log.method,
                    url = %log.url,
                    status = handled.response.status().as_u16(),
                    "cache used"
                );
            }
            Ok(handled.response.map(CacheBody::buffered))
        }
        Err(err) => {
            error!(error = %err, host = %log.host, method = %log.method, url = %log.url, headers = ?log.headers, "failed to handle request");
            Err(err.into())
        }
    }
}

/// The unconsumed downstream body: the original stream on the first
/// origin call, or the buffered copy when request bodies are duplicated.
enum BodySource<B> {
    Stream(B),
    Buffered(Bytes),
}

fn rebuild_request<B: From<Bytes>>(
    parts: http::request::Parts,
    body_source: BodySource<B>,
) -> Request<B> {
    let body = match body_source {
        BodySource::Stream(body) => body,
        BodySource::Buffered(bytes) => B::from(bytes),
    };
    Request::from_parts(parts, body)
}

/// Adapts the inner Tower service to the engine's [`OriginRequester`]
/// contract: it performs the origin round trip, records the response
/// body, and kicks off the asynchronous store.
struct OriginInvoker<S, C, ReqBody> {
    service: Mutex<S>,
    body: Mutex<Option<BodySource<ReqBody>>>,
    key_req: CachedRequest,
    cacher: Arc<C>,
    handler: Arc<dyn Handler>,
    masked_headers: Vec<HeaderName>,
    now: SystemTime,
}

#[async_trait::async_trait]
impl<S, C, ReqBody, ResBody> OriginRequester for OriginInvoker<S, C, ReqBody>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    C: Cacher,
    ReqBody: From<Bytes> + Send + 'static,
    ResBody: HttpBody + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    async fn forward(
        &self,
        req: CachedRequest,
    ) -> response_cache::Result<CachedResponse> {
        let (parts, engine_body) = req.into_parts();
        // First call gets the real downstream body; revalidations and
        // background calls fall back to the buffered copy.
        let body = match self.body.lock().unwrap().take() {
            Some(source) => match source {
                BodySource::Stream(body) => body,
                BodySource::Buffered(bytes) => ReqBody::from(bytes),
            },
            None => ReqBody::from(engine_body),
        };
        let service = self.service.lock().unwrap().clone();
        let res = service
            .oneshot(Request::from_parts(parts, body))
            .await
            .map_err(|err| CacheError::origin(err.into()))?;

        // Record the full body so the client path and the store path get
        // independent readers.
        let (res_parts, res_body) = res.into_parts();
        let bytes = match copybuf::copy_body(res_body).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let err: BoxError = err.into();
                let log =
                    LogContext::new(&self.key_req, &self.masked_headers);
                match classify_copy_error(&*err) {
                    CopyErrorClass::ClientDisconnect
                    | CopyErrorClass::BodyNotAllowed => {
                        debug!(error = %err, host = %log.host, method = %log.method, url = %log.url, "failed to read origin response body");
                    }
                    CopyErrorClass::Other => {
                        error!(error = %err, host = %log.host, method = %log.method, url = %log.url, "failed to read origin response body");
                    }
                }
                return Err(CacheError::body(err));
            }
        };
        let recorded = Response::from_parts(res_parts, bytes);

        // Store from a detached task so the client never waits on the
        // cacher. The task owns clones only.
        let mut stored = response_cache::clone_response(&recorded);
        let key_req = clone_request(&self.key_req);
        let cacher = Arc::clone(&self.cacher);
        let handler = Arc::clone(&self.handler);
        let masked_headers = self.masked_headers.clone();
        let now = self.now;
        tokio::spawn(async move {
            let log = LogContext::new(&key_req, &masked_headers);
            let decision = handler.storable(&key_req, &mut stored, now);
            if !decision.storable {
                debug!(host = %log.host, method = %log.method, url = %log.url, status = stored.status().as_u16(), "cache not storable");
                return;
            }
            if let Err(err) =
                cacher.store(&key_req, &stored, decision.expires).await
            {
                error!(error = %err, host = %log.host, method = %log.method, url = %log.url, "failed to store cache");
                return;
            }
            debug!(host = %log.host, method = %log.method, url = %log.url, status = stored.status().as_u16(), "cache stored");
        });

        Ok(recorded)
    }
}

/// Body type returned to the client.
///
/// Buffered responses (the normal path) are replayed in chunks of at most
/// 32 KiB; upgrade and bypass responses stream through untouched.
pub struct CacheBody<B> {
    inner: CacheBodyInner<B>,
}

enum CacheBodyInner<B> {
    Passthrough(Pin<Box<B>>),
    Buffered(Bytes),
}

impl<B> fmt::Debug for CacheBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            CacheBodyInner::Passthrough(_) => f.write_str("CacheBody::Passthrough"),
            CacheBodyInner::Buffered(bytes) => f
                .debug_tuple("CacheBody::Buffered")
                .field(&bytes.len())
                .finish(),
        }
    }
}

impl<B> CacheBody<B> {
    fn passthrough(body: B) -> Self {
        Self { inner: CacheBodyInner::Passthrough(Box::pin(body)) }
    }

    fn buffered(bytes: Bytes) -> Self {
        Self { inner: CacheBodyInner::Buffered(bytes) }
    }
}

impl<B> HttpBody for CacheBody<B>
where
    B: HttpBody,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().inner {
            CacheBodyInner::Passthrough(body) => {
                match body.as_mut().poll_frame(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(None) => Poll::Ready(None),
                    Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
                    Poll::Ready(Some(Ok(frame))) => {
                        Poll::Ready(Some(Ok(frame.map_data(|mut data| {
                            data.copy_to_bytes(data.remaining())
                        }))))
                    }
                }
            }
            CacheBodyInner::Buffered(bytes) => {
                if bytes.is_empty() {
                    Poll::Ready(None)
                } else {
                    let n = bytes.len().min(copybuf::COPY_BUF_SIZE);
                    Poll::Ready(Some(Ok(Frame::data(bytes.split_to(n)))))
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            CacheBodyInner::Passthrough(body) => {
                body.as_ref().get_ref().is_end_stream()
            }
            CacheBodyInner::Buffered(bytes) => bytes.is_empty(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            CacheBodyInner::Passthrough(body) => {
                body.as_ref().get_ref().size_hint()
            }
            CacheBodyInner::Buffered(bytes) => {
                SizeHint::with_exact(bytes.len() as u64)
            }
        }
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        });
    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    connection_upgrade && websocket
}

/// Pre-rendered request fields attached to every log event, with the
/// configured headers masked.
struct LogContext {
    host: String,
    method: String,
    url: String,
    headers: HeaderMap,
}

impl LogContext {
    fn new(req: &CachedRequest, masked: &[HeaderName]) -> Self {
        let host = req
            .uri()
            .host()
            .map(str::to_string)
            .or_else(|| {
                req.headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        Self {
            host,
            method: req.method().to_string(),
            url: req.uri().to_string(),
            headers: mask_headers(req.headers(), masked),
        }
    }
}
