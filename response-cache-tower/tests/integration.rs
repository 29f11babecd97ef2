use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use response_cache::{
    entry, CacheError, CachedRequest, CachedResponse, Cacher, Handled,
    Handler, OriginRequester, Result as CacheResult, Storability,
};
use response_cache_tower::{CacheBody, CacheLayer, MiddlewareOptions};
use tower::{Layer, Service, ServiceExt};

/// In-memory cacher persisting entries through the `entry` helpers, the
/// way a real backend would.
#[derive(Clone, Default)]
struct MemoryCacher {
    entries: Arc<Mutex<HashMap<String, (Vec<u8>, Vec<u8>)>>>,
    loads: Arc<AtomicUsize>,
    stores: Arc<AtomicUsize>,
}

impl MemoryCacher {
    fn key(req: &CachedRequest) -> String {
        format!("{} {}", req.method(), req.uri())
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Cacher for MemoryCacher {
    async fn load(
        &self,
        req: &CachedRequest,
    ) -> CacheResult<(CachedRequest, CachedResponse)> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.lock().unwrap();
        let (req_bytes, res_bytes) =
            entries.get(&Self::key(req)).ok_or(CacheError::NotFound)?;
        Ok((
            entry::bytes_to_request(req_bytes)?,
            entry::bytes_to_response(res_bytes)?,
        ))
    }

    async fn store(
        &self,
        req: &CachedRequest,
        res: &CachedResponse,
        _expires: Option<SystemTime>,
    ) -> CacheResult<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(
            Self::key(req),
            (entry::request_to_bytes(req)?, entry::response_to_bytes(res)?),
        );
        Ok(())
    }
}

/// Declares every request ineligible for caching.
#[derive(Clone, Default)]
struct BypassCacher {
    stores: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Cacher for BypassCacher {
    async fn load(
        &self,
        _req: &CachedRequest,
    ) -> CacheResult<(CachedRequest, CachedResponse)> {
        Err(CacheError::ShouldNotUseCache)
    }

    async fn store(
        &self,
        _req: &CachedRequest,
        _res: &CachedResponse,
        _expires: Option<SystemTime>,
    ) -> CacheResult<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Cacher that carries its own policy and declares it via the
/// capability probe.
#[derive(Clone, Default)]
struct PolicyCacher {
    loads: Arc<AtomicUsize>,
    handled: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Cacher for PolicyCacher {
    async fn load(
        &self,
        _req: &CachedRequest,
    ) -> CacheResult<(CachedRequest, CachedResponse)> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::NotFound)
    }

    async fn store(
        &self,
        _req: &CachedRequest,
        _res: &CachedResponse,
        _expires: Option<SystemTime>,
    ) -> CacheResult<()> {
        Ok(())
    }

    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Handler for PolicyCacher {
    async fn handle(
        &self,
        _req: CachedRequest,
        _cached: Option<(CachedRequest, CachedResponse)>,
        _origin: Arc<dyn OriginRequester>,
        _now: SystemTime,
    ) -> CacheResult<Handled> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(Handled {
            cache_used: true,
            response: Response::builder()
                .header("x-policy", "custom")
                .body(Bytes::from_static(b"custom policy"))
                .unwrap(),
        })
    }

    fn storable(
        &self,
        _req: &CachedRequest,
        _res: &mut CachedResponse,
        _now: SystemTime,
    ) -> Storability {
        Storability::NO
    }
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::get(uri).body(Full::new(Bytes::new())).unwrap()
}

async fn body_bytes<B>(res: Response<CacheBody<B>>) -> Bytes
where
    B: http_body::Body + Unpin,
    B::Error: std::fmt::Debug,
{
    res.into_body().collect().await.unwrap().to_bytes()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn cache_miss_then_hit() {
    let cacher = MemoryCacher::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin_calls = calls.clone();
    let origin = tower::service_fn(move |_req: Request<Full<Bytes>>| {
        let calls = origin_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(
                Response::builder()
                    .header("cache-control", "max-age=60")
                    .header("date", httpdate::fmt_http_date(SystemTime::now()))
                    .body(Full::new(Bytes::from_static(b"hello")))
                    .unwrap(),
            )
        }
    });
    let mut service = CacheLayer::new(cacher.clone()).layer(origin);

    let res = service
        .ready()
        .await
        .unwrap()
        .call(get("http://example.com/greet"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().get(header::AGE).is_none());
    assert_eq!(body_bytes(res).await, Bytes::from_static(b"hello"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The store is asynchronous.
    wait_for(|| cacher.stores() == 1).await;

    let res = service
        .ready()
        .await
        .unwrap()
        .call(get("http://example.com/greet"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().get(header::AGE).is_some());
    assert_eq!(body_bytes(res).await, Bytes::from_static(b"hello"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn responses_without_permission_are_not_stored() {
    let cacher = MemoryCacher::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin_calls = calls.clone();
    let origin = tower::service_fn(move |_req: Request<Full<Bytes>>| {
        let calls = origin_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(
                Response::builder()
                    .header("cache-control", "no-store")
                    .body(Full::new(Bytes::from_static(b"do not cache")))
                    .unwrap(),
            )
        }
    });
    let mut service = CacheLayer::new(cacher.clone()).layer(origin);

    for _ in 0..2 {
        let res = service
            .ready()
            .await
            .unwrap()
            .call(get("http://example.com/volatile"))
            .await
            .unwrap();
        assert_eq!(body_bytes(res).await, Bytes::from_static(b"do not cache"));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cacher.stores(), 0);
}

#[tokio::test]
async fn should_not_use_cache_bypasses_load_and_store() {
    let cacher = BypassCacher::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin_calls = calls.clone();
    let origin = tower::service_fn(move |_req: Request<Full<Bytes>>| {
        let calls = origin_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(
                Response::builder()
                    .header("cache-control", "max-age=60")
                    .body(Full::new(Bytes::from_static(b"fresh")))
                    .unwrap(),
            )
        }
    });
    let mut service = CacheLayer::new(cacher.clone()).layer(origin);

    for _ in 0..2 {
        let res = service
            .ready()
            .await
            .unwrap()
            .call(get("http://example.com/private-ish"))
            .await
            .unwrap();
        assert_eq!(body_bytes(res).await, Bytes::from_static(b"fresh"));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cacher.stores.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn websocket_upgrades_bypass_the_cache() {
    let cacher = MemoryCacher::default();
    let origin = tower::service_fn(|_req: Request<Full<Bytes>>| async {
        Ok::<_, std::io::Error>(
            Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .body(Full::new(Bytes::new()))
                .unwrap(),
        )
    });
    let mut service = CacheLayer::new(cacher.clone()).layer(origin);

    let req = Request::get("http://example.com/socket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = service.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::SWITCHING_PROTOCOLS);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cacher.loads(), 0);
    assert_eq!(cacher.stores(), 0);
}

#[tokio::test]
async fn request_bodies_are_duplicated_when_enabled() {
    let cacher = MemoryCacher::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let origin_seen = seen.clone();
    let origin = tower::service_fn(move |req: Request<Full<Bytes>>| {
        let seen = origin_seen.clone();
        async move {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            seen.lock().unwrap().push(body);
            Ok::<_, std::io::Error>(
                Response::builder()
                    .header("cache-control", "max-age=60")
                    .body(Full::new(Bytes::from_static(b"ok")))
                    .unwrap(),
            )
        }
    });
    let mut service = CacheLayer::new(cacher.clone())
        .with_options(MiddlewareOptions {
            use_request_body: true,
            ..MiddlewareOptions::default()
        })
        .layer(origin);

    let req = Request::get("http://example.com/query")
        .body(Full::new(Bytes::from_static(b"payload")))
        .unwrap();
    let res = service.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(body_bytes(res).await, Bytes::from_static(b"ok"));

    // The origin received the buffered body unchanged.
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[Bytes::from_static(b"payload")]
    );

    // The stored key request retained its own copy.
    wait_for(|| cacher.stores() == 1).await;
    let key_req = Request::get("http://example.com/query")
        .body(Bytes::from_static(b"payload"))
        .unwrap();
    let (stored_req, _stored_res) = cacher.load(&key_req).await.unwrap();
    assert_eq!(stored_req.body(), &Bytes::from_static(b"payload"));
}

#[tokio::test]
async fn revalidation_serves_cached_body_on_304() {
    let cacher = MemoryCacher::default();
    let cached_req = Request::get("http://example.com/cached")
        .body(Bytes::new())
        .unwrap();
    let cached_res = Response::builder()
        .header("cache-control", "no-cache")
        .header("etag", "\"v1\"")
        .body(Bytes::from_static(b"cached body"))
        .unwrap();
    cacher.store(&cached_req, &cached_res, None).await.unwrap();

    let validators = Arc::new(Mutex::new(Vec::new()));
    let origin_validators = validators.clone();
    let origin = tower::service_fn(move |req: Request<Full<Bytes>>| {
        let validators = origin_validators.clone();
        async move {
            validators.lock().unwrap().push(
                req.headers().get(header::IF_NONE_MATCH).cloned(),
            );
            Ok::<_, std::io::Error>(
                Response::builder()
                    .status(StatusCode::NOT_MODIFIED)
                    .body(Full::new(Bytes::new()))
                    .unwrap(),
            )
        }
    });
    let mut service = CacheLayer::new(cacher.clone()).layer(origin);

    let res = service
        .ready()
        .await
        .unwrap()
        .call(get("http://example.com/cached"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_bytes(res).await, Bytes::from_static(b"cached body"));

    let validators = validators.lock().unwrap();
    assert_eq!(validators.len(), 1);
    assert_eq!(validators[0].as_ref().unwrap(), "\"v1\"");

    // The 304 itself is not storable; the primed entry is the only store.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cacher.stores(), 1);
}

#[tokio::test]
async fn stale_while_revalidate_refreshes_in_background() {
    let cacher = MemoryCacher::default();
    let cached_req = Request::get("http://example.com/feed")
        .body(Bytes::new())
        .unwrap();
    let cached_res = Response::builder()
        .header("cache-control", "max-age=20, stale-while-revalidate=30")
        .header(
            "date",
            httpdate::fmt_http_date(
                SystemTime::now() - Duration::from_secs(30),
            ),
        )
        .body(Bytes::from_static(b"stale body"))
        .unwrap();
    cacher.store(&cached_req, &cached_res, None).await.unwrap();

    let origin = tower::service_fn(|_req: Request<Full<Bytes>>| async {
        Ok::<_, std::io::Error>(
            Response::builder()
                .header("cache-control", "max-age=60")
                .body(Full::new(Bytes::from_static(b"fresh body")))
                .unwrap(),
        )
    });
    let mut service = CacheLayer::new(cacher.clone()).layer(origin);

    let res = service
        .ready()
        .await
        .unwrap()
        .call(get("http://example.com/feed"))
        .await
        .unwrap();
    // The stale entry is served immediately.
    assert_eq!(body_bytes(res).await, Bytes::from_static(b"stale body"));

    // The background revalidation replaces the entry.
    wait_for(|| cacher.stores() == 2).await;
    let (_req, refreshed) = cacher.load(&cached_req).await.unwrap();
    assert_eq!(refreshed.body(), &Bytes::from_static(b"fresh body"));
}

#[tokio::test]
async fn cacher_handler_capability_is_adopted_at_construction() {
    let cacher = PolicyCacher::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin_calls = calls.clone();
    let origin = tower::service_fn(move |_req: Request<Full<Bytes>>| {
        let calls = origin_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(
                Response::builder()
                    .body(Full::new(Bytes::from_static(b"origin")))
                    .unwrap(),
            )
        }
    });
    // `new` probes the cacher and adopts its Handler implementation.
    let mut service = CacheLayer::new(cacher.clone()).layer(origin);

    let res = service
        .ready()
        .await
        .unwrap()
        .call(get("http://example.com/custom"))
        .await
        .unwrap();
    assert_eq!(res.headers().get("x-policy").unwrap(), "custom");
    assert_eq!(body_bytes(res).await, Bytes::from_static(b"custom policy"));

    // The cacher's own policy ran; the built-in engine and the origin
    // were never involved.
    assert_eq!(cacher.handled.load(Ordering::SeqCst), 1);
    assert_eq!(cacher.loads.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn explicit_handler_skips_the_probe() {
    // A cacher without the capability still gets the built-in engine
    // through `new`; an explicit handler always wins over the probe.
    let probed = Arc::new(MemoryCacher::default());
    assert!(Arc::clone(&probed).as_handler().is_none());

    let cacher = PolicyCacher::default();
    let origin = tower::service_fn(|_req: Request<Full<Bytes>>| async {
        Ok::<_, std::io::Error>(
            Response::builder()
                .header("cache-control", "no-store")
                .body(Full::new(Bytes::from_static(b"origin")))
                .unwrap(),
        )
    });
    let mut service =
        CacheLayer::with_handler(cacher.clone(), response_cache::Shared::new())
            .layer(origin);

    let res = service
        .ready()
        .await
        .unwrap()
        .call(get("http://example.com/explicit"))
        .await
        .unwrap();
    assert_eq!(body_bytes(res).await, Bytes::from_static(b"origin"));
    assert_eq!(cacher.handled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn origin_errors_surface_unchanged() {
    let cacher = MemoryCacher::default();
    let origin = tower::service_fn(|_req: Request<Full<Bytes>>| async {
        Err::<Response<Full<Bytes>>, _>(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "origin down",
        ))
    });
    let mut service = CacheLayer::new(cacher.clone()).layer(origin);

    let err = service
        .ready()
        .await
        .unwrap()
        .call(get("http://example.com/down"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("origin"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cacher.stores(), 0);
}
