//! The built-in RFC 9111 shared-cache policy engine.
//!
//! [`Shared`] implements the two decisions of the caching model:
//! [`Shared::storable`] (RFC 9111 §3, storing responses) and
//! [`Shared::handle`] (RFC 9111 §4, constructing responses from caches),
//! including validator-based revalidation and the RFC 5861 stale
//! extensions. Being a shared cache, the private-cache rules and request
//! cache directives other than `max-stale` and `no-cache` are not
//! implemented.
//!
//! The engine performs no I/O of its own; all origin traffic goes through
//! the [`OriginRequester`] it is handed.

mod age;
mod default;
mod directive;


pub use age::set_age_header;
pub use directive::{
    parse_request_cache_control, parse_response_cache_control,
    RequestDirectives, ResponseDirectives,
};

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use http::{header, HeaderMap, HeaderValue, Method, StatusCode};

use crate::{
    clone_request, CacheError, CachedRequest, CachedResponse, Handled,
    Handler, OriginRequester, Result, Storability,
};

/// An extended cacheability rule, like `proxy_cache_valid` in NGINX.
///
/// Rules are consulted in order, and only when the response carries no
/// `Cache-Control` header and the standard RFC 9111 rules produced no
/// storability decision. This is not RFC 9111.
pub trait ExtendedRule: Send + Sync + 'static {
    /// Returns the freshness lifetime to assign when the rule matches.
    fn cacheable(
        &self,
        req: &CachedRequest,
        res: &CachedResponse,
    ) -> Option<Duration>;
}

impl<F> ExtendedRule for F
where
    F: Fn(&CachedRequest, &CachedResponse) -> Option<Duration>
        + Send
        + Sync
        + 'static,
{
    fn cacheable(
        &self,
        req: &CachedRequest,
        res: &CachedResponse,
    ) -> Option<Duration> {
        self(req, res)
    }
}

/// A shared response cache policy implementing RFC 9111 with the RFC 5861
/// stale extensions.
pub struct Shared {
    understood_methods: Vec<Method>,
    understood_status_codes: Vec<u16>,
    heuristically_cacheable_status_codes: Vec<u16>,
    heuristic_expiration_ratio: f64,
    store_response_with_set_cookie_header: bool,
    extended_rules: Vec<Arc<dyn ExtendedRule>>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("understood_methods", &self.understood_methods)
            .field("understood_status_codes", &self.understood_status_codes)
            .field(
                "heuristically_cacheable_status_codes",
                &self.heuristically_cacheable_status_codes,
            )
            .field(
                "heuristic_expiration_ratio",
                &self.heuristic_expiration_ratio,
            )
            .field(
                "store_response_with_set_cookie_header",
                &self.store_response_with_set_cookie_header,
            )
            .field("extended_rules", &self.extended_rules.len())
            .finish()
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    /// Returns a policy engine with the default option set.
    pub fn new() -> Self {
        Self {
            understood_methods: default::understood_methods(),
            understood_status_codes: default::UNDERSTOOD_STATUS_CODES.to_vec(),
            heuristically_cacheable_status_codes:
                default::HEURISTICALLY_CACHEABLE_STATUS_CODES.to_vec(),
            heuristic_expiration_ratio: default::HEURISTIC_EXPIRATION_RATIO,
            store_response_with_set_cookie_header: false,
            extended_rules: Vec::new(),
        }
    }

    /// Returns a builder for a policy engine with custom options.
    pub fn builder() -> SharedBuilder {
        SharedBuilder::default()
    }

    /// Decides whether `res` may be stored, per RFC 9111 §3, and computes
    /// its expiration.
    ///
    /// Takes the response mutably because a matching [`ExtendedRule`]
    /// synthesizes an `Expires` header into it.
    pub fn storable(
        &self,
        req: &CachedRequest,
        res: &mut CachedResponse,
        now: SystemTime,
    ) -> Storability {
        // The request method must be understood by the cache.
        if !self.understood_methods.contains(req.method()) {
            return self.storable_with_extended_rules(req, res, now);
        }
        // The response status code must be final.
        if res.status().is_informational() {
            return self.storable_with_extended_rules(req, res, now);
        }
        let rescc = parse_response_cache_control(res.headers());
        // 206 and 304 are never stored by the standard rules here; any
        // other status must be understood when must-understand is present
        // (RFC 9111 §5.2.2.3).
        if res.status() == StatusCode::PARTIAL_CONTENT
            || res.status() == StatusCode::NOT_MODIFIED
            || (rescc.must_understand
                && !self
                    .understood_status_codes
                    .contains(&res.status().as_u16()))
        {
            return self.storable_with_extended_rules(req, res, now);
        }
        if rescc.no_store || rescc.private {
            return Storability::NO;
        }
        // A shared cache must not store responses to requests with
        // Authorization unless a directive explicitly allows shared
        // caching (RFC 9111 §3.5).
        if req.headers().contains_key(header::AUTHORIZATION)
            && !rescc.must_revalidate
            && !rescc.public
            && rescc.s_maxage.is_none()
        {
            return Storability::NO;
        }
        // Responses carrying Set-Cookie are refused unless the integrator
        // opted in, similar to NGINX. Stricter than RFC 9111.
        if res.headers().contains_key(header::SET_COOKIE)
            && !self.store_response_with_set_cookie_header
        {
            return Storability::NO;
        }
        // The response must contain something that permits storing it:
        // public, an Expires header field, max-age or s-maxage.
        if rescc.public
            || res.headers().contains_key(header::EXPIRES)
            || rescc.max_age.is_some()
            || rescc.s_maxage.is_some()
        {
            let expires = calculate_expires(
                &rescc,
                res.headers(),
                self.heuristic_expiration_ratio,
                now,
            );
            return Storability { storable: true, expires };
        }
        // Or a status code defined as heuristically cacheable, provided
        // an expiration is actually computable.
        if self
            .heuristically_cacheable_status_codes
            .contains(&res.status().as_u16())
        {
            if let Some(expires) = calculate_expires(
                &rescc,
                res.headers(),
                self.heuristic_expiration_ratio,
                now,
            ) {
                return Storability { storable: true, expires: Some(expires) };
            }
        }
        self.storable_with_extended_rules(req, res, now)
    }

    fn storable_with_extended_rules(
        &self,
        req: &CachedRequest,
        res: &mut CachedResponse,
        now: SystemTime,
    ) -> Storability {
        if res.headers().contains_key(header::CACHE_CONTROL) {
            return Storability::NO;
        }
        for rule in &self.extended_rules {
            if let Some(age) = rule.cacheable(req, res) {
                let expires = origin_date(res.headers(), now) + age;
                if let Ok(v) =
                    HeaderValue::from_str(&httpdate::fmt_http_date(expires))
                {
                    res.headers_mut().insert(header::EXPIRES, v);
                }
                return Storability { storable: true, expires: Some(expires) };
            }
        }
        Storability::NO
    }

    /// Decides how to satisfy `req` given the stored pair, per
    /// RFC 9111 §4, forwarding to the origin as needed.
    ///
    /// When the stored response is used its `Age` header is set per
    /// RFC 9111 §5.1.
    pub async fn handle(
        &self,
        req: CachedRequest,
        cached: Option<(CachedRequest, CachedResponse)>,
        origin: Arc<dyn OriginRequester>,
        now: SystemTime,
    ) -> Result<Handled> {
        let mut handled = self.handle_inner(req, cached, origin, now).await?;
        set_age_header(handled.cache_used, handled.response.headers_mut(), now);
        Ok(handled)
    }

    async fn handle_inner(
        &self,
        mut req: CachedRequest,
        cached: Option<(CachedRequest, CachedResponse)>,
        origin: Arc<dyn OriginRequester>,
        now: SystemTime,
    ) -> Result<Handled> {
        let Some((cached_req, cached_res)) = cached else {
            return forward(origin, req).await;
        };

        // 4. Constructing Responses from Caches: the presented target URI
        // and that of the stored response must match. Hosts are compared
        // for SNI compatibility; an entry without a host is unusable.
        let Some(cached_host) = request_host(&cached_req) else {
            return forward(origin, req).await;
        };
        if request_host(&req) != Some(cached_host)
            || req.uri().path() != cached_req.uri().path()
            || req.uri().query().unwrap_or("")
                != cached_req.uri().query().unwrap_or("")
        {
            return forward(origin, req).await;
        }

        // The request method associated with the stored response must
        // allow it to be used for the presented request.
        if req.method() != cached_req.method() {
            return forward(origin, req).await;
        }

        // Request header fields nominated by the stored response must
        // match those presented (RFC 9111 §4.1).
        if !vary_matches(&req, &cached_req, &cached_res) {
            return forward(origin, req).await;
        }

        let rescc = parse_response_cache_control(cached_res.headers());

        // The unqualified no-cache response directive: the response must
        // not be reused without forwarding for validation and receiving a
        // successful response (RFC 9111 §5.2.2.4).
        if rescc.no_cache {
            if is_get_or_head(req.method()) {
                copy_validators(&cached_res, &mut req);
                let response = origin.forward(req).await?;
                if response.status() == StatusCode::NOT_MODIFIED {
                    return Ok(Handled {
                        cache_used: true,
                        response: cached_res,
                    });
                }
                return Ok(Handled { cache_used: false, response });
            }
            return forward(origin, req).await;
        }

        let expires = calculate_expires(
            &rescc,
            cached_res.headers(),
            self.heuristic_expiration_ratio,
            now,
        );

        // Fresh (RFC 9111 §4.2).
        if expires.is_some_and(|e| e > now) {
            return Ok(Handled { cache_used: true, response: cached_res });
        }

        // Serving stale is prohibited by an applicable must-revalidate,
        // s-maxage or proxy-revalidate directive (RFC 9111 §4.2.4);
        // no-cache already returned above.
        if !rescc.must_revalidate
            && rescc.s_maxage.is_none()
            && !rescc.proxy_revalidate
        {
            // stale-while-revalidate (RFC 5861 §3): serve the stale
            // response now and refresh the entry from a detached task.
            if let Some(swr) = rescc.stale_while_revalidate {
                if within_stale_window(expires, swr, now) {
                    let origin = Arc::clone(&origin);
                    let background_req = clone_request(&req);
                    tokio::spawn(async move {
                        let _ = origin.forward(background_req).await;
                    });
                    return Ok(Handled {
                        cache_used: true,
                        response: cached_res,
                    });
                }
            }
            // max-stale: staleness explicitly permitted by the client
            // (RFC 9111 §5.2.1.2).
            let reqcc = parse_request_cache_control(req.headers());
            if let (Some(max_stale), Some(e)) = (reqcc.max_stale, expires) {
                if e + Duration::from_secs(max_stale.into()) > now {
                    return Ok(Handled {
                        cache_used: true,
                        response: cached_res,
                    });
                }
            }
        }

        // Successfully validated (RFC 9111 §4.3).
        let get_head = is_get_or_head(req.method());
        if get_head {
            copy_validators(&cached_res, &mut req);
        }
        match origin.forward(req).await {
            Ok(response) => {
                // stale-if-error (RFC 5861 §4) also applies to 5xx
                // responses that indicate an unavailable origin.
                if let Some(sie) = rescc.stale_if_error {
                    if is_retryable_server_error(response.status())
                        && within_stale_window(expires, sie, now)
                    {
                        return Ok(Handled {
                            cache_used: true,
                            response: cached_res,
                        });
                    }
                }
                if get_head && response.status() == StatusCode::NOT_MODIFIED {
                    return Ok(Handled {
                        cache_used: true,
                        response: cached_res,
                    });
                }
                Ok(Handled { cache_used: false, response })
            }
            Err(err) => {
                if let Some(sie) = rescc.stale_if_error {
                    if within_stale_window(expires, sie, now) {
                        return Ok(Handled {
                            cache_used: true,
                            response: cached_res,
                        });
                    }
                }
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl Handler for Shared {
    async fn handle(
        &self,
        req: CachedRequest,
        cached: Option<(CachedRequest, CachedResponse)>,
        origin: Arc<dyn OriginRequester>,
        now: SystemTime,
    ) -> Result<Handled> {
        Shared::handle(self, req, cached, origin, now).await
    }

    fn storable(
        &self,
        req: &CachedRequest,
        res: &mut CachedResponse,
        now: SystemTime,
    ) -> Storability {
        Shared::storable(self, req, res, now)
    }
}

/// Builder for [`Shared`] with non-default options.
pub struct SharedBuilder {
    understood_methods: Vec<Method>,
    understood_status_codes: Vec<u16>,
    heuristically_cacheable_status_codes: Vec<u16>,
    heuristic_expiration_ratio: f64,
    store_response_with_set_cookie_header: bool,
    extended_rules: Vec<Arc<dyn ExtendedRule>>,
}

impl fmt::Debug for SharedBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuilder")
            .field("understood_methods", &self.understood_methods)
            .field(
                "heuristic_expiration_ratio",
                &self.heuristic_expiration_ratio,
            )
            .field(
                "store_response_with_set_cookie_header",
                &self.store_response_with_set_cookie_header,
            )
            .field("extended_rules", &self.extended_rules.len())
            .finish_non_exhaustive()
    }
}

impl Default for SharedBuilder {
    fn default() -> Self {
        let shared = Shared::new();
        Self {
            understood_methods: shared.understood_methods,
            understood_status_codes: shared.understood_status_codes,
            heuristically_cacheable_status_codes: shared
                .heuristically_cacheable_status_codes,
            heuristic_expiration_ratio: shared.heuristic_expiration_ratio,
            store_response_with_set_cookie_header: false,
            extended_rules: Vec::new(),
        }
    }
}

impl SharedBuilder {
    /// Overrides the set of methods the cache understands.
    pub fn understood_methods(mut self, methods: Vec<Method>) -> Self {
        self.understood_methods = methods;
        self
    }

    /// Overrides the set of status codes the cache understands.
    pub fn understood_status_codes(mut self, status_codes: Vec<u16>) -> Self {
        self.understood_status_codes = status_codes;
        self
    }

    /// Overrides the set of heuristically cacheable status codes.
    pub fn heuristically_cacheable_status_codes(
        mut self,
        status_codes: Vec<u16>,
    ) -> Self {
        self.heuristically_cacheable_status_codes = status_codes;
        self
    }

    /// Sets the heuristic expiration ratio (default 0.1). Must not be
    /// negative.
    pub fn heuristic_expiration_ratio(mut self, ratio: f64) -> Self {
        self.heuristic_expiration_ratio = ratio;
        self
    }

    /// Permits storing responses that carry a `Set-Cookie` header.
    pub fn store_response_with_set_cookie_header(mut self) -> Self {
        self.store_response_with_set_cookie_header = true;
        self
    }

    /// Appends an extended cacheability rule. Rules are consulted in the
    /// order they were added.
    pub fn extended_rule(mut self, rule: impl ExtendedRule) -> Self {
        self.extended_rules.push(Arc::new(rule));
        self
    }

    /// Validates the options and builds the engine.
    pub fn build(self) -> Result<Shared> {
        if self.heuristic_expiration_ratio < 0.0 {
            return Err(CacheError::Config(
                "heuristic expiration ratio must not be negative".into(),
            ));
        }
        Ok(Shared {
            understood_methods: self.understood_methods,
            understood_status_codes: self.understood_status_codes,
            heuristically_cacheable_status_codes: self
                .heuristically_cacheable_status_codes,
            heuristic_expiration_ratio: self.heuristic_expiration_ratio,
            store_response_with_set_cookie_header: self
                .store_response_with_set_cookie_header,
            extended_rules: self.extended_rules,
        })
    }
}

/// Computes the expiration instant of a response per RFC 9111 §4.2.1,
/// evaluating the freshness rules in order and using the first match:
/// `s-maxage`, `max-age`, the `Expires` header field, and finally a
/// heuristic lifetime derived from `Last-Modified`. Returns `None` when
/// no expiration is computable.
pub fn calculate_expires(
    d: &ResponseDirectives,
    headers: &HeaderMap,
    heuristic_expiration_ratio: f64,
    now: SystemTime,
) -> Option<SystemTime> {
    if let Some(secs) = d.s_maxage {
        return Some(
            origin_date(headers, now) + Duration::from_secs(secs.into()),
        );
    }
    if let Some(secs) = d.max_age {
        return Some(
            origin_date(headers, now) + Duration::from_secs(secs.into()),
        );
    }
    if let Some(expires) = parse_date_header(headers, header::EXPIRES) {
        // Expires minus the Date header field, re-anchored at the time
        // the response was received.
        let od = origin_date(headers, now);
        return Some(match expires.duration_since(od) {
            Ok(lifetime) => now + lifetime,
            Err(e) => now - e.duration(),
        });
    }
    if let Some(last_modified) =
        parse_date_header(headers, header::LAST_MODIFIED)
    {
        // Heuristic freshness: a fraction of the interval since
        // Last-Modified (RFC 9111 §4.2.2).
        let od = origin_date(headers, now);
        return Some(match od.duration_since(last_modified) {
            Ok(interval) => od + interval.mul_f64(heuristic_expiration_ratio),
            Err(_) => od,
        });
    }
    None
}

/// The Date header field value, or the time the message was received when
/// it is missing or invalid (RFC 9110 §6.6.1).
fn origin_date(headers: &HeaderMap, now: SystemTime) -> SystemTime {
    parse_date_header(headers, header::DATE).unwrap_or(now)
}

fn parse_date_header(
    headers: &HeaderMap,
    name: header::HeaderName,
) -> Option<SystemTime> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

fn within_stale_window(
    expires: Option<SystemTime>,
    window_secs: u32,
    now: SystemTime,
) -> bool {
    let Some(expires) = expires else {
        return false;
    };
    match now.duration_since(expires) {
        Ok(staleness) => staleness < Duration::from_secs(window_secs.into()),
        Err(_) => false,
    }
}

async fn forward(
    origin: Arc<dyn OriginRequester>,
    req: CachedRequest,
) -> Result<Handled> {
    let response = origin.forward(req).await?;
    Ok(Handled { cache_used: false, response })
}

fn request_host(req: &CachedRequest) -> Option<&str> {
    if let Some(host) = req.uri().host() {
        if !host.is_empty() {
            return Some(host);
        }
    }
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
}

fn vary_matches(
    req: &CachedRequest,
    cached_req: &CachedRequest,
    cached_res: &CachedResponse,
) -> bool {
    for value in cached_res.headers().get_all(header::VARY) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            // Vary: * never matches (RFC 9111 §4.1).
            if name == "*" {
                return false;
            }
            let Ok(name) = header::HeaderName::from_bytes(name.as_bytes())
            else {
                return false;
            };
            if req.headers().get(&name) != cached_req.headers().get(&name) {
                return false;
            }
        }
    }
    true
}

fn copy_validators(cached_res: &CachedResponse, req: &mut CachedRequest) {
    if let Some(etag) = cached_res.headers().get(header::ETAG) {
        req.headers_mut().insert(header::IF_NONE_MATCH, etag.clone());
    }
    if let Some(last_modified) = cached_res.headers().get(header::LAST_MODIFIED)
    {
        req.headers_mut()
            .insert(header::IF_MODIFIED_SINCE, last_modified.clone());
    }
}

fn is_get_or_head(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

fn is_retryable_server_error(status: StatusCode) -> bool {
    matches!(status.as_u16(), 500 | 502 | 503 | 504)
}
