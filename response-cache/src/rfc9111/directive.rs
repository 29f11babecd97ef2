use http::HeaderMap;

/// Parsed `Cache-Control` request directives (RFC 9111 §5.2.1).
///
/// When a directive appears more than once the first occurrence wins;
/// unrecognized directives and unparseable numeric arguments are ignored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestDirectives {
    /// max-age, in seconds.
    pub max_age: Option<u32>,
    /// max-stale, in seconds. Bare `max-stale` means any staleness is
    /// accepted and is represented as `u32::MAX`.
    pub max_stale: Option<u32>,
    /// min-fresh, in seconds.
    pub min_fresh: Option<u32>,
    /// no-cache.
    pub no_cache: bool,
    /// no-store.
    pub no_store: bool,
    /// no-transform.
    pub no_transform: bool,
    /// only-if-cached.
    pub only_if_cached: bool,
}

/// Parsed `Cache-Control` response directives (RFC 9111 §5.2.2) plus the
/// RFC 5861 stale extensions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResponseDirectives {
    /// max-age, in seconds.
    pub max_age: Option<u32>,
    /// s-maxage, in seconds.
    pub s_maxage: Option<u32>,
    /// stale-while-revalidate (RFC 5861 §3), in seconds.
    pub stale_while_revalidate: Option<u32>,
    /// stale-if-error (RFC 5861 §4), in seconds.
    pub stale_if_error: Option<u32>,
    /// must-revalidate.
    pub must_revalidate: bool,
    /// must-understand.
    pub must_understand: bool,
    /// no-cache.
    pub no_cache: bool,
    /// no-store.
    pub no_store: bool,
    /// no-transform.
    pub no_transform: bool,
    /// private.
    pub private: bool,
    /// proxy-revalidate.
    pub proxy_revalidate: bool,
    /// public.
    pub public: bool,
}

fn seconds_arg(token: &str, name: &str) -> Option<u32> {
    token.strip_prefix(name)?.strip_prefix('=')?.parse().ok()
}

/// Parses the `Cache-Control` header of a request.
pub fn parse_request_cache_control(headers: &HeaderMap) -> RequestDirectives {
    let mut d = RequestDirectives::default();
    for value in headers.get_all(http::header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for token in value.split(',') {
            let t = token.trim();
            // When a directive is present more than once, the first
            // occurrence is used (RFC 9111 §4.2.1).
            if t.starts_with("max-age") && d.max_age.is_none() {
                d.max_age = seconds_arg(t, "max-age");
            } else if t == "max-stale" && d.max_stale.is_none() {
                // Bare max-stale: the client accepts a stale response of
                // any age (RFC 9111 §5.2.1.2).
                d.max_stale = Some(u32::MAX);
            } else if t.starts_with("max-stale") && d.max_stale.is_none() {
                d.max_stale = seconds_arg(t, "max-stale");
            } else if t.starts_with("min-fresh") && d.min_fresh.is_none() {
                d.min_fresh = seconds_arg(t, "min-fresh");
            } else if t == "no-cache" {
                d.no_cache = true;
            } else if t == "no-store" {
                d.no_store = true;
            } else if t == "no-transform" {
                d.no_transform = true;
            } else if t == "only-if-cached" {
                d.only_if_cached = true;
            }
            // A cache MUST ignore unrecognized cache directives
            // (RFC 9111 §5.2.3).
        }
    }
    d
}

/// Parses the `Cache-Control` header of a response.
pub fn parse_response_cache_control(headers: &HeaderMap) -> ResponseDirectives {
    let mut d = ResponseDirectives::default();
    for value in headers.get_all(http::header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for token in value.split(',') {
            let t = token.trim();
            if t.starts_with("max-age") && d.max_age.is_none() {
                d.max_age = seconds_arg(t, "max-age");
            } else if t.starts_with("s-maxage") && d.s_maxage.is_none() {
                d.s_maxage = seconds_arg(t, "s-maxage");
            } else if t.starts_with("stale-while-revalidate")
                && d.stale_while_revalidate.is_none()
            {
                d.stale_while_revalidate =
                    seconds_arg(t, "stale-while-revalidate");
            } else if t.starts_with("stale-if-error")
                && d.stale_if_error.is_none()
            {
                d.stale_if_error = seconds_arg(t, "stale-if-error");
            } else if t == "must-revalidate" {
                d.must_revalidate = true;
            } else if t == "must-understand" {
                d.must_understand = true;
            } else if t == "no-cache" {
                d.no_cache = true;
            } else if t == "no-store" {
                d.no_store = true;
            } else if t == "no-transform" {
                d.no_transform = true;
            } else if t == "private" {
                d.private = true;
            } else if t == "proxy-revalidate" {
                d.proxy_revalidate = true;
            } else if t == "public" {
                d.public = true;
            }
        }
    }
    d
}
