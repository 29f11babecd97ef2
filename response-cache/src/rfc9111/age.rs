use std::time::SystemTime;

use http::{header, HeaderMap, HeaderValue};

/// Computes and sets the `Age` header per RFC 9111 §4.2.3.
///
/// Only stored responses carry an `Age`: the presence of the header
/// implies the response was not generated by the origin for this request,
/// so freshly fetched responses are left untouched. Responses without a
/// parseable `Date` are also left untouched.
///
/// The cache does not track per-entry request/response timestamps, so
/// `request_time` and `response_time` are both approximated: the former by
/// the `Date` value, the latter by `now`.
pub fn set_age_header(cache_used: bool, headers: &mut HeaderMap, now: SystemTime) {
    if !cache_used {
        return;
    }
    let age_value: u64 = headers
        .get(header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let date_value = match headers
        .get(header::DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    {
        Some(t) => t,
        None => return,
    };
    let request_time = date_value; // Approximate value.
    let response_time = now; // Approximate value.
    let apparent_age = response_time
        .duration_since(date_value)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let response_delay = response_time
        .duration_since(request_time)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let corrected_age_value = age_value.saturating_add(response_delay);
    let corrected_initial_age = apparent_age.max(corrected_age_value);
    let resident_time = now
        .duration_since(response_time)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let current_age = corrected_initial_age.saturating_add(resident_time);
    if let Ok(v) = HeaderValue::from_str(&current_age.to_string()) {
        headers.insert(header::AGE, v);
    }
}
