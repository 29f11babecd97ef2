use http::Method;

/// Cacheable methods. RFC 9111 does not pin these down, but in practice
/// the cacheable methods are GET and HEAD.
pub(crate) fn understood_methods() -> Vec<Method> {
    vec![Method::GET, Method::HEAD]
}

/// Status codes this cache understands: the registered codes of
/// RFC 9110 §15 plus the common extension registrations.
pub(crate) const UNDERSTOOD_STATUS_CODES: &[u16] = &[
    100, // Continue
    101, // Switching Protocols
    102, // Processing
    103, // Early Hints
    200, // OK
    201, // Created
    202, // Accepted
    203, // Non-Authoritative Information
    204, // No Content
    205, // Reset Content
    206, // Partial Content
    207, // Multi-Status
    208, // Already Reported
    226, // IM Used
    300, // Multiple Choices
    301, // Moved Permanently
    302, // Found
    303, // See Other
    304, // Not Modified
    305, // Use Proxy
    307, // Temporary Redirect
    308, // Permanent Redirect
    400, // Bad Request
    401, // Unauthorized
    402, // Payment Required
    403, // Forbidden
    404, // Not Found
    405, // Method Not Allowed
    406, // Not Acceptable
    407, // Proxy Authentication Required
    408, // Request Timeout
    409, // Conflict
    410, // Gone
    411, // Length Required
    412, // Precondition Failed
    413, // Content Too Large
    414, // URI Too Long
    415, // Unsupported Media Type
    416, // Range Not Satisfiable
    417, // Expectation Failed
    418, // (Unused)
    421, // Misdirected Request
    422, // Unprocessable Content
    423, // Locked
    424, // Failed Dependency
    425, // Too Early
    426, // Upgrade Required
    428, // Precondition Required
    429, // Too Many Requests
    431, // Request Header Fields Too Large
    451, // Unavailable For Legal Reasons
    500, // Internal Server Error
    501, // Not Implemented
    502, // Bad Gateway
    503, // Service Unavailable
    504, // Gateway Timeout
    505, // HTTP Version Not Supported
    506, // Variant Also Negotiates
    507, // Insufficient Storage
    508, // Loop Detected
    510, // Not Extended
    511, // Network Authentication Required
];

/// Status codes defined as heuristically cacheable (RFC 9110 §15.1).
pub(crate) const HEURISTICALLY_CACHEABLE_STATUS_CODES: &[u16] = &[
    200, // OK
    203, // Non-Authoritative Information
    204, // No Content
    206, // Partial Content
    300, // Multiple Choices
    301, // Moved Permanently
    308, // Permanent Redirect
    404, // Not Found
    405, // Method Not Allowed
    410, // Gone
    414, // URI Too Long
    501, // Not Implemented
];

/// A typical heuristic freshness fraction of the interval since
/// `Last-Modified` (RFC 9111 §4.2.2).
pub(crate) const HEURISTIC_EXPIRATION_RATIO: f64 = 0.1;
