//! Classification of HTTP-style status codes.

/// How the engine treats a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx.
    Success,
    /// 401: the credential expired.
    AuthExpired,
    /// 409 or 412: the server holds a newer version.
    Conflict,
    /// Any other 4xx, and unexpected 1xx/3xx: terminal.
    Rejected,
    /// 5xx, 408 and 429: try again later.
    Retryable,
}

/// Classifies a status code.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 => StatusClass::AuthExpired,
        409 | 412 => StatusClass::Conflict,
        408 | 429 => StatusClass::Retryable,
        400..=499 => StatusClass::Rejected,
        500..=599 => StatusClass::Retryable,
        _ => StatusClass::Rejected,
    }
}
