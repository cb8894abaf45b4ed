//! Error classification
//!
//! Buckets an [`OperationError`] into an [`ErrorKind`]. Signals are checked
//! from most to least specific: status code, then error code, then message
//! patterns. Anything unmatched is [`ErrorKind::Unknown`], which is never
//! retried.

use crate::error::{ErrorKind, OperationError, VALIDATION_CODE};

/// Transport error codes that mean the connection itself failed
const NETWORK_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ECONNABORTED",
    "ENOTCONN",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "EADDRNOTAVAIL",
];

/// Transport error codes that mean a deadline passed
const TIMEOUT_CODES: &[&str] = &["ETIMEDOUT", "ESOCKETTIMEDOUT", "57014"];

const NETWORK_PATTERNS: &[&str] = &[
    "failed to fetch",
    "network error",
    "network request failed",
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "dns",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

const VALIDATION_PATTERNS: &[&str] = &["validation", "invalid input", "violates", "malformed"];

/// Classify a raw failure
///
/// Pure function: the same error always yields the same kind. Never returns
/// [`ErrorKind::CircuitOpen`], which only the breaker produces.
pub fn classify(error: &OperationError) -> ErrorKind {
    if let Some(kind) = error.status.and_then(classify_status) {
        return kind;
    }

    if let Some(kind) = error.code.as_deref().and_then(classify_code) {
        return kind;
    }

    classify_message(&error.message).unwrap_or(ErrorKind::Unknown)
}

fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        // Browsers report failed fetches with status 0
        0 => Some(ErrorKind::Network),
        400 | 422 => Some(ErrorKind::Validation),
        408 | 504 => Some(ErrorKind::Timeout),
        429 => Some(ErrorKind::Server),
        401..=499 => Some(ErrorKind::Client),
        500..=599 => Some(ErrorKind::Server),
        _ => None,
    }
}

fn classify_code(code: &str) -> Option<ErrorKind> {
    if code == VALIDATION_CODE {
        return Some(ErrorKind::Validation);
    }
    if TIMEOUT_CODES.contains(&code) {
        return Some(ErrorKind::Timeout);
    }
    if NETWORK_CODES.contains(&code) {
        return Some(ErrorKind::Network);
    }
    // PostgREST errors are raised for bad requests or auth problems
    if code.starts_with("PGRST") {
        return Some(ErrorKind::Client);
    }
    classify_sqlstate(code)
}

/// Postgres SQLSTATE codes, by class
fn classify_sqlstate(code: &str) -> Option<ErrorKind> {
    if code.len() != 5 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    match &code[..2] {
        // connection exception
        "08" => Some(ErrorKind::Network),
        // data exception, integrity constraint violation
        "22" | "23" => Some(ErrorKind::Validation),
        // serialization failure, deadlock; insufficient resources; operator intervention
        "40" | "53" | "57" => Some(ErrorKind::Server),
        // invalid authorization, insufficient privilege, syntax
        "28" | "42" => Some(ErrorKind::Client),
        _ => None,
    }
}

fn classify_message(message: &str) -> Option<ErrorKind> {
    let message = message.to_ascii_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));

    if matches(TIMEOUT_PATTERNS) {
        Some(ErrorKind::Timeout)
    } else if matches(NETWORK_PATTERNS) {
        Some(ErrorKind::Network)
    } else if matches(VALIDATION_PATTERNS) {
        Some(ErrorKind::Validation)
    } else {
        None
    }
}
