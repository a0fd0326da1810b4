//! Transient/permanent classification of upstream failures.
//!
//! Classification is text-based: a failure is transient when its message
//! carries one of the known markers or a 4xx reply code (bare `4yz` or an
//! enhanced `4.x.y` status). Everything else is permanent.

/// Marker substrings that identify a failure worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection timeout",
    "temporary failure",
    "try again later",
    "service unavailable",
    "too many connections",
    "rate limit",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

#[must_use]
pub fn classify_failure(error: &str) -> FailureKind {
    let lowered = error.to_lowercase();

    if TRANSIENT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return FailureKind::Transient;
    }

    for token in lowered.split_whitespace() {
        if token.starts_with("4.") {
            return FailureKind::Transient;
        }
        if token.len() == 3
            && token.starts_with('4')
            && token.bytes().all(|b| b.is_ascii_digit())
        {
            return FailureKind::Transient;
        }
    }

    FailureKind::Permanent
}
