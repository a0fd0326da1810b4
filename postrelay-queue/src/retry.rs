use std::time::Duration;

use lapin::types::{AMQPValue, FieldTable};

/// A message is parked in the delay queue at most this many times before the
/// dead-letter topology routes it to the failed queue.
pub const MAX_BROKER_RETRIES: u32 = 3;

const BACKOFF: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
];

const BACKOFF_CEILING: Duration = Duration::from_secs(30 * 60);

/// How long a message sits in the delay queue before its next redelivery,
/// indexed by how many retries it has already been through.
#[must_use]
pub fn retry_delay(retry_count: u32) -> Duration {
    BACKOFF
        .get(retry_count as usize)
        .copied()
        .unwrap_or(BACKOFF_CEILING)
}

/// Read the `retry-count` header off an incoming delivery; absent or
/// malformed headers count as zero.
#[must_use]
pub fn retry_count_from_headers(headers: Option<&FieldTable>) -> u32 {
    let Some(headers) = headers else {
        return 0;
    };

    let value = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "retry-count")
        .map(|(_, value)| value);

    match value {
        Some(AMQPValue::LongInt(n)) => u32::try_from(*n).unwrap_or(0),
        Some(AMQPValue::LongLongInt(n)) => u32::try_from(*n).unwrap_or(0),
        Some(AMQPValue::ShortInt(n)) => u32::try_from(*n).unwrap_or(0),
        Some(AMQPValue::ShortShortInt(n)) => u32::try_from(*n).unwrap_or(0),
        _ => 0,
    }
}
