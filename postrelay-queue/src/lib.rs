//! Broker adapter: the exchange/queue topology, priority publishing, and
//! the consume loop with its retry/park/drop policy.
//!
//! Three queues hang off one exchange. The main queue feeds the delivery
//! workers; the delay queue holds retried messages for a per-message TTL and
//! dead-letters them back to the main queue; the failed queue is the
//! terminal sink behind a dead-letter exchange.

mod broker;
mod error;
mod message;
mod retry;

pub use broker::{Broker, ConsumeError};
pub use error::QueueError;
pub use message::{compute_priority, MailMessage};
pub use retry::{retry_count_from_headers, retry_delay, MAX_BROKER_RETRIES};
