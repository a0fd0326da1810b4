//! Delivery workers: competing consumers on the main queue that dial an
//! upstream relay from a refreshable pool, drive the outbound SMTP
//! conversation, classify failures, and reconcile the mail-log record.

pub mod classify;
pub mod client;
pub mod headers;
mod processor;
mod relay_pool;

pub use classify::{classify_failure, FailureKind};
pub use processor::{deliver_once, DeliveryProcessor};
pub use relay_pool::RelayPool;
