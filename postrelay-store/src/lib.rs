//! Durable persistence for the relay: users, credentials, mail-logs, quota
//! counters, and the upstream relay pool, plus the credential authenticator
//! built on top of it.
//!
//! Every operation is bounded by a per-call deadline so no store outage can
//! wedge an SMTP session or a delivery worker.

mod auth;
mod error;
mod schema;
mod store;

pub use auth::{AuthError, Authenticator};
pub use error::StoreError;
pub use store::{MailLogPatch, NewMailLog, Store};
