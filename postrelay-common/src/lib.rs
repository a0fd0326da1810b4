//! Shared foundation for the postrelay workspace: configuration, logging,
//! domain models, and the SMTP reply-code vocabulary used on both sides of
//! the relay.

pub mod config;
pub mod logging;
pub mod models;
pub mod status;

/// Process-wide lifecycle signal, distributed over a broadcast channel.
///
/// Listeners stop accepting on `Shutdown`; in-flight sessions finish or hit
/// their idle timeout; workers cancel their consumer subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
