//! Ingress SMTP: the receive-side protocol state machine, session
//! orchestration, TLS-capable listeners, and the admission backend that
//! gates every transaction on credential policy before hand-off to the
//! queue.

pub mod backend;
pub mod command;
mod connection;
pub mod context;
pub mod error;
mod extensions;
mod listener;
mod server;
pub mod session;
pub mod state;

pub use backend::{Admission, CoreBackend, IngressMail, RelayBackend};
pub use connection::TlsContext;
pub use listener::{Listener, TlsMode};
pub use server::SmtpServer;
pub use session::{Session, SessionSettings};
pub use state::State;
