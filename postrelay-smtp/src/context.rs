use std::borrow::Cow;

use postrelay_common::models::{SmtpCredential, User};
use postrelay_common::status::Status;

use crate::state::{self, State};

/// Mutable per-session context threaded through the state machine and the
/// admission backend. The session object owns the in-flight envelope; RSET
/// or disconnect drops it.
#[derive(Debug, Default)]
pub struct SessionContext {
    /// Hostname the client announced in EHLO/HELO.
    pub client_id: String,
    /// Whether the client used EHLO (extended SMTP).
    pub extended: bool,
    /// Authenticated credential and its owning user, cached after AUTH.
    pub credential: Option<SmtpCredential>,
    pub user: Option<User>,
    /// In-flight envelope.
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub declared_size: Option<u64>,
    /// Reply override set by the state machine or the backend; when absent
    /// the session falls back to the state's default reply.
    pub response: Option<(Status, Cow<'static, str>)>,
    /// Set once the transport has been upgraded (STARTTLS or implicit TLS).
    pub tls_active: bool,
}

impl SessionContext {
    #[must_use]
    pub fn authenticated(&self) -> bool {
        self.credential.is_some()
    }

    pub fn respond(&mut self, status: Status, message: impl Into<Cow<'static, str>>) {
        self.response = Some((status, message.into()));
    }

    /// Drop the in-flight envelope. Authentication survives.
    pub fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.declared_size = None;
    }

    /// The idle state this session returns to between transactions.
    #[must_use]
    pub fn ready_state(&self) -> State {
        if self.authenticated() {
            State::Authed(state::Authed)
        } else if self.client_id.is_empty() {
            State::Connect(state::Connect)
        } else {
            State::Ready(state::Ready)
        }
    }
}
