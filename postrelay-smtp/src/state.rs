use core::fmt::{self, Display, Formatter};

use postrelay_common::status::Status;

use crate::command::{Command, HeloVariant};
use crate::context::SessionContext;

// State definitions. One struct per protocol position; the enum below wraps
// them for dynamic dispatch through `transition`.

/// Client connected, greeting sent, no EHLO yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect;

/// EHLO/HELO accepted; submission still requires authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready;

/// AUTH PLAIN in progress. `payload` holds the base64 initial response when
/// the client supplied one inline; otherwise the session challenges with a
/// 334 and the next line becomes the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPending {
    pub payload: Option<String>,
}

/// Authenticated and between transactions; the only state that accepts
/// MAIL FROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authed;

/// MAIL FROM accepted, waiting for recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailFrom;

/// At least one recipient accepted; RCPT self-loops here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcptTo;

/// DATA accepted, 354 about to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Data;

/// Consuming message bytes until `CRLF.CRLF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading;

/// End-of-data seen; admission and enqueue run before the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostDot;

/// STARTTLS accepted; the transport upgrade happens next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTls;

/// Client issued QUIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quit;

/// Server-side close (shutdown or fatal error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Connect(Connect),
    Ready(Ready),
    AuthPending(AuthPending),
    Authed(Authed),
    MailFrom(MailFrom),
    RcptTo(RcptTo),
    Data(Data),
    Reading(Reading),
    PostDot(PostDot),
    StartTls(StartTls),
    Quit(Quit),
    Close(Close),
}

impl Default for State {
    fn default() -> Self {
        Self::Connect(Connect)
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Connect(_) => "Connect",
            Self::Ready(_) => "Ready",
            Self::AuthPending(_) => "AUTH",
            Self::Authed(_) => "Authed",
            Self::MailFrom(_) => "MAIL",
            Self::RcptTo(_) => "RCPT",
            Self::Data(_) => "DATA",
            Self::Reading(_) | Self::PostDot(_) => "",
            Self::StartTls(_) => "STARTTLS",
            Self::Quit(_) => "QUIT",
            Self::Close(_) => "Close",
        })
    }
}

impl State {
    /// Advance the protocol position for one parsed command.
    ///
    /// Sequencing violations do not abort the session: the offending
    /// command gets a permanent reply via the context and the position is
    /// unchanged. Unauthenticated MAIL, RCPT, and DATA are refused with
    /// 530; anonymous submission is not supported.
    #[must_use]
    pub fn transition(self, command: Command, ctx: &mut SessionContext) -> Self {
        match (self, command) {
            // QUIT ends the session from anywhere
            (_, Command::Quit) => Self::Quit(Quit),

            // NOOP never moves the machine
            (state, Command::Noop) => {
                ctx.respond(Status::Ok, "Ok");
                state
            }

            // RSET drops the envelope but keeps authentication
            (_, Command::Rset) => {
                ctx.reset_transaction();
                ctx.respond(Status::Ok, "Ok");
                ctx.ready_state()
            }

            // EHLO/HELO (re)starts the session outside DATA reception
            (
                Self::Connect(_)
                | Self::Ready(_)
                | Self::Authed(_)
                | Self::MailFrom(_)
                | Self::RcptTo(_)
                | Self::PostDot(_),
                Command::Helo(variant),
            ) => {
                ctx.reset_transaction();
                match variant {
                    HeloVariant::Ehlo(id) => {
                        ctx.client_id = id;
                        ctx.extended = true;
                    }
                    HeloVariant::Helo(id) => {
                        ctx.client_id = id;
                        ctx.extended = false;
                    }
                }
                ctx.ready_state()
            }

            // STARTTLS: only from Ready, only over ESMTP, only once
            (Self::Ready(_), Command::StartTls) if ctx.extended && !ctx.tls_active => {
                Self::StartTls(StartTls)
            }
            (state @ Self::Ready(_), Command::StartTls) => {
                ctx.respond(
                    Status::InvalidCommandSequence,
                    if ctx.tls_active {
                        "TLS already active"
                    } else {
                        "STARTTLS requires EHLO"
                    },
                );
                state
            }
            (state @ (Self::MailFrom(_) | Self::RcptTo(_)), Command::StartTls) => {
                ctx.respond(
                    Status::InvalidCommandSequence,
                    "STARTTLS not allowed during mail transaction",
                );
                state
            }

            // AUTH PLAIN from Ready; everything else is out of sequence
            (Self::Ready(_), Command::Auth { mechanism, initial }) => {
                if mechanism == "PLAIN" {
                    Self::AuthPending(AuthPending { payload: initial })
                } else {
                    ctx.respond(
                        Status::ParameterNotImplemented,
                        "only AUTH PLAIN is supported",
                    );
                    Self::Ready(Ready)
                }
            }
            (state @ Self::Connect(_), Command::Auth { .. }) => {
                ctx.respond(Status::InvalidCommandSequence, "send EHLO first");
                state
            }
            (
                state @ (Self::Authed(_) | Self::MailFrom(_) | Self::RcptTo(_)),
                Command::Auth { .. },
            ) => {
                ctx.respond(Status::InvalidCommandSequence, "already authenticated");
                state
            }

            // MAIL FROM: the authentication gate
            (Self::Authed(_), Command::MailFrom(sender, params)) => {
                ctx.sender = sender;
                ctx.declared_size = params.size();
                Self::MailFrom(MailFrom)
            }
            (state @ (Self::Connect(_) | Self::Ready(_)), Command::MailFrom(..)) => {
                ctx.respond(Status::AuthRequired, "authentication required");
                state
            }
            (state @ (Self::MailFrom(_) | Self::RcptTo(_)), Command::MailFrom(..)) => {
                ctx.respond(Status::InvalidCommandSequence, "nested MAIL command");
                state
            }

            // RCPT TO accumulates recipients
            (Self::MailFrom(_) | Self::RcptTo(_), Command::RcptTo(rcpt)) => {
                ctx.recipients.push(rcpt);
                Self::RcptTo(RcptTo)
            }
            (state @ (Self::Connect(_) | Self::Ready(_)), Command::RcptTo(_)) => {
                ctx.respond(Status::AuthRequired, "authentication required");
                state
            }
            (state @ Self::Authed(_), Command::RcptTo(_)) => {
                ctx.respond(Status::InvalidCommandSequence, "need MAIL before RCPT");
                state
            }

            // DATA requires at least one accepted recipient
            (Self::RcptTo(_), Command::Data) => Self::Data(Data),
            (state @ (Self::Connect(_) | Self::Ready(_)), Command::Data) => {
                ctx.respond(Status::AuthRequired, "authentication required");
                state
            }
            (state @ Self::Authed(_), Command::Data) => {
                ctx.respond(Status::InvalidCommandSequence, "need MAIL before DATA");
                state
            }
            (state @ Self::MailFrom(_), Command::Data) => {
                ctx.respond(Status::InvalidCommandSequence, "need RCPT before DATA");
                state
            }

            // Unparseable input
            (state, Command::Invalid(_)) => {
                ctx.respond(Status::SyntaxError, "syntax error");
                state
            }

            // Any remaining combination is out of sequence
            (state, _) => {
                ctx.respond(Status::InvalidCommandSequence, "bad sequence of commands");
                state
            }
        }
    }

    #[must_use]
    pub const fn should_close(&self) -> bool {
        matches!(self, Self::Quit(_) | Self::Close(_))
    }

    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        matches!(
            self,
            Self::MailFrom(_) | Self::RcptTo(_) | Self::Data(_) | Self::Reading(_)
        )
    }
}
