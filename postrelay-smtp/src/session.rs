//! One SMTP session over one accepted connection: the receive loop, the
//! reply writer, DATA accumulation, and the seams into the state machine
//! and the admission backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use postrelay_common::status::Status;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::backend::{Admission, IngressMail, RelayBackend};
use crate::command::Command;
use crate::connection::{Connection, TlsContext};
use crate::context::SessionContext;
use crate::error::SessionError;
use crate::extensions;
use crate::state::{self, AuthPending, State};

/// Shared per-listener session configuration.
#[derive(Debug)]
pub struct SessionSettings {
    pub banner: Arc<str>,
    pub tls: Option<TlsContext>,
    pub max_msg_size: usize,
    /// Per-command read deadline.
    pub idle_timeout: Duration,
}

impl SessionSettings {
    #[must_use]
    pub fn new(banner: &str, tls: Option<TlsContext>, max_msg_size: usize) -> Self {
        Self {
            banner: Arc::from(banner),
            tls,
            max_msg_size,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of processing one batch of input.
enum Event {
    Continue,
    Close,
    UpgradeTls,
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    local: SocketAddr,
    connection: Connection<Stream>,
    backend: Arc<dyn RelayBackend>,
    settings: Arc<SessionSettings>,
    state: State,
    ctx: SessionContext,
    /// Unconsumed command bytes.
    line_buf: Vec<u8>,
    /// Message bytes accumulated while in the Reading state.
    data_buf: Vec<u8>,
    /// Set once the payload crossed the configured cap; the buffer is then
    /// trimmed to a terminator-detection window and the message refused at
    /// end-of-data while the session stays authenticated.
    oversize: bool,
    pending_tls: bool,
}

/// Strip the `CRLF.CRLF` terminator and reverse dot-stuffing.
fn finalize_payload(mut raw: Vec<u8>) -> Vec<u8> {
    if raw.as_slice() == b".\r\n" {
        return Vec::new();
    }
    if raw.ends_with(b"\r\n.\r\n") {
        raw.truncate(raw.len() - 5);
    }
    dot_unstuff(&raw)
}

fn dot_unstuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut at_line_start = true;
    for &byte in data {
        if at_line_start && byte == b'.' {
            at_line_start = false;
            continue;
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    out
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(
        connection: Connection<Stream>,
        peer: SocketAddr,
        local: SocketAddr,
        backend: Arc<dyn RelayBackend>,
        settings: Arc<SessionSettings>,
        tls_active: bool,
    ) -> Self {
        Self {
            peer,
            local,
            connection,
            backend,
            settings,
            state: State::default(),
            ctx: SessionContext {
                tls_active,
                ..Default::default()
            },
            line_buf: Vec::new(),
            data_buf: Vec::new(),
            oversize: false,
            pending_tls: false,
        }
    }

    /// Drive the session to completion. In-flight sessions are not
    /// interrupted by shutdown; they finish their conversation or hit the
    /// per-command idle timeout.
    ///
    /// # Errors
    /// Returns an error on I/O failure or timeout.
    pub async fn run(mut self) -> Result<(), SessionError> {
        debug!(peer = %self.peer, "session opened");

        self.send_reply(
            Status::ServiceReady,
            &format!("{} ESMTP service ready", self.settings.banner),
        )
        .await?;

        let result = loop {
            let mut buf = [0u8; 4096];
            let read = match timeout(self.settings.idle_timeout, self.connection.receive(&mut buf))
                .await
            {
                Err(_) => {
                    let secs = self.settings.idle_timeout.as_secs();
                    let _ = self
                        .send_reply(Status::Unavailable, "idle timeout, closing connection")
                        .await;
                    break Err(SessionError::Timeout(secs));
                }
                Ok(Err(err)) => break Err(err.into()),
                Ok(Ok(0)) => break Ok(()),
                Ok(Ok(n)) => n,
            };

            match self.ingest(&buf[..read]).await? {
                Event::Continue => {}
                Event::Close => break Ok(()),
                Event::UpgradeTls => {
                    let tls = self
                        .settings
                        .tls
                        .clone()
                        .ok_or_else(|| SessionError::Protocol("TLS accepted without material".into()))?;

                    let connection = self.connection;
                    self.connection = connection.upgrade(&tls).await?;

                    // RFC 3207: discard everything learned before the
                    // handshake and wait for a fresh EHLO.
                    self.state = State::default();
                    self.ctx = SessionContext {
                        tls_active: true,
                        ..Default::default()
                    };
                    self.line_buf.clear();
                    self.data_buf.clear();
                    self.pending_tls = false;
                    debug!(peer = %self.peer, "connection upgraded to TLS");
                }
            }
        };

        debug!(peer = %self.peer, "session closed");
        result
    }

    async fn ingest(&mut self, bytes: &[u8]) -> Result<Event, SessionError> {
        if matches!(self.state, State::Reading(_)) {
            if self.feed_data(bytes) {
                self.finish_data().await?;
            }
        } else {
            self.line_buf.extend_from_slice(bytes);
        }

        loop {
            if matches!(self.state, State::Reading(_)) {
                // bytes pipelined behind the DATA command belong to the
                // message payload
                if !self.line_buf.is_empty() {
                    let rest = std::mem::take(&mut self.line_buf);
                    if self.feed_data(&rest) {
                        self.finish_data().await?;
                        continue;
                    }
                }
                return Ok(Event::Continue);
            }

            let Some(line) = self.take_line() else {
                return Ok(Event::Continue);
            };

            match self.handle_line(&line).await? {
                Event::Continue => {}
                event => return Ok(event),
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.line_buf.windows(2).position(|w| w == b"\r\n")?;
        let line: Vec<u8> = self.line_buf.drain(..pos + 2).collect();
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }

    /// Accumulate message bytes; returns true at end-of-data.
    fn feed_data(&mut self, bytes: &[u8]) -> bool {
        self.data_buf.extend_from_slice(bytes);

        if !self.oversize && self.data_buf.len() > self.settings.max_msg_size + 5 {
            self.oversize = true;
        }
        if self.oversize && self.data_buf.len() > 5 {
            let keep = self.data_buf.split_off(self.data_buf.len() - 5);
            self.data_buf = keep;
        }

        self.data_buf.as_slice() == b".\r\n" || self.data_buf.ends_with(b"\r\n.\r\n")
    }

    async fn handle_line(&mut self, line: &str) -> Result<Event, SessionError> {
        trace!(peer = %self.peer, "<< {line}");

        if matches!(
            self.state,
            State::AuthPending(AuthPending { payload: None })
        ) {
            if line.trim() == "*" {
                self.state = self.ctx.ready_state();
                self.send_reply(Status::SyntaxError, "authentication cancelled")
                    .await?;
                return Ok(Event::Continue);
            }
            self.state = State::AuthPending(AuthPending {
                payload: Some(line.trim().to_string()),
            });
        } else {
            let command = Command::try_from(line).unwrap_or_else(|invalid| invalid);
            self.state = std::mem::take(&mut self.state).transition(command, &mut self.ctx);
        }

        self.emit().await?;

        if self.state.should_close() {
            return Ok(Event::Close);
        }
        if self.pending_tls {
            return Ok(Event::UpgradeTls);
        }
        Ok(Event::Continue)
    }

    /// Run the async work for the freshly entered state and send the reply.
    async fn emit(&mut self) -> Result<(), SessionError> {
        // a rejection from the state machine wins over any default
        if let Some((status, message)) = self.ctx.response.take() {
            return self.send_reply(status, &message).await;
        }

        match self.state.clone() {
            State::Ready(_) | State::Authed(_) => self.send_greeting().await,
            State::AuthPending(AuthPending { payload: None }) => {
                self.send_reply(Status::AuthContinue, "").await
            }
            State::AuthPending(AuthPending {
                payload: Some(payload),
            }) => self.handle_auth_payload(&payload).await,
            State::MailFrom(_) => self.handle_mail_from().await,
            State::RcptTo(_) => self.handle_rcpt_to().await,
            State::Data(_) => {
                self.state = State::Reading(state::Reading);
                self.send_reply(Status::StartMailInput, "end data with <CR><LF>.<CR><LF>")
                    .await
            }
            State::StartTls(_) => {
                if self.settings.tls.is_some() && !self.ctx.tls_active {
                    self.pending_tls = true;
                    self.send_reply(Status::ServiceReady, "ready to start TLS")
                        .await
                } else {
                    self.state = self.ctx.ready_state();
                    self.send_reply(Status::TlsUnavailable, "TLS not available")
                        .await
                }
            }
            State::Quit(_) => self.send_reply(Status::GoodBye, "bye").await,
            // Connect, Reading, PostDot, and Close produce no reply here
            _ => Ok(()),
        }
    }

    async fn send_greeting(&mut self) -> Result<(), SessionError> {
        if !self.ctx.extended {
            let banner = self.settings.banner.clone();
            return self
                .send_reply(Status::Ok, &format!("{banner} at your service"))
                .await;
        }

        let offer_starttls = self.settings.tls.is_some() && !self.ctx.tls_active;
        let capabilities = extensions::advertised(self.settings.max_msg_size, offer_starttls);

        let mut lines = Vec::with_capacity(capabilities.len() + 1);
        lines.push(format!("{}-{}", Status::Ok, self.settings.banner));
        for (index, capability) in capabilities.iter().enumerate() {
            let separator = if index + 1 == capabilities.len() { ' ' } else { '-' };
            lines.push(format!("{}{}{}", Status::Ok, separator, capability));
        }

        for line in lines {
            trace!(peer = %self.peer, ">> {line}");
            self.connection.send_line(&line).await?;
        }
        Ok(())
    }

    async fn handle_auth_payload(&mut self, payload: &str) -> Result<(), SessionError> {
        let Some((username, password)) = crate::backend::decode_plain(payload) else {
            self.state = self.ctx.ready_state();
            return self
                .send_reply(Status::SyntaxError, "invalid AUTH PLAIN payload")
                .await;
        };

        match self.backend.authenticate(&username, &password).await {
            Ok((credential, user)) => {
                self.ctx.credential = Some(credential);
                self.ctx.user = Some(user);
                self.state = State::Authed(state::Authed);
                self.send_reply(Status::AuthSuccessful, "authentication successful")
                    .await
            }
            Err(admission) => {
                self.state = self.ctx.ready_state();
                let (status, reason) = admission
                    .reply()
                    .map(|(s, r)| (s, r.to_string()))
                    .unwrap_or((Status::AuthFailed, "authentication failed".to_string()));
                self.send_reply(status, &reason).await
            }
        }
    }

    async fn handle_mail_from(&mut self) -> Result<(), SessionError> {
        // the declared SIZE is checked up front so the client need not
        // transmit a payload the server will refuse anyway
        if let Some(declared) = self.ctx.declared_size {
            if declared > self.settings.max_msg_size as u64 {
                self.ctx.reset_transaction();
                self.state = self.ctx.ready_state();
                return self
                    .send_reply(
                        Status::ExceededStorage,
                        &format!(
                            "declared size {declared} exceeds maximum of {}",
                            self.settings.max_msg_size
                        ),
                    )
                    .await;
            }
        }

        let Some(credential) = self.ctx.credential.clone() else {
            return Err(SessionError::Protocol("MAIL without credential".into()));
        };

        match self
            .backend
            .check_sender(&credential, self.ctx.sender.as_deref())
        {
            Admission::Accept => self.send_reply(Status::Ok, "Ok").await,
            rejection => {
                self.ctx.reset_transaction();
                self.state = self.ctx.ready_state();
                let (status, reason) = rejection
                    .reply()
                    .map(|(s, r)| (s, r.to_string()))
                    .unwrap_or((Status::Error, "sender refused".to_string()));
                warn!(peer = %self.peer, reason, "sender refused");
                self.send_reply(status, &reason).await
            }
        }
    }

    async fn handle_rcpt_to(&mut self) -> Result<(), SessionError> {
        let Some(credential) = self.ctx.credential.clone() else {
            return Err(SessionError::Protocol("RCPT without credential".into()));
        };

        match self
            .backend
            .check_recipient(&credential, self.ctx.recipients.len())
        {
            Admission::Accept => self.send_reply(Status::Ok, "Ok").await,
            rejection => {
                // the offending recipient is dropped; earlier ones stand
                self.ctx.recipients.pop();
                if self.ctx.recipients.is_empty() {
                    self.state = State::MailFrom(state::MailFrom);
                }
                let (status, reason) = rejection
                    .reply()
                    .map(|(s, r)| (s, r.to_string()))
                    .unwrap_or((Status::Error, "recipient refused".to_string()));
                self.send_reply(status, &reason).await
            }
        }
    }

    async fn finish_data(&mut self) -> Result<(), SessionError> {
        self.state = State::PostDot(state::PostDot);

        let raw = std::mem::take(&mut self.data_buf);
        let oversize = std::mem::take(&mut self.oversize);
        let payload = finalize_payload(raw);

        let (credential, user) = match (self.ctx.credential.clone(), self.ctx.user.clone()) {
            (Some(credential), Some(user)) => (credential, user),
            _ => return Err(SessionError::Protocol("DATA without credential".into())),
        };

        let mail = IngressMail {
            credential: &credential,
            user: &user,
            sender: self.ctx.sender.as_deref().unwrap_or(""),
            recipients: &self.ctx.recipients,
            payload: &payload,
            oversize,
            local_ip: self.local.ip().to_string(),
        };

        let (status, message) = match self.backend.accept_message(mail).await {
            Ok(message_id) => (Status::Ok, format!("Ok: queued as {message_id}")),
            Err(rejection) => rejection
                .reply()
                .map(|(s, r)| (s, r.to_string()))
                .unwrap_or((Status::TransactionFailed, "message refused".to_string())),
        };

        // rejected or accepted, the transaction is over and the session
        // stays authenticated
        self.ctx.reset_transaction();
        self.state = self.ctx.ready_state();
        self.send_reply(status, &message).await
    }

    async fn send_reply(&mut self, status: Status, message: &str) -> Result<(), SessionError> {
        let line = if message.is_empty() {
            format!("{status}")
        } else {
            format!("{status} {message}")
        };
        trace!(peer = %self.peer, ">> {line}");
        self.connection.send_line(&line).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use postrelay_common::models::{
        CredentialSettings, CredentialStatus, SmtpCredential, User, UserStatus,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::backend::DEFAULT_MAX_RECIPIENTS;

    #[derive(Debug)]
    struct Captured {
        sender: String,
        recipients: Vec<String>,
        payload: Vec<u8>,
        oversize: bool,
    }

    struct MockBackend {
        credential: SmtpCredential,
        user: User,
        password: String,
        accept: Mutex<Vec<Result<String, Admission>>>,
        captured: Mutex<Vec<Captured>>,
    }

    impl MockBackend {
        fn new(settings: CredentialSettings) -> Self {
            let now = Utc::now();
            Self {
                credential: SmtpCredential {
                    id: 7,
                    user_id: 3,
                    name: "test".into(),
                    username: "u".into(),
                    password_hash: String::new(),
                    description: String::new(),
                    status: CredentialStatus::Active,
                    created_at: now,
                    updated_at: now,
                    last_used: None,
                    usage_count: 0,
                    settings,
                },
                user: User {
                    id: 3,
                    username: "owner".into(),
                    email: "owner@ex.com".into(),
                    password_hash: String::new(),
                    status: UserStatus::Active,
                    daily_quota: 0,
                    hourly_quota: 0,
                    created_at: now,
                    updated_at: now,
                },
                password: "pw".into(),
                accept: Mutex::new(Vec::new()),
                captured: Mutex::new(Vec::new()),
            }
        }

        fn queue_accept(&self, result: Result<String, Admission>) {
            self.accept.lock().unwrap().push(result);
        }
    }

    #[async_trait]
    impl RelayBackend for MockBackend {
        async fn authenticate(
            &self,
            username: &str,
            password: &str,
        ) -> Result<(SmtpCredential, User), Admission> {
            if username == self.credential.username && password == self.password {
                Ok((self.credential.clone(), self.user.clone()))
            } else {
                Err(Admission::reject_permanent(
                    Status::AuthFailed,
                    "authentication credentials invalid",
                ))
            }
        }

        fn check_sender(&self, credential: &SmtpCredential, sender: Option<&str>) -> Admission {
            let allowed = &credential.settings.allowed_domains;
            if allowed.is_empty() {
                return Admission::Accept;
            }
            let domain = sender
                .and_then(|s| s.rsplit_once('@'))
                .map(|(_, d)| d.to_ascii_lowercase());
            match domain {
                Some(domain) if allowed.iter().any(|d| d.eq_ignore_ascii_case(&domain)) => {
                    Admission::Accept
                }
                _ => Admission::reject_permanent(Status::Error, "sender domain not permitted"),
            }
        }

        fn check_recipient(&self, credential: &SmtpCredential, accepted: usize) -> Admission {
            let cap = match credential.settings.max_recipients {
                0 => DEFAULT_MAX_RECIPIENTS,
                cap => cap,
            };
            if accepted as i64 > cap {
                Admission::reject_permanent(Status::Error, "too many recipients")
            } else {
                Admission::Accept
            }
        }

        async fn accept_message(&self, mail: IngressMail<'_>) -> Result<String, Admission> {
            self.captured.lock().unwrap().push(Captured {
                sender: mail.sender.to_string(),
                recipients: mail.recipients.to_vec(),
                payload: mail.payload.to_vec(),
                oversize: mail.oversize,
            });
            self.accept
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok("1700000000-3-00c0ffee@relay.test".to_string()))
        }
    }

    struct TestClient {
        stream: DuplexStream,
        buffer: Vec<u8>,
    }

    impl TestClient {
        async fn send(&mut self, line: &str) {
            self.stream
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        async fn read_line(&mut self) -> String {
            loop {
                if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                    let line: Vec<u8> = self.buffer.drain(..pos + 2).collect();
                    return String::from_utf8_lossy(&line[..pos]).into_owned();
                }
                let mut chunk = [0u8; 1024];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "server closed unexpectedly");
                self.buffer.extend_from_slice(&chunk[..n]);
            }
        }

        /// Read one full (possibly multi-line) reply, returning the last
        /// line.
        async fn read_reply(&mut self) -> String {
            loop {
                let line = self.read_line().await;
                if line.len() < 4 || line.as_bytes()[3] != b'-' {
                    return line;
                }
            }
        }
    }

    fn spawn_session(backend: Arc<MockBackend>, max_msg_size: usize) -> TestClient {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let settings = Arc::new(SessionSettings::new("relay.test", None, max_msg_size));
        let session = Session::create(
            Connection::plain(server),
            "127.0.0.1:52525".parse().unwrap(),
            "127.0.0.1:25".parse().unwrap(),
            backend,
            settings,
            false,
        );
        tokio::spawn(session.run());
        TestClient {
            stream: client,
            buffer: Vec::new(),
        }
    }

    async fn authed_client(backend: Arc<MockBackend>) -> TestClient {
        let mut client = spawn_session(backend, 1024 * 1024);
        assert!(client.read_reply().await.starts_with("220"));
        client.send("EHLO box.example.com").await;
        assert!(client.read_reply().await.starts_with("250"));
        // base64("\0u\0pw")
        client.send("AUTH PLAIN AHUAcHc=").await;
        assert_eq!(
            client.read_reply().await,
            "235 authentication successful"
        );
        client
    }

    #[tokio::test]
    async fn mail_before_auth_is_rejected_and_nothing_is_recorded() {
        let backend = Arc::new(MockBackend::new(CredentialSettings::default()));
        let mut client = spawn_session(backend.clone(), 1024);

        assert!(client.read_reply().await.starts_with("220"));
        client.send("EHLO box.example.com").await;
        assert!(client.read_reply().await.starts_with("250"));

        client.send("MAIL FROM:<a@ex.com>").await;
        assert!(client.read_reply().await.starts_with("530"));
        client.send("RCPT TO:<b@x.com>").await;
        assert!(client.read_reply().await.starts_with("530"));
        client.send("DATA").await;
        assert!(client.read_reply().await.starts_with("530"));

        client.send("QUIT").await;
        assert!(client.read_reply().await.starts_with("221"));
        assert!(backend.captured.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ehlo_advertises_auth_and_size() {
        let backend = Arc::new(MockBackend::new(CredentialSettings::default()));
        let mut client = spawn_session(backend, 2048);

        assert!(client.read_reply().await.starts_with("220"));
        client.send("EHLO box.example.com").await;

        let mut lines = Vec::new();
        loop {
            let line = client.read_line().await;
            let done = line.len() >= 4 && line.as_bytes()[3] == b' ';
            lines.push(line);
            if done {
                break;
            }
        }
        let all = lines.join("\n");
        assert!(all.contains("SIZE 2048"), "{all}");
        assert!(all.contains("AUTH PLAIN"), "{all}");
        assert!(all.contains("8BITMIME"), "{all}");
        assert!(!all.contains("STARTTLS"), "no TLS material configured: {all}");
    }

    #[tokio::test]
    async fn happy_path_queues_the_dot_stripped_payload() {
        let backend = Arc::new(MockBackend::new(CredentialSettings {
            allowed_domains: vec!["ex.com".to_string()],
            max_recipients: 3,
            ..Default::default()
        }));
        let mut client = authed_client(backend.clone()).await;

        client.send("MAIL FROM:<a@ex.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("RCPT TO:<b@x.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("RCPT TO:<c@x.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("DATA").await;
        assert!(client.read_reply().await.starts_with("354"));

        client.send("Subject: hi\r\n\r\nbody\r\n.").await;
        let reply = client.read_reply().await;
        assert!(reply.starts_with("250 Ok: queued as "), "{reply}");

        let captured = backend.captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].sender, "a@ex.com");
        assert_eq!(captured[0].recipients, vec!["b@x.com", "c@x.com"]);
        assert_eq!(captured[0].payload, b"Subject: hi\r\n\r\nbody");
        assert_eq!(captured[0].payload.len(), 19);
        assert!(!captured[0].oversize);
    }

    #[tokio::test]
    async fn sender_domain_rejection_keeps_session_authed() {
        let backend = Arc::new(MockBackend::new(CredentialSettings {
            allowed_domains: vec!["ex.com".to_string()],
            ..Default::default()
        }));
        let mut client = authed_client(backend.clone()).await;

        client.send("MAIL FROM:<a@other.com>").await;
        assert!(client.read_reply().await.starts_with("550"));

        // no mail-log, and the next transaction is accepted
        assert!(backend.captured.lock().unwrap().is_empty());
        client.send("MAIL FROM:<a@ex.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
    }

    #[tokio::test]
    async fn recipient_cap_refuses_the_overflowing_recipient_only() {
        let backend = Arc::new(MockBackend::new(CredentialSettings {
            max_recipients: 2,
            ..Default::default()
        }));
        let mut client = authed_client(backend.clone()).await;

        client.send("MAIL FROM:<a@ex.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("RCPT TO:<one@x.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("RCPT TO:<two@x.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("RCPT TO:<three@x.com>").await;
        assert!(client.read_reply().await.starts_with("550"));

        // DATA proceeds with the two accepted recipients
        client.send("DATA").await;
        assert!(client.read_reply().await.starts_with("354"));
        client.send("x\r\n.").await;
        assert!(client.read_reply().await.starts_with("250"));

        let captured = backend.captured.lock().unwrap();
        assert_eq!(captured[0].recipients, vec!["one@x.com", "two@x.com"]);
    }

    #[tokio::test]
    async fn quota_rejection_is_permanent_but_session_survives() {
        let backend = Arc::new(MockBackend::new(CredentialSettings::default()));
        backend.queue_accept(Err(Admission::reject_permanent(
            Status::TransactionFailed,
            "daily quota exhausted (1/1)",
        )));
        let mut client = authed_client(backend.clone()).await;

        client.send("MAIL FROM:<a@ex.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("RCPT TO:<b@x.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("DATA").await;
        assert!(client.read_reply().await.starts_with("354"));
        client.send("x\r\n.").await;
        assert!(client.read_reply().await.starts_with("554"));

        // still authenticated
        client.send("MAIL FROM:<a@ex.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
    }

    #[tokio::test]
    async fn auth_without_initial_response_uses_a_challenge() {
        let backend = Arc::new(MockBackend::new(CredentialSettings::default()));
        let mut client = spawn_session(backend, 1024);

        assert!(client.read_reply().await.starts_with("220"));
        client.send("EHLO box.example.com").await;
        assert!(client.read_reply().await.starts_with("250"));

        client.send("AUTH PLAIN").await;
        assert!(client.read_reply().await.starts_with("334"));
        client.send("AHUAcHc=").await;
        assert!(client.read_reply().await.starts_with("235"));
    }

    #[tokio::test]
    async fn bad_password_returns_535_and_leaves_session_usable() {
        let backend = Arc::new(MockBackend::new(CredentialSettings::default()));
        let mut client = spawn_session(backend, 1024);

        assert!(client.read_reply().await.starts_with("220"));
        client.send("EHLO box.example.com").await;
        assert!(client.read_reply().await.starts_with("250"));

        // base64("\0u\0nope")
        client.send("AUTH PLAIN AHUAbm9wZQ==").await;
        assert!(client.read_reply().await.starts_with("535"));

        client.send("AUTH PLAIN AHUAcHc=").await;
        assert!(client.read_reply().await.starts_with("235"));
    }

    #[tokio::test]
    async fn oversized_payload_is_refused_at_end_of_data() {
        let backend = Arc::new(MockBackend::new(CredentialSettings::default()));
        backend.queue_accept(Err(Admission::reject_permanent(
            Status::ExceededStorage,
            "message exceeds maximum size",
        )));
        let mut client = spawn_session(backend.clone(), 64);

        assert!(client.read_reply().await.starts_with("220"));
        client.send("EHLO box.example.com").await;
        assert!(client.read_reply().await.starts_with("250"));
        client.send("AUTH PLAIN AHUAcHc=").await;
        assert!(client.read_reply().await.starts_with("235"));

        client.send("MAIL FROM:<a@ex.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("RCPT TO:<b@x.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("DATA").await;
        assert!(client.read_reply().await.starts_with("354"));

        let big = "z".repeat(256);
        client.send(&format!("{big}\r\n.")).await;
        assert!(client.read_reply().await.starts_with("552"));

        let captured = backend.captured.lock().unwrap();
        assert!(captured[0].oversize);
    }

    #[tokio::test]
    async fn dot_unstuffing_restores_leading_dots() {
        let backend = Arc::new(MockBackend::new(CredentialSettings::default()));
        let mut client = authed_client(backend.clone()).await;

        client.send("MAIL FROM:<a@ex.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("RCPT TO:<b@x.com>").await;
        assert_eq!(client.read_reply().await, "250 Ok");
        client.send("DATA").await;
        assert!(client.read_reply().await.starts_with("354"));

        client.send("line one\r\n..dotted\r\n.").await;
        assert!(client.read_reply().await.starts_with("250"));

        let captured = backend.captured.lock().unwrap();
        assert_eq!(captured[0].payload, b"line one\r\n.dotted");
    }

    #[test]
    fn finalize_payload_strips_terminator() {
        assert_eq!(
            finalize_payload(b"Subject: hi\r\n\r\nbody\r\n.\r\n".to_vec()),
            b"Subject: hi\r\n\r\nbody".to_vec()
        );
        assert_eq!(finalize_payload(b".\r\n".to_vec()), Vec::<u8>::new());
    }
}
