//! Admission backend: the single seam between the protocol state machine
//! and the rest of the system. Authentication, sender-domain policy, the
//! recipient cap, and the size/quota checks at end-of-data all live behind
//! one trait so the session can be exercised without a store or a broker.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Duration as ChronoDuration, Timelike, Utc};
use postrelay_common::models::{SmtpCredential, User};
use postrelay_common::status::Status;
use postrelay_queue::{compute_priority, Broker, MailMessage};
use postrelay_store::{Authenticator, NewMailLog, Store};
use tracing::{error, info, warn};

/// Default per-message recipient cap when the stored value is zero.
pub const DEFAULT_MAX_RECIPIENTS: i64 = 100;

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// 5xx; the command is refused but the session continues.
    RejectPermanent { status: Status, reason: String },
    /// 4xx; the client may retry the same submission later.
    RejectTransient { status: Status, reason: String },
}

impl Admission {
    pub fn reject_permanent(status: Status, reason: impl Into<String>) -> Self {
        Self::RejectPermanent {
            status,
            reason: reason.into(),
        }
    }

    pub fn reject_transient(status: Status, reason: impl Into<String>) -> Self {
        Self::RejectTransient {
            status,
            reason: reason.into(),
        }
    }

    /// The SMTP reply for a rejection; `None` for `Accept`.
    #[must_use]
    pub fn reply(&self) -> Option<(Status, &str)> {
        match self {
            Self::Accept => None,
            Self::RejectPermanent { status, reason } | Self::RejectTransient { status, reason } => {
                Some((*status, reason))
            }
        }
    }
}

/// A complete message at end-of-data, dot-unstuffed, terminator stripped.
#[derive(Debug)]
pub struct IngressMail<'a> {
    pub credential: &'a SmtpCredential,
    pub user: &'a User,
    pub sender: &'a str,
    pub recipients: &'a [String],
    pub payload: &'a [u8],
    /// Set when the client pushed more bytes than the configured cap; the
    /// retained payload is truncated and must be refused.
    pub oversize: bool,
    /// IP of the local socket that accepted the connection.
    pub local_ip: String,
}

#[async_trait]
pub trait RelayBackend: Send + Sync {
    /// Verify an AUTH PLAIN login.
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(SmtpCredential, User), Admission>;

    /// Sender-domain policy at MAIL FROM.
    fn check_sender(&self, credential: &SmtpCredential, sender: Option<&str>) -> Admission;

    /// Recipient cap at RCPT TO; `accepted` includes the recipient under
    /// consideration.
    fn check_recipient(&self, credential: &SmtpCredential, accepted: usize) -> Admission;

    /// Size and quota checks, mail-log insert, and queue hand-off at
    /// end-of-data. Returns the broker-message id on acceptance.
    async fn accept_message(&self, mail: IngressMail<'_>) -> Result<String, Admission>;
}

/// Split an address into its local part and lowercased domain.
fn address_domain(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
}

/// Best-effort Subject extraction from the header region. Folded headers
/// are not unfolded; the first matching line wins.
#[must_use]
pub fn extract_subject(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    for line in text.lines() {
        if line.is_empty() {
            // end of the header region
            break;
        }
        if line.len() >= 8 && line[..8].eq_ignore_ascii_case("subject:") {
            return line[8..].trim().to_string();
        }
    }
    String::new()
}

/// `<unix_ts>-<user_id>-<rand>@<domain>`, unique enough to trace a message
/// across the store, the broker, and the upstream conversation.
#[must_use]
pub fn generate_message_id(user_id: i64, domain: &str) -> String {
    format!(
        "{}-{}-{:08x}@{}",
        Utc::now().timestamp(),
        user_id,
        rand::random::<u32>(),
        domain
    )
}

/// Decode an AUTH PLAIN payload into (authcid, password). The authzid is
/// accepted and ignored.
pub fn decode_plain(payload: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(payload.trim()).ok()?;
    let mut parts = decoded.split(|&b| b == 0);
    let _authzid = parts.next()?;
    let authcid = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let password = String::from_utf8(parts.next()?.to_vec()).ok()?;
    if parts.next().is_some() || authcid.is_empty() {
        return None;
    }
    Some((authcid, password))
}

/// Production backend over the store and the broker.
pub struct CoreBackend {
    authenticator: Authenticator,
    store: Store,
    broker: Arc<Broker>,
    domain: String,
    max_msg_size: usize,
}

impl CoreBackend {
    #[must_use]
    pub fn new(store: Store, broker: Arc<Broker>, domain: String, max_msg_size: usize) -> Self {
        Self {
            authenticator: Authenticator::new(store.clone()),
            store,
            broker,
            domain,
            max_msg_size,
        }
    }

    /// Hourly then daily quota, counted over the mail-log within the
    /// current window. Zero limits mean unlimited.
    async fn check_quota(&self, credential: &SmtpCredential) -> Admission {
        let now = Utc::now();

        if credential.settings.hourly_quota > 0 {
            let hour_start = now
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            match self
                .store
                .count_mail_logs(credential.id, hour_start, hour_start + ChronoDuration::hours(1))
                .await
            {
                Ok(count) if count >= credential.settings.hourly_quota => {
                    return Admission::reject_permanent(
                        Status::TransactionFailed,
                        format!(
                            "hourly quota exhausted ({count}/{})",
                            credential.settings.hourly_quota
                        ),
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "quota check failed");
                    return Admission::reject_transient(
                        Status::ActionUnavailable,
                        "temporary failure, try again later",
                    );
                }
            }
        }

        if credential.settings.daily_quota > 0 {
            let day_start = now
                .with_hour(0)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            match self
                .store
                .count_mail_logs(credential.id, day_start, day_start + ChronoDuration::days(1))
                .await
            {
                Ok(count) if count >= credential.settings.daily_quota => {
                    return Admission::reject_permanent(
                        Status::TransactionFailed,
                        format!(
                            "daily quota exhausted ({count}/{})",
                            credential.settings.daily_quota
                        ),
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "quota check failed");
                    return Admission::reject_transient(
                        Status::ActionUnavailable,
                        "temporary failure, try again later",
                    );
                }
            }
        }

        Admission::Accept
    }
}

#[async_trait]
impl RelayBackend for CoreBackend {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(SmtpCredential, User), Admission> {
        match self.authenticator.authenticate(username, password).await {
            Ok(pair) => {
                info!(username, "authentication succeeded");
                Ok(pair)
            }
            Err(err) if err.is_transient() => {
                warn!(username, %err, "authentication unavailable");
                Err(Admission::reject_transient(
                    Status::ActionUnavailable,
                    "temporary authentication failure",
                ))
            }
            Err(err) => {
                warn!(username, %err, "authentication refused");
                Err(Admission::reject_permanent(
                    Status::AuthFailed,
                    "authentication credentials invalid",
                ))
            }
        }
    }

    fn check_sender(&self, credential: &SmtpCredential, sender: Option<&str>) -> Admission {
        let allowed = &credential.settings.allowed_domains;
        if allowed.is_empty() {
            return Admission::Accept;
        }

        let Some(domain) = sender.and_then(address_domain) else {
            return Admission::reject_permanent(
                Status::Error,
                "sender address not permitted for this credential",
            );
        };

        if allowed.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
            Admission::Accept
        } else {
            Admission::reject_permanent(
                Status::Error,
                format!("sender domain {domain} not permitted for this credential"),
            )
        }
    }

    fn check_recipient(&self, credential: &SmtpCredential, accepted: usize) -> Admission {
        let cap = match credential.settings.max_recipients {
            0 => DEFAULT_MAX_RECIPIENTS,
            cap => cap,
        };

        if accepted as i64 > cap {
            Admission::reject_permanent(
                Status::Error,
                format!("too many recipients (maximum {cap})"),
            )
        } else {
            Admission::Accept
        }
    }

    async fn accept_message(&self, mail: IngressMail<'_>) -> Result<String, Admission> {
        if mail.oversize || mail.payload.len() > self.max_msg_size {
            return Err(Admission::reject_permanent(
                Status::ExceededStorage,
                format!("message exceeds maximum size of {} bytes", self.max_msg_size),
            ));
        }

        match self.check_quota(mail.credential).await {
            Admission::Accept => {}
            rejection => return Err(rejection),
        }

        let subject = extract_subject(mail.payload);
        let message_id = generate_message_id(mail.user.id, &self.domain);

        let record = NewMailLog {
            user_id: mail.user.id,
            credential_id: mail.credential.id,
            message_id: message_id.clone(),
            from: mail.sender.to_string(),
            to: mail.recipients.to_vec(),
            subject: subject.clone(),
            size: mail.payload.len() as i64,
            relay_ip: mail.local_ip,
        };

        let mail_log_id = match self.store.insert_mail_log(&record).await {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "failed to record accepted message");
                return Err(Admission::reject_transient(
                    Status::ActionUnavailable,
                    "temporary storage failure",
                ));
            }
        };

        let message = MailMessage {
            mail_log_id,
            from: record.from,
            to: record.to,
            subject,
            body: mail.payload.to_vec(),
            priority: compute_priority(record.size, mail.recipients.len()),
            created_at: Utc::now(),
        };

        // The mail-log is intentionally not rolled back on publish failure:
        // it stays `queued` and a store-level reaper can recover it.
        if let Err(err) = self.broker.publish(&message, &message_id).await {
            error!(mail_log_id, %err, "failed to enqueue accepted message");
            return Err(Admission::reject_transient(
                Status::ActionUnavailable,
                "queue unavailable, try again later",
            ));
        }

        info!(mail_log_id, %message_id, "message queued");
        Ok(message_id)
    }
}
