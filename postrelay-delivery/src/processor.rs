//! The delivery worker pool and the per-message delivery routine.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use postrelay_common::config::DeliveryConfig;
use postrelay_common::models::{MailStatus, RelayHost};
use postrelay_common::Signal;
use postrelay_queue::{Broker, ConsumeError, MailMessage};
use postrelay_store::{MailLogPatch, Store};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::classify::{classify_failure, FailureKind};
use crate::client::SmtpClient;
use crate::headers;
use crate::relay_pool::RelayPool;

/// Dial attempts per queue delivery. Independent of the broker-level retry
/// budget; a transiently failing message burns through these with short
/// sleeps before it is handed back for delay-queue parking.
const MAX_DIAL_ATTEMPTS: i64 = 3;

const ERROR_TRUNCATE: usize = 500;

fn truncated(error: &str) -> String {
    if error.len() <= ERROR_TRUNCATE {
        error.to_string()
    } else {
        let mut cut = ERROR_TRUNCATE;
        while !error.is_char_boundary(cut) {
            cut -= 1;
        }
        error[..cut].to_string()
    }
}

pub struct DeliveryProcessor {
    store: Store,
    broker: Arc<Broker>,
    pool: Arc<RelayPool>,
    config: DeliveryConfig,
    helo_domain: String,
    /// Upstream certificate validation is relaxed because relay entries
    /// carry no trust chain of their own; every relaxed handshake is
    /// logged.
    accept_invalid_certs: bool,
}

impl DeliveryProcessor {
    #[must_use]
    pub fn new(
        store: Store,
        broker: Arc<Broker>,
        pool: Arc<RelayPool>,
        config: DeliveryConfig,
        helo_domain: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            pool,
            config,
            helo_domain,
            accept_invalid_certs: true,
        })
    }

    /// Spawn the worker pool. Each worker holds one consumer on the main
    /// queue; a panic inside the routine is contained and treated as a
    /// poison message so it cannot loop forever.
    #[must_use]
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<Signal>) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|worker_id| {
                let processor = Arc::clone(self);
                let broker = Arc::clone(&self.broker);
                let shutdown = shutdown.subscribe();

                tokio::spawn(async move {
                    let tag = format!("postrelay-worker-{worker_id}");
                    let consume = broker.consume(&tag, shutdown, |message| {
                        let processor = Arc::clone(&processor);
                        async move {
                            let mail_log_id = message.mail_log_id;
                            match std::panic::AssertUnwindSafe(processor.process_message(message))
                                .catch_unwind()
                                .await
                            {
                                Ok(outcome) => outcome,
                                Err(_) => {
                                    error!(mail_log_id, "delivery routine panicked");
                                    Err(ConsumeError::Poison(
                                        "panic in delivery routine".to_string(),
                                    ))
                                }
                            }
                        }
                    });

                    if let Err(err) = consume.await {
                        error!(worker_id, %err, "delivery consumer failed");
                    }
                })
            })
            .collect()
    }

    /// Deliver one queued message and reconcile its mail-log.
    async fn process_message(&self, message: MailMessage) -> Result<(), ConsumeError> {
        let mail_log_id = message.mail_log_id;
        info!(mail_log_id, recipients = message.to.len(), "delivering");

        // queued -> sending; attempts are untouched here and bumped once
        // per dial attempt below
        self.store
            .update_mail_log(
                mail_log_id,
                &MailLogPatch {
                    status: Some(MailStatus::Sending),
                    last_attempt: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| ConsumeError::Transient(format!("store unavailable: {err}")))?;

        let Some(relay) = self.pool.first_active().await else {
            let reason = "no relay available";
            error!(mail_log_id, reason);
            self.reconcile_failed(mail_log_id, None, reason).await;
            return Err(ConsumeError::Permanent(reason.to_string()));
        };

        let mut last_error = String::new();
        let mut last_kind = FailureKind::Permanent;

        for attempt in 1..=MAX_DIAL_ATTEMPTS {
            if let Err(err) = self
                .store
                .update_mail_log(
                    mail_log_id,
                    &MailLogPatch {
                        attempts: Some(attempt),
                        last_attempt: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(mail_log_id, %err, "failed to persist attempt count");
            }

            match deliver_once(
                &relay,
                &message,
                &self.helo_domain,
                self.config.process_timeout,
                self.accept_invalid_certs,
            )
            .await
            {
                Ok(()) => {
                    self.store
                        .update_mail_log(
                            mail_log_id,
                            &MailLogPatch {
                                status: Some(MailStatus::Sent),
                                attempts: Some(attempt),
                                last_attempt: Some(Utc::now()),
                                completed_at: Some(Utc::now()),
                                ..Default::default()
                            },
                        )
                        .await
                        .map_err(|err| {
                            ConsumeError::Transient(format!("store unavailable: {err}"))
                        })?;
                    info!(mail_log_id, attempt, relay = %relay.name, "delivered");
                    return Ok(());
                }
                Err(err) => {
                    last_kind = classify_failure(&err);
                    warn!(mail_log_id, attempt, kind = ?last_kind, error = %err, "attempt failed");
                    last_error = err;

                    if last_kind == FailureKind::Transient && attempt < MAX_DIAL_ATTEMPTS {
                        let delay = self.config.retry_interval * attempt as u32;
                        sleep(delay).await;
                        continue;
                    }
                    break;
                }
            }
        }

        error!(mail_log_id, error = %last_error, "delivery failed");
        self.reconcile_failed(mail_log_id, None, &last_error).await;

        match last_kind {
            FailureKind::Transient => Err(ConsumeError::Transient(last_error)),
            FailureKind::Permanent => Err(ConsumeError::Permanent(last_error)),
        }
    }

    async fn reconcile_failed(&self, mail_log_id: i64, attempts: Option<i64>, reason: &str) {
        let patch = MailLogPatch {
            status: Some(MailStatus::Failed),
            attempts,
            last_attempt: Some(Utc::now()),
            error_message: Some(truncated(reason)),
            ..Default::default()
        };
        if let Err(err) = self.store.update_mail_log(mail_log_id, &patch).await {
            error!(mail_log_id, %err, "failed to record delivery failure");
        }
    }
}

async fn step<T, F>(deadline: Duration, what: &str, fut: F) -> Result<T, String>
where
    F: std::future::Future<Output = crate::client::Result<T>>,
{
    match timeout(deadline, fut).await {
        Err(_) => Err(format!(
            "{what}: connection timeout after {}s",
            deadline.as_secs()
        )),
        Ok(Err(err)) => Err(format!("{what}: {err}")),
        Ok(Ok(value)) => Ok(value),
    }
}

/// One complete outbound SMTP conversation for one message. Every exchange
/// is bounded by `command_timeout`; the error string feeds the
/// transient/permanent classifier.
///
/// # Errors
/// Returns a description of the first failing exchange.
pub async fn deliver_once(
    relay: &RelayHost,
    message: &MailMessage,
    helo_domain: &str,
    command_timeout: Duration,
    accept_invalid_certs: bool,
) -> Result<(), String> {
    let client = step(
        command_timeout,
        "connect",
        SmtpClient::connect(&relay.address(), relay.host.clone()),
    )
    .await?;
    let mut client = client.accept_invalid_certs(accept_invalid_certs);

    let greeting = step(command_timeout, "greeting", client.read_greeting()).await?;
    if !greeting.is_success() {
        return Err(format!(
            "greeting rejected: {} {}",
            greeting.code,
            greeting.message()
        ));
    }

    let ehlo = step(command_timeout, "EHLO", client.ehlo(helo_domain)).await?;
    if !ehlo.is_success() {
        return Err(format!("EHLO rejected: {} {}", ehlo.code, ehlo.message()));
    }

    if relay.tls && ehlo.has_capability("STARTTLS") {
        if accept_invalid_certs {
            warn!(relay = %relay.name, "upstream TLS without certificate validation");
        }
        let response = step(command_timeout, "STARTTLS", client.starttls()).await?;
        if !response.is_success() {
            return Err(format!(
                "STARTTLS rejected: {} {}",
                response.code,
                response.message()
            ));
        }

        // RFC 3207 requires a fresh EHLO on the secured channel
        let response = step(command_timeout, "EHLO", client.ehlo(helo_domain)).await?;
        if !response.is_success() {
            return Err(format!(
                "EHLO after STARTTLS rejected: {} {}",
                response.code,
                response.message()
            ));
        }
    }

    if let Some((username, password)) = relay.auth() {
        let response = step(
            command_timeout,
            "AUTH",
            client.auth_plain(username, password),
        )
        .await?;
        if !response.is_success() {
            return Err(format!(
                "authentication rejected: {} {}",
                response.code,
                response.message()
            ));
        }
    }

    let response = step(command_timeout, "MAIL FROM", client.mail_from(&message.from)).await?;
    if !response.is_success() {
        return Err(format!(
            "sender rejected: {} {}",
            response.code,
            response.message()
        ));
    }

    for recipient in &message.to {
        let response = step(command_timeout, "RCPT TO", client.rcpt_to(recipient)).await?;
        if !response.is_success() {
            return Err(format!(
                "recipient {recipient} rejected: {} {}",
                response.code,
                response.message()
            ));
        }
    }

    let response = step(command_timeout, "DATA", client.data()).await?;
    if !response.is_intermediate() {
        return Err(format!(
            "DATA rejected: {} {}",
            response.code,
            response.message()
        ));
    }

    let wire = headers::assemble(message);
    let response = step(
        command_timeout,
        "message transmission",
        client.send_payload(&wire),
    )
    .await?;
    if !response.is_success() {
        return Err(format!(
            "message rejected: {} {}",
            response.code,
            response.message()
        ));
    }

    // delivery already succeeded; a QUIT failure is not worth reporting
    let _ = timeout(command_timeout, client.quit()).await;

    Ok(())
}
