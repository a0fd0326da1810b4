//! Domain entities shared by the ingress server, the queue adapter, and the
//! delivery workers. The store owns every persisted entity; the types here
//! are the in-memory views the pipeline passes around.

use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

macro_rules! status_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
                fmt.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_enum!(UserStatus, "user status", {
    Active => "active",
    Suspended => "suspended",
    Deleted => "deleted",
});

status_enum!(CredentialStatus, "credential status", {
    Active => "active",
    Disabled => "disabled",
    Deleted => "deleted",
});

status_enum!(MailStatus, "mail status", {
    Queued => "queued",
    Sending => "sending",
    Sent => "sent",
    Failed => "failed",
});

impl MailStatus {
    /// Terminal states have no outgoing transition.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

/// Owner of credentials. Created by the admin surface; the relay core only
/// reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub status: UserStatus,
    pub daily_quota: i64,
    pub hourly_quota: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-credential admission settings. Zero means "use the default" for the
/// recipient cap and "unlimited" for the quotas; an empty domain list allows
/// any sender domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialSettings {
    pub daily_quota: i64,
    pub hourly_quota: i64,
    pub allowed_domains: Vec<String>,
    pub max_recipients: i64,
}

/// One authenticatable SMTP identity bound to a user.
///
/// The SMTP username is globally unique among non-deleted credentials; the
/// plaintext password exists only at creation time and is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpCredential {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub description: String,
    pub status: CredentialStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub settings: CredentialSettings,
}

/// One record per accepted message; the message's system of record from
/// ingress to final disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailLog {
    pub id: i64,
    pub user_id: i64,
    pub credential_id: i64,
    pub message_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub size: i64,
    pub status: MailStatus,
    pub attempts: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub relay_ip: String,
}

/// An upstream smart-host the delivery workers dial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayHost {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub tls: bool,
    pub active: bool,
    pub priority: i64,
}

impl RelayHost {
    /// `host:port` for dialing.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Relay entries carry optional upstream credentials; both halves must
    /// be present for AUTH to be attempted.
    #[must_use]
    pub fn auth(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }
}
