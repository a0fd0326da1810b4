use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MIB: i64 = 1024 * 1024;

/// The transport envelope published to the broker. Not persisted in the
/// store; the mail-log id ties it back to the system of record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub mail_log_id: i64,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: Vec<u8>,
    /// 0-9, computed at enqueue time; 9 is most urgent.
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

/// Priority of a message from its size and fan-out, clamped to the broker's
/// 0-9 range. Small single-recipient mail jumps the line; bulky fan-out
/// mail yields.
#[must_use]
pub fn compute_priority(size: i64, recipients: usize) -> u8 {
    let mut priority: i64 = 5;

    if size < MIB {
        priority += 1;
    } else if size > 10 * MIB {
        priority -= 1;
    }

    if recipients == 1 {
        priority += 1;
    } else if recipients > 10 {
        priority -= 1;
    }

    priority.clamp(0, 9) as u8
}
