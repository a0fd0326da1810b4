//! Header synthesis for outbound delivery.
//!
//! The worker prepends a full header block in front of the payload, even
//! when the payload already carries headers of its own. Downstream filters
//! rely on the relay's stamped headers being present, so the block is
//! always synthesized rather than passed through.

use chrono::Utc;
use postrelay_queue::MailMessage;

/// Build the synthesized header block, terminated by the blank separator
/// line.
#[must_use]
pub fn synthesized_headers(message: &MailMessage) -> String {
    let now = Utc::now();
    let mut headers = String::new();

    headers.push_str(&format!("From: {}\r\n", message.from));
    headers.push_str(&format!("To: {}\r\n", message.to.join(", ")));
    headers.push_str(&format!("Subject: {}\r\n", message.subject));
    headers.push_str(&format!(
        "Date: {}\r\n",
        now.format("%a, %d %b %Y %H:%M:%S %z")
    ));
    headers.push_str("MIME-Version: 1.0\r\n");
    headers.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    headers.push_str("Content-Transfer-Encoding: 8bit\r\n");
    headers.push_str(&format!("Message-ID: <{}>\r\n", message.mail_log_id));
    headers.push_str("X-Mailer: SMTP-Relay-Service\r\n");
    headers.push_str(&format!("X-Relay-Time: {}\r\n", now.to_rfc3339()));
    headers.push_str("\r\n");

    headers
}

/// The full wire payload: synthesized headers followed by the received
/// bytes verbatim.
#[must_use]
pub fn assemble(message: &MailMessage) -> Vec<u8> {
    let headers = synthesized_headers(message);
    let mut out = Vec::with_capacity(headers.len() + message.body.len());
    out.extend_from_slice(headers.as_bytes());
    out.extend_from_slice(&message.body);
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn sample() -> MailMessage {
        MailMessage {
            mail_log_id: 99,
            from: "a@ex.com".into(),
            to: vec!["b@x.com".into(), "c@x.com".into()],
            subject: "hi".into(),
            body: b"Subject: hi\r\n\r\nbody".to_vec(),
            priority: 5,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn header_block_carries_the_envelope() {
        let headers = synthesized_headers(&sample());
        assert!(headers.starts_with("From: a@ex.com\r\n"));
        assert!(headers.contains("To: b@x.com, c@x.com\r\n"));
        assert!(headers.contains("Subject: hi\r\n"));
        assert!(headers.contains("Message-ID: <99>\r\n"));
        assert!(headers.contains("X-Mailer: SMTP-Relay-Service\r\n"));
        assert!(headers.contains("MIME-Version: 1.0\r\n"));
        assert!(headers.ends_with("\r\n\r\n"));
    }

    #[test]
    fn assemble_prepends_headers_even_when_payload_has_its_own() {
        let message = sample();
        let wire = assemble(&message);

        // the payload bytes are appended verbatim after the blank line
        let blank = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        assert_eq!(&wire[blank + 4..], message.body.as_slice());

        // the synthesized block is always present, so the duplicate
        // Subject from the payload survives as part of the body
        let text = String::from_utf8_lossy(&wire);
        assert_eq!(text.matches("Subject: hi").count(), 2);
    }

    #[test]
    fn date_is_rfc1123z_shaped() {
        let headers = synthesized_headers(&sample());
        let date = headers
            .lines()
            .find_map(|l| l.strip_prefix("Date: "))
            .unwrap();
        // e.g. "Sat, 02 Aug 2025 10:12:33 +0000"
        assert!(chrono::DateTime::parse_from_str(date, "%a, %d %b %Y %H:%M:%S %z").is_ok());
    }
}
