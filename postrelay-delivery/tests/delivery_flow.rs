//! Delivery conversation tests against a scripted upstream.

mod support;

use std::time::Duration;

use chrono::Utc;
use postrelay_common::models::RelayHost;
use postrelay_delivery::{classify_failure, deliver_once, FailureKind};
use postrelay_queue::MailMessage;
use support::mock_server::{MockResponses, MockSmtpServer};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

fn relay_for(server: &MockSmtpServer, username: Option<&str>, password: Option<&str>) -> RelayHost {
    RelayHost {
        id: 1,
        name: "mock".to_string(),
        host: server.host(),
        port: server.port(),
        username: username.map(str::to_string),
        password: password.map(str::to_string),
        tls: false,
        active: true,
        priority: 1,
    }
}

fn message() -> MailMessage {
    MailMessage {
        mail_log_id: 11,
        from: "a@ex.com".to_string(),
        to: vec!["b@x.com".to_string(), "c@x.com".to_string()],
        subject: "hi".to_string(),
        body: b"Subject: hi\r\n\r\nbody".to_vec(),
        priority: 6,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn happy_path_delivers_headers_then_payload_verbatim() {
    let server = MockSmtpServer::start(MockResponses::default()).await;
    let relay = relay_for(&server, None, None);

    deliver_once(&relay, &message(), "relay.test", COMMAND_TIMEOUT, true)
        .await
        .expect("delivery should succeed");

    let recorded = server.recorded();
    assert!(recorded
        .commands
        .iter()
        .any(|c| c.eq_ignore_ascii_case("EHLO relay.test")));
    assert!(recorded.commands.contains(&"MAIL FROM:<a@ex.com>".to_string()));
    assert!(recorded.commands.contains(&"RCPT TO:<b@x.com>".to_string()));
    assert!(recorded.commands.contains(&"RCPT TO:<c@x.com>".to_string()));
    assert!(recorded.commands.contains(&"QUIT".to_string()));
    // no AUTH without configured relay credentials
    assert!(!recorded.commands.iter().any(|c| c.starts_with("AUTH")));

    // the synthesized block comes first, then the received bytes verbatim
    let wire = recorded.message;
    let text = String::from_utf8_lossy(&wire);
    assert!(text.starts_with("From: a@ex.com\r\n"), "{text}");
    assert!(text.contains("To: b@x.com, c@x.com\r\n"));
    assert!(text.contains("X-Mailer: SMTP-Relay-Service\r\n"));

    let separator = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    let body = &wire[separator + 4..];
    assert_eq!(body, b"Subject: hi\r\n\r\nbody\r\n");

    server.shutdown();
}

#[tokio::test]
async fn upstream_auth_is_issued_when_relay_has_credentials() {
    let server = MockSmtpServer::start(MockResponses::default()).await;
    let relay = relay_for(&server, Some("relay-user"), Some("relay-pass"));

    deliver_once(&relay, &message(), "relay.test", COMMAND_TIMEOUT, true)
        .await
        .expect("delivery should succeed");

    let recorded = server.recorded();
    let auth = recorded
        .commands
        .iter()
        .find(|c| c.starts_with("AUTH PLAIN "))
        .expect("AUTH PLAIN command");
    // base64("\0relay-user\0relay-pass")
    assert_eq!(auth, "AUTH PLAIN AHJlbGF5LXVzZXIAcmVsYXktcGFzcw==");

    server.shutdown();
}

#[tokio::test]
async fn transient_greeting_is_classified_for_retry() {
    let server = MockSmtpServer::start(MockResponses {
        greeting: "421 try again later".to_string(),
        ..Default::default()
    })
    .await;
    let relay = relay_for(&server, None, None);

    let err = deliver_once(&relay, &message(), "relay.test", COMMAND_TIMEOUT, true)
        .await
        .expect_err("greeting is a rejection");
    assert!(err.contains("421"), "{err}");
    assert_eq!(classify_failure(&err), FailureKind::Transient);

    server.shutdown();
}

#[tokio::test]
async fn permanent_recipient_rejection_is_not_retried() {
    let server = MockSmtpServer::start(MockResponses {
        rcpt_to: "550 user unknown".to_string(),
        ..Default::default()
    })
    .await;
    let relay = relay_for(&server, None, None);

    let err = deliver_once(&relay, &message(), "relay.test", COMMAND_TIMEOUT, true)
        .await
        .expect_err("recipient is rejected");
    assert!(err.contains("550"), "{err}");
    assert!(err.contains("b@x.com"), "first recipient is named: {err}");
    assert_eq!(classify_failure(&err), FailureKind::Permanent);

    server.shutdown();
}

#[tokio::test]
async fn refused_connection_is_transient() {
    // bind a listener and drop it so the port is closed
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let relay = RelayHost {
        id: 1,
        name: "gone".to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        username: None,
        password: None,
        tls: false,
        active: true,
        priority: 1,
    };

    let err = deliver_once(&relay, &message(), "relay.test", COMMAND_TIMEOUT, true)
        .await
        .expect_err("nothing is listening");
    assert_eq!(classify_failure(&err), FailureKind::Transient, "{err}");
}
