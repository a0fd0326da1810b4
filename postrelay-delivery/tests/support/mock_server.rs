//! Mock upstream SMTP server for delivery tests.
//!
//! Serves a single scripted conversation: configurable replies per command,
//! captured commands and message content for verification.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockResponses {
    pub greeting: String,
    pub ehlo: Vec<String>,
    pub auth: String,
    pub mail_from: String,
    pub rcpt_to: String,
    pub data: String,
    pub data_end: String,
}

impl Default for MockResponses {
    fn default() -> Self {
        Self {
            greeting: "220 mock.upstream ESMTP".to_string(),
            ehlo: vec![
                "250-mock.upstream".to_string(),
                "250-SIZE 26214400".to_string(),
                "250-AUTH PLAIN".to_string(),
                "250 8BITMIME".to_string(),
            ],
            auth: "235 2.7.0 accepted".to_string(),
            mail_from: "250 sender ok".to_string(),
            rcpt_to: "250 recipient ok".to_string(),
            data: "354 go ahead".to_string(),
            data_end: "250 message accepted".to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub commands: Vec<String>,
    pub message: Vec<u8>,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
    handle: JoinHandle<()>,
}

impl MockSmtpServer {
    pub async fn start(responses: MockResponses) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let task_recorded = Arc::clone(&recorded);
        let handle = tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let _ = serve_one(stream, responses, task_recorded).await;
            }
        });

        Self {
            addr,
            recorded,
            handle,
        }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn recorded(&self) -> Recorded {
        let guard = self.recorded.lock().unwrap();
        Recorded {
            commands: guard.commands.clone(),
            message: guard.message.clone(),
        }
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn serve_one(
    stream: TcpStream,
    responses: MockResponses,
    recorded: Arc<Mutex<Recorded>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(format!("{}\r\n", responses.greeting).as_bytes())
        .await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        recorded.lock().unwrap().commands.push(command.clone());

        let upper = command.to_ascii_uppercase();
        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            for reply in &responses.ehlo {
                write_half.write_all(format!("{reply}\r\n").as_bytes()).await?;
            }
        } else if upper.starts_with("AUTH") {
            write_half
                .write_all(format!("{}\r\n", responses.auth).as_bytes())
                .await?;
        } else if upper.starts_with("MAIL FROM") {
            write_half
                .write_all(format!("{}\r\n", responses.mail_from).as_bytes())
                .await?;
        } else if upper.starts_with("RCPT TO") {
            write_half
                .write_all(format!("{}\r\n", responses.rcpt_to).as_bytes())
                .await?;
        } else if upper == "DATA" {
            write_half
                .write_all(format!("{}\r\n", responses.data).as_bytes())
                .await?;

            // consume message content until the lone dot
            let mut content = Vec::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" || line == ".\n" {
                    break;
                }
                content.extend_from_slice(line.as_bytes());
            }
            recorded.lock().unwrap().message = content;

            write_half
                .write_all(format!("{}\r\n", responses.data_end).as_bytes())
                .await?;
        } else if upper == "QUIT" {
            write_half.write_all(b"221 bye\r\n").await?;
            return Ok(());
        } else {
            write_half.write_all(b"500 unrecognized\r\n").await?;
        }
    }
}
