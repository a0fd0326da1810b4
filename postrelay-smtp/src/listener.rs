use std::net::SocketAddr;
use std::sync::Arc;

use postrelay_common::Signal;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backend::RelayBackend;
use crate::connection::Connection;
use crate::session::{Session, SessionSettings};

/// Transport behavior at accept time. All three listeners expose identical
/// command handling; only the initial transport differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Cleartext; STARTTLS offered when material is configured.
    Opportunistic,
    /// TLS handshake immediately after accept (the smtps port). Without
    /// configured material this degrades to cleartext with a warning.
    Implicit,
}

pub struct Listener {
    socket: SocketAddr,
    mode: TlsMode,
    settings: Arc<SessionSettings>,
    backend: Arc<dyn RelayBackend>,
}

impl Listener {
    #[must_use]
    pub fn new(
        socket: SocketAddr,
        mode: TlsMode,
        settings: Arc<SessionSettings>,
        backend: Arc<dyn RelayBackend>,
    ) -> Self {
        Self {
            socket,
            mode,
            settings,
            backend,
        }
    }

    /// Accept connections until shutdown, one task per session. On
    /// shutdown the listener stops accepting and waits for in-flight
    /// sessions to finish their conversation or hit the idle timeout.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.socket).await?;
        info!(socket = %self.socket, mode = ?self.mode, "SMTP listener up");

        if self.mode == TlsMode::Implicit && self.settings.tls.is_none() {
            warn!(
                socket = %self.socket,
                "no TLS material configured, implicit-TLS port serving cleartext"
            );
        }

        let mut sessions = Vec::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        info!(socket = %self.socket, "listener draining sessions");
                        futures_util::future::join_all(sessions).await;
                        return Ok(());
                    }
                }

                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let local = stream.local_addr().unwrap_or(self.socket);
                    debug!(%peer, socket = %self.socket, "connection accepted");

                    let mode = self.mode;
                    let settings = Arc::clone(&self.settings);
                    let backend = Arc::clone(&self.backend);

                    sessions.push(tokio::spawn(async move {
                        let result = match (mode, settings.tls.clone()) {
                            (TlsMode::Implicit, Some(tls)) => {
                                match Connection::accept_implicit(stream, &tls).await {
                                    Ok(connection) => {
                                        Session::create(connection, peer, local, backend, settings, true)
                                            .run()
                                            .await
                                    }
                                    Err(err) => {
                                        warn!(%peer, %err, "implicit TLS handshake failed");
                                        return;
                                    }
                                }
                            }
                            _ => {
                                Session::create(
                                    Connection::plain(stream),
                                    peer,
                                    local,
                                    backend,
                                    settings,
                                    false,
                                )
                                .run()
                                .await
                            }
                        };

                        if let Err(err) = result {
                            if err.is_shutdown() {
                                debug!(%peer, "session ended by shutdown");
                            } else {
                                error!(%peer, %err, "session error");
                            }
                        }
                    }));

                    // drop handles of sessions that already finished
                    sessions.retain(|handle| !handle.is_finished());
                }
            }
        }
    }
}
