use std::net::SocketAddr;
use std::sync::Arc;

use postrelay_common::config::SmtpConfig;
use postrelay_common::Signal;
use tokio::sync::broadcast;
use tracing::error;

use crate::backend::RelayBackend;
use crate::connection::TlsContext;
use crate::listener::{Listener, TlsMode};
use crate::session::SessionSettings;

/// The ingress server: three listeners bound to the same backend. Port 25
/// and the submission port are cleartext with STARTTLS; the smtps port does
/// an implicit handshake when material is configured.
pub struct SmtpServer {
    listeners: Vec<Listener>,
}

impl SmtpServer {
    /// # Errors
    /// Returns an error if a bind address cannot be parsed.
    pub fn new(config: &SmtpConfig, backend: Arc<dyn RelayBackend>) -> anyhow::Result<Self> {
        let tls = config
            .tls_material()
            .map(|(certificate, key)| TlsContext { certificate, key });

        let settings = Arc::new(SessionSettings::new(
            &config.domain,
            tls,
            config.max_msg_size,
        ));

        let mut listeners = Vec::with_capacity(3);
        for (port, mode) in [
            (config.port_relay, TlsMode::Opportunistic),
            (config.port_submission, TlsMode::Opportunistic),
            (config.port_smtps, TlsMode::Implicit),
        ] {
            let socket: SocketAddr = format!("{}:{port}", config.host).parse()?;
            listeners.push(Listener::new(
                socket,
                mode,
                Arc::clone(&settings),
                Arc::clone(&backend),
            ));
        }

        Ok(Self { listeners })
    }

    /// Serve all listeners until shutdown.
    pub async fn serve(&self, shutdown: broadcast::Sender<Signal>) {
        let results = futures_util::future::join_all(
            self.listeners
                .iter()
                .map(|listener| listener.serve(shutdown.subscribe())),
        )
        .await;

        for result in results {
            if let Err(err) = result {
                error!(%err, "listener failed");
            }
        }
    }
}
