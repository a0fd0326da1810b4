//! Relay entry point: configuration, store and broker bring-up, the three
//! SMTP listeners, the delivery worker pool, and coordinated shutdown.

use std::sync::Arc;

use postrelay_common::config::Config;
use postrelay_common::{logging, Signal};
use postrelay_delivery::{DeliveryProcessor, RelayPool};
use postrelay_queue::Broker;
use postrelay_smtp::{CoreBackend, SmtpServer};
use postrelay_store::Store;
use tokio::sync::broadcast;
use tracing::{error, info};

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = terminate.recv() => {
            info!("terminate signal received, shutting down");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Config::from_env();
    info!(
        domain = %config.smtp.domain,
        workers = config.delivery.worker_count,
        "starting postrelay"
    );

    let store = Store::connect(&config.database_url).await?;
    let broker = Arc::new(Broker::connect(&config.broker).await?);

    let (shutdown, _) = broadcast::channel::<Signal>(16);

    // relay pool: seeded immediately, refreshed every five minutes
    let pool = RelayPool::new(store.clone());
    if let Err(err) = pool.refresh().await {
        error!(%err, "initial relay pool load failed");
    }
    let refresher = pool.spawn_refresher(shutdown.subscribe());

    // delivery worker pool
    let processor = DeliveryProcessor::new(
        store.clone(),
        Arc::clone(&broker),
        Arc::clone(&pool),
        config.delivery.clone(),
        config.smtp.domain.clone(),
    );
    let workers = processor.start(&shutdown);

    // ingress listeners
    let backend = Arc::new(CoreBackend::new(
        store,
        Arc::clone(&broker),
        config.smtp.domain.clone(),
        config.smtp.max_msg_size,
    ));
    let server = SmtpServer::new(&config.smtp, backend)?;

    let serve = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(shutdown).await })
    };

    shutdown_signal().await?;
    let _ = shutdown.send(Signal::Shutdown);

    // listeners drain their sessions, workers cancel their consumers
    let _ = serve.await;
    for worker in workers {
        let _ = worker.await;
    }
    let _ = refresher.await;

    if let Err(err) = broker.close().await {
        error!(%err, "broker close failed");
    }

    info!("postrelay stopped");
    Ok(())
}
