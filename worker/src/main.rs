mod cancel;
mod dispatcher;
mod query;
mod send;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatcher::{Dispatcher, Disposition};
use queue::WorkQueue;
use sifen_ws::client::{SifenEndpoints, SoapClient};
use store::PgStore;

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sqlx=warn".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = config::load().context("loading configuration")?;
    cfg.validate()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connecting to Postgres")?;

    let work_queue = Arc::new(WorkQueue::new(
        pool.clone(),
        Duration::from_millis(cfg.queue.query_delay_ms),
        Duration::from_millis(cfg.queue.visibility_timeout_ms),
    ));
    work_queue.declare().await.context("declaring queue tables")?;

    let client = SoapClient::new(
        SifenEndpoints {
            batch_submit_url: cfg.sifen.recebe_lote.clone(),
            batch_query_url: cfg.sifen.consulta_lote.clone(),
            event_url: cfg.sifen.evento.clone(),
        },
        Duration::from_millis(cfg.request_timeout_ms),
    );
    let store = Arc::new(PgStore::new(pool));

    let dispatcher = Dispatcher::new(store, client, work_queue.clone(), cfg.sifen.qr_base.clone());
    let poll_interval = Duration::from_millis(cfg.queue.poll_interval_ms);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    tracing::info!("worker started, waiting for jobs");
    run(&work_queue, &dispatcher, poll_interval, &shutdown).await;
    tracing::info!("worker stopped");
    Ok(())
}

/// Claim loop. The shutdown flag is only checked between items, so an
/// in-flight dispatch always completes and reaches its disposition.
async fn run(
    work_queue: &WorkQueue,
    dispatcher: &Dispatcher,
    poll_interval: Duration,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let delivery = match work_queue.claim().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tokio::time::sleep(poll_interval).await;
                continue;
            }
            Err(err) => {
                tracing::error!(error = %err, "claim failed");
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        let result = match dispatcher.dispatch(&delivery.body).await {
            Disposition::Ack => work_queue.ack(&delivery).await,
            Disposition::Requeue => work_queue.requeue(&delivery).await,
            Disposition::Reject(reason) => work_queue.reject(&delivery, &reason).await,
        };
        // A failed disposition leaves the claim to expire via the
        // visibility timeout.
        if let Err(err) = result {
            tracing::error!(job_id = %delivery.id, error = %err, "disposition failed");
        }
    }
}
