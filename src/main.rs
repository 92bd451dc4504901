use anyhow::{Error, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use webhook_service::{api, clients::rbmq::RabbitMqClient, config::Config, utils};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;

    // A failed first connect aborts startup; workers own reconnection after
    // this point. Connecting also declares the exchange, queues and bindings
    // before any worker starts publishing or consuming.
    let rabbitmq = RabbitMqClient::connect(&config).await?;
    rabbitmq.close().await?;

    info!("Broker topology initialized, starting workers");

    let api_config = config.clone();
    tokio::spawn(async move {
        if let Err(e) = api::run_api_server(api_config).await {
            error!(error = %e, "Health check server failed");
        }
    });

    let mut handles = Vec::new();

    let fanout_config = config.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = utils::run_event_fanout(fanout_config).await {
            error!(error = %e, "Event fan-out worker exited");
        }
    }));

    for worker_id in 0..config.worker_concurrency {
        let worker_config = config.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = utils::run_delivery_worker(worker_config, worker_id).await {
                error!(error = %e, worker_id, "Delivery worker exited");
            }
        }));
    }

    futures_util::future::join_all(handles).await;

    Ok(())
}
