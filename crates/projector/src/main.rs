use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use readmodel_infra::config::ProjectorConfig;
use readmodel_infra::event_bus::RedisStreamsTransport;
use readmodel_infra::projections::UsersProjection;
use readmodel_infra::read_model::PostgresUserStore;
use readmodel_infra::workers::{ProjectionSupervisor, SupervisorExit};

#[tokio::main]
async fn main() -> ExitCode {
    readmodel_observability::init();

    match run().await {
        Ok(SupervisorExit::Shutdown) => {
            info!("projector stopped");
            ExitCode::SUCCESS
        }
        Ok(SupervisorExit::TransportClosed(closed)) => {
            error!(reason = closed.reason(), "event transport closed permanently");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "projector failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<SupervisorExit> {
    let config = ProjectorConfig::from_env().context("loading configuration")?;
    info!(
        service = %config.service_name,
        collection = %config.collection,
        consumer = %config.consumer_name,
        lanes = config.lanes,
        "starting users projector"
    );

    let store = PostgresUserStore::connect(
        &config.database_url,
        config.collection.clone(),
        config.database_connection_timeout,
    )
    .await
    .context("connecting to the read model database")?;
    store
        .ensure_collection()
        .await
        .context("preparing the read model collection")?;

    let projection = UsersProjection::builder()
        .store(store)
        .end_of_stream(config.end_of_stream.as_str())
        .build()
        .context("building the users projection")?;

    let stream = RedisStreamsTransport::new(&config.redis_url, config.redis_streams_config())
        .context("configuring the event stream")?;
    info!(stream_key = stream.stream_key(), group = %config.consumer_group, "subscribing");
    // Group creation is a blocking round-trip.
    let (transport, _poller) = tokio::task::spawn_blocking(move || stream.spawn())
        .await
        .context("subscribing to the event stream")?
        .context("subscribing to the event stream")?;

    let supervisor = ProjectionSupervisor::new(Arc::new(projection), config.supervisor_config());
    let exit = supervisor.run(transport, shutdown_signal()).await;
    info!(stats = ?supervisor.stats(), "supervisor exited");

    Ok(exit)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
