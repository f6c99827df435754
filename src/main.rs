use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::util::SubscriberInitExt;

use meshctl::config::Config;
use meshctl::controller::Controller;
use meshctl::observer::Observer;
use meshctl::signals::Shutdown;

/// CLI overrides layered over the `CLIENT_PORT`/`WORKER_PORT`/`HEALTH_PORT`/
/// `WORKER_TIMEOUT`/`REQUEST_TIMEOUT`/`MAX_PENDING` environment variables.
/// Every flag is optional; an unset flag leaves the corresponding env var
/// (or its default) in effect.
#[derive(Parser, Debug)]
#[clap(author, version, about = "Head controller for a UDP compute cluster", long_about = None)]
struct Args {
    /// Override CLIENT_PORT
    #[clap(long)]
    client_port: Option<u16>,
    /// Override WORKER_PORT
    #[clap(long)]
    worker_port: Option<u16>,
    /// Override HEALTH_PORT
    #[clap(long)]
    health_port: Option<u16>,
    /// Override MAX_PENDING
    #[clap(long)]
    max_pending: Option<usize>,
}

fn apply_overrides(mut config: Config, args: &Args) -> Config {
    if let Some(port) = args.client_port {
        config.client_port = port;
    }
    if let Some(port) = args.worker_port {
        config.worker_port = port;
    }
    if let Some(port) = args.health_port {
        config.health_port = port;
    }
    if let Some(max_pending) = args.max_pending {
        config.max_pending = max_pending;
    }
    config
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish()
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("fatal startup error: {e}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn run(args: Args) -> Result<(), meshctl::Error> {
    let config = apply_overrides(Config::from_env()?, &args);

    let prometheus_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map(std::sync::Arc::new)
        .map_err(|e| {
            tracing::warn!("failed to install prometheus recorder: {e}");
            e
        })
        .ok();

    let controller = Controller::bind(&config).await?;
    let health_addr = std::net::SocketAddr::new(config.bind_addr, config.health_port);

    let (shutdown, dispatcher_phase) = Shutdown::new();
    let maintenance_phase = shutdown.subscribe();
    let observer_phase = shutdown.subscribe();

    let observer = Observer::new(
        health_addr,
        controller.registry(),
        controller.tracker(),
        controller.counters(),
        prometheus_handle,
        observer_phase,
    );
    let observer_task = observer
        .bind()
        .await
        .map_err(|source| meshctl::error::Error::HealthBind {
            addr: health_addr,
            source,
        })?;

    info!(
        client_port = config.client_port,
        worker_port = config.worker_port,
        health_port = config.health_port,
        "meshctl head controller online"
    );

    let maintenance_handle = tokio::spawn(Controller::run_maintenance(
        controller.registry(),
        controller.tracker(),
        controller.reassembler(),
        maintenance_phase,
    ));
    let observer_handle = tokio::spawn(observer_task);
    let dispatcher_handle = tokio::spawn(async move {
        controller.run(dispatcher_phase).await;
        controller.shutdown();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        _ = terminate_signal() => {
            info!("received terminate signal, shutting down");
        }
    }

    // Signal shutdown and wait (bounded by each task's own responsiveness)
    // for in-flight dispatches to drain before exiting.
    shutdown.signal();
    if let Err(e) = dispatcher_handle.await {
        error!("dispatcher task panicked: {e}");
    }
    let _ = maintenance_handle.await;
    if let Err(e) = observer_handle.await {
        error!("observer task panicked: {e}");
    }

    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
