//! Service-discovery driven check configuration daemon.
//!
//! Watches the local Consul agent for services named `<project>-php-fpm` and `<project>-go-expvar`, keeps one Datadog
//! check configuration file per family in line with them, and reloads the Datadog Agent whenever a file changes. It
//! also serves the HTTP to FastCGI gateway that the generated php-fpm checks point at.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{net::SocketAddr, sync::Arc};

use confd_app::prelude::*;
use confd_common::{task::JoinSetExt as _, telemetry::MetricsRegistry};
use confd_discovery::{consul::ConsulAgentBackend, DiscoveryBackend as _, RegistryObserver};
use confd_error::{generic_error, ErrorContext as _, GenericError};
use confd_gateway::{FastCgiUpstream, GatewayAPIHandler};
use confd_sync::{
    family::{GoExpvarFamily, PhpFpmFamily},
    CheckFamily, ConfigCommitter, Reconciler, ReloadTrigger, RemoteMetadataFetcher, ServiceCommandReload,
};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
use self::config::AgentConfiguration;

mod self_metadata;
use self::self_metadata::SelfMetadataAPIHandler;

#[tokio::main]
async fn main() {
    if let Err(e) = initialize_logging(None) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run().await {
        Ok(()) => info!("confd-agent stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<(), GenericError> {
    let config = AgentConfiguration::load().error_context("Failed to load configuration.")?;
    let metrics = MetricsRegistry::new();

    let backend = Arc::new(ConsulAgentBackend::new(
        config.consul_address.clone(),
        config.consul_token.clone(),
        config.remote_fetch_timeout(),
    )?);
    let node = backend
        .self_info()
        .await
        .error_context("Failed to query the discovery backend for this node's identity.")?;
    let advertise_address = config.advertise_address.clone().unwrap_or_else(|| node.address.clone());
    info!(node = %node.name, %advertise_address, "Discovered local node.");

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();
    tasks.spawn_traced_named("signals", wait_for_signals(shutdown.clone()));

    let observer = RegistryObserver::new(backend, config.poll_interval(), &metrics);

    let reload_action = ServiceCommandReload::new(
        config.reload_command.clone(),
        config.reload_args.clone(),
        config.reload_timeout(),
    );
    let reload = Arc::new(ReloadTrigger::new(
        Arc::new(reload_action),
        config.dont_reload_agent,
        &metrics,
    ));

    if config.php_fpm_enabled {
        let family = PhpFpmFamily::new(config.listen_port, advertise_address.clone());
        let committer = ConfigCommitter::open(&config.php_fpm_config_file).await?;
        spawn_reconciler(&mut tasks, family, committer, &reload, &observer, &shutdown, &metrics);
    }

    if config.go_expvar_enabled {
        let fetcher =
            RemoteMetadataFetcher::new(config.remote_config_ttl(), config.remote_fetch_timeout(), &metrics)?;
        let family = GoExpvarFamily::new(Arc::new(fetcher), advertise_address.clone());
        let committer = ConfigCommitter::open(&config.go_expvar_config_file).await?;
        spawn_reconciler(&mut tasks, family, committer, &reload, &observer, &shutdown, &metrics);
    }

    let observer_shutdown = shutdown.clone();
    tasks.spawn_traced_named("observer", async move {
        observer.run(observer_shutdown).await;
        Ok(())
    });

    let upstream = Arc::new(FastCgiUpstream::new(config.remote_fetch_timeout()));
    let api = APIBuilder::new()
        .with_handler(GatewayAPIHandler::new(upstream, &metrics))
        .with_handler(SelfMetadataAPIHandler::new(
            &advertise_address,
            config.listen_port,
            metrics.clone(),
        ))
        .with_handler(MetricsAPIHandler::new(metrics.clone()));
    let listen_address = SocketAddr::new(config.listen_address, config.listen_port);
    let grace_period = config.shutdown_grace_period();
    let api_shutdown = shutdown.clone();
    tasks.spawn_traced_named("api", async move {
        info!("Serving API on {}.", listen_address);
        api.serve(listen_address, async move { api_shutdown.cancelled().await }, grace_period)
            .await
    });

    emit_startup_metrics(&metrics, env!("CARGO_PKG_VERSION"));
    info!("confd-agent running, waiting for interrupt...");

    let mut failed = false;
    while let Some(result) = tasks.join_next().await {
        let failure = match result {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) => generic_error!("Task panicked: {}", e),
        };

        if !shutdown.is_cancelled() {
            error!("Shutting down after fatal error: {:?}", failure);
            shutdown.cancel();
        } else {
            error!("{:?}", failure);
        }
        failed = true;
    }

    if failed {
        return Err(generic_error!("confd-agent stopped after a fatal error."));
    }

    Ok(())
}

fn spawn_reconciler<F: CheckFamily>(
    tasks: &mut JoinSet<Result<(), GenericError>>, family: F, committer: ConfigCommitter, reload: &Arc<ReloadTrigger>,
    observer: &RegistryObserver, shutdown: &CancellationToken, metrics: &MetricsRegistry,
) {
    let task_name = format!("reconciler-{}", family.name());
    let reconciler = Reconciler::new(family, committer, Arc::clone(reload), metrics);
    let subscription = observer.subscribe();
    let shutdown = shutdown.clone();

    tasks.spawn_traced_named(task_name, async move {
        reconciler.run(subscription, shutdown).await.map_err(GenericError::from)
    });
}

async fn wait_for_signals(shutdown: CancellationToken) -> Result<(), GenericError> {
    let mut sigint = signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.")?;
    let mut sigterm = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;

    select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        _ = shutdown.cancelled() => return Ok(()),
    }

    shutdown.cancel();
    Ok(())
}
