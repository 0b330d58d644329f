use axum::Server;
use eyre::WrapErr;
use kube::{
    client::Client,
    config::{Config, KubeConfigOptions, Kubeconfig},
};
use std::{env, sync::Arc};
use tokio::{
    signal,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info};

mod http;
mod reconciler;
mod watch;

use crate::{
    cli::Cli,
    provider::{self, Provider},
};
use reconciler::Reconciler;
use watch::Watcher;

/// Wire everything together and run until a termination signal or a fatal
/// error in one of the long-lived tasks
pub async fn launch(args: Cli) -> eyre::Result<()> {
    let mut provider = provider::provide(&args.database_provider)?;
    provider
        .initialize(&args.database_dsn)
        .await
        .wrap_err("failed to initialize the database provider")?;
    let provider: Arc<dyn Provider> = Arc::from(provider);

    let client = kube_client()
        .await
        .wrap_err("failed to build the kubernetes client")?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (watch_stop_tx, watch_stop_rx) = oneshot::channel();

    let selector = args.selector();
    info!(%selector, "watching for database resources");
    let mut watch: JoinHandle<eyre::Result<()>> =
        tokio::spawn(Watcher::new(client.clone(), selector, events_tx).run(watch_stop_rx));

    let mut reconcile: JoinHandle<eyre::Result<()>> = tokio::spawn(
        Reconciler::new(
            client,
            Arc::clone(&provider),
            args.secret_prefix.clone(),
            events_rx,
        )
        .run(),
    );

    let (http_stop_tx, http_stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(
        Server::try_bind(&args.probe_address)
            .wrap_err("failed to bind the status endpoint")?
            .serve(http::router(Arc::clone(&provider)).into_make_service())
            .with_graceful_shutdown(async {
                http_stop_rx.await.ok();
            }),
    );
    info!(address = %args.probe_address, "listening and ready to handle requests");

    let mut watch_result = None;
    let mut reconcile_result = None;
    let mut server_result = None;

    tokio::select! {
        _ = shutdown() => {}
        result = &mut watch => watch_result = Some(result),
        result = &mut reconcile => reconcile_result = Some(result),
        result = &mut server => server_result = Some(result),
    }

    // Wind down in dependency order: stopping the watcher drops the event
    // channel, the reconciler drains what is in flight, then the endpoint
    // stops answering and the backend pool is released.
    let _ = watch_stop_tx.send(());
    let watch_result = match watch_result {
        Some(result) => result,
        None => watch.await,
    };
    let reconcile_result = match reconcile_result {
        Some(result) => result,
        None => reconcile.await,
    };

    let server_result = match server_result {
        Some(result) => result,
        None => {
            let _ = http_stop_tx.send(());
            server.await
        }
    };

    provider.close().await;

    watch_result??;
    reconcile_result??;
    server_result?.wrap_err("status endpoint failed")?;

    info!("operator successfully shutdown");
    info!("goodbye! :)");

    Ok(())
}

/// Build a client from `KUBECONFIG` when set, the in-cluster service account
/// otherwise
async fn kube_client() -> eyre::Result<Client> {
    let config = match env::var("KUBECONFIG").ok().filter(|path| !path.is_empty()) {
        Some(path) => {
            let path = shellexpand::tilde(&path).to_string();
            debug!(%path, "using kubeconfig");

            let kubeconfig = Kubeconfig::read_from(&path).wrap_err("failed to read kubeconfig")?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .wrap_err("failed to load kubeconfig")?
        }
        None => Config::incluster().wrap_err("failed to load the in-cluster configuration")?,
    };

    Ok(Client::try_from(config)?)
}

/// Wait for signals for terminating
async fn shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler")
    };
    let terminate = async {
        use signal::unix::SignalKind;

        signal::unix::signal(SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("termination signal received, shutting down");
}
