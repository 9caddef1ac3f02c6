use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

use sidelock::auth;
use sidelock::cli::Cli;
use sidelock::engine::{run_token_renewal, LifecycleEngine};
use sidelock::observability::init_observability;
use sidelock::output::OutputWriter;
use sidelock::store::VaultHttpClient;
use sidelock::{Result, APP_NAME, VERSION};

/// Capacity of the event channel between engine and writer
const EVENT_QUEUE: usize = 10;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match cli.into_config() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("[error] invalid options, {}", e);
            return 1;
        }
    };

    let metrics = match init_observability(&config.observability) {
        Ok(metrics) => metrics,
        Err(e) => {
            eprintln!("[error] {}", e);
            return 1;
        }
    };

    info!(
        app_name = APP_NAME,
        version = VERSION,
        store = %config.vault_url,
        resources = config.resources.len(),
        one_shot = config.one_shot,
        "starting the sidecar"
    );

    let mut store = match VaultHttpClient::new(&config) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to create a store client");
            return 1;
        }
    };

    match auth::authenticate(&store, &config.auth).await {
        Ok(token) => store.set_token(token),
        Err(e) => {
            error!(error = %e, "failed to authenticate against the store");
            return 1;
        }
    }
    let store = Arc::new(store);

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

    let engine = LifecycleEngine::new(config.clone(), store.clone(), events_tx, metrics.clone());
    let handle = engine.handle();
    let mut engine_task = tokio::spawn(engine.run());

    let writer = OutputWriter::new(config.clone());
    let writer_task = tokio::spawn(writer.run(events_rx));

    for spec in &config.resources {
        if handle.watch(Arc::new(spec.clone())).await.is_err() {
            break;
        }
    }

    // disabled token renewal parks the task forever, keeping the select
    // arms uniform
    let token_task = tokio::spawn({
        let store = store.clone();
        let metrics = metrics.clone();
        let enabled = config.renew_token;
        async move {
            if enabled {
                run_token_renewal(store, metrics).await
            } else {
                std::future::pending().await
            }
        }
    });

    tokio::select! {
        result = &mut engine_task => {
            let code = match result {
                Ok(Ok(())) => {
                    info!("lifecycle engine finished");
                    0
                }
                Ok(Err(e)) => {
                    error!(error = %e, "lifecycle engine failed");
                    1
                }
                Err(e) => {
                    error!(error = %e, "lifecycle engine task aborted");
                    1
                }
            };
            // let the writer drain the remaining events before exiting
            let _ = writer_task.await;
            code
        }
        result = token_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "token renewal collapsed"),
                Ok(Ok(())) => error!("token renewal loop ended unexpectedly"),
                Err(e) => error!(error = %e, "token renewal task aborted"),
            }
            1
        }
        signal_name = wait_for_signal() => {
            match signal_name {
                Ok(name) => {
                    info!(signal = name, "received a termination signal, shutting down");
                    0
                }
                Err(e) => {
                    error!(error = %e, "failed to install signal handlers");
                    1
                }
            }
        }
    }
}

async fn wait_for_signal() -> Result<&'static str> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sighup.recv() => Ok("SIGHUP"),
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigquit.recv() => Ok("SIGQUIT"),
    }
}
