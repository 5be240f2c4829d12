use anyhow::Context;
use routewarden::config::DaemonConfig;
use routewarden::daemon::Daemon;
use routewarden::events::EventEmitter;
use routewarden::telemetry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_SINK_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    // The daemon is configured entirely through the environment.
    if let Some(arg) = std::env::args().nth(1) {
        anyhow::bail!(
            "unrecognised argument `{arg}`: routewarden takes no arguments, \
             all options come from the environment"
        );
    }

    let config = DaemonConfig::load().context("failed to load configuration")?;
    let (emitter, _sink) = EventEmitter::spawn(EVENT_SINK_CAPACITY);

    let daemon = Daemon::startup(config, emitter)
        .await
        .context("daemon startup failed")?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    daemon.run(shutdown).await.context("daemon runtime error")
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
                        _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to register SIGTERM handler");
                    let _ = ctrl_c.await;
                    info!("received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt, initiating graceful shutdown");
        }

        shutdown.cancel();
    });
}
