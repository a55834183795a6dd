mod device;

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use device::DeviceCredentials;
use mdlink_protocol::Layer;
use mdlink_tasks::clock::{Clock, SystemClock};
use mdlink_tasks::config::NodeConfig;
use mdlink_tasks::connection::run_connection;
use mdlink_tasks::persistent_state::PersistentProtocolState;
use mdlink_tasks::nonce_store::FileNonceStore;
use mdlink_tasks::state_dir::StateDir;
use mdlink_tasks::{
    DistributionLedger, TaskController, TaskError, TaskManager, TaskScheduler, TaskServices,
};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

#[derive(Parser, Debug)]
#[command(author, version, about = "mdlink multi-device protocol node")]
struct Args {
    /// State directory holding config.toml, device.json, protocol state and
    /// nonce hashes.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Mediator address, overriding config.toml.
    #[arg(long)]
    mediator: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mdlink=info".into()),
        )
        .init();

    let args = Args::parse();
    let state_dir = StateDir::open(match args.state_dir {
        Some(dir) => dir,
        None => StateDir::default_path()?,
    })?;

    let mut config =
        NodeConfig::load(&state_dir.config_file()).context("failed to load config")?;
    if let Some(mediator) = args.mediator {
        config.mediator = mediator;
    }

    let credentials = DeviceCredentials::load(&state_dir.device_file())?;
    let identity = credentials.identity()?;
    let device_id = credentials.device_id();
    let keys = credentials.keys()?;
    drop(credentials);

    let state = PersistentProtocolState::load(&state_dir.protocol_state_file(), SystemClock.now_ms())
        .context("failed to load protocol state")?;
    let ledger_capacity = NonZeroUsize::new(config.distribution_ledger_capacity)
        .context("distribution_ledger_capacity must be positive")?;
    let nonces = FileNonceStore::load(&state_dir.nonce_file()).context("failed to load nonces")?;

    let (scheduler, queue) = TaskScheduler::channel();
    let services = Arc::new(
        TaskServices::new(identity, device_id, keys, scheduler, state)
            .with_ledger(DistributionLedger::new(ledger_capacity))
            .with_nonce_store(Arc::new(nonces)),
    );
    services.model.settings.set_read_receipts(config.read_receipts);
    services
        .model
        .settings
        .set_typing_indicators(config.typing_indicators);

    tracing::info!(
        identity = %services.identity,
        state_dir = %state_dir.root().display(),
        device = %services.device_id,
        mediator = %config.mediator,
        last_connection = ?services.state.last_mediator_connection(),
        "mdlink-node starting"
    );

    let mut manager = TaskManager::new(queue);
    tokio::select! {
        result = connection_loop(&services, &mut manager, &config) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
    }
    tracing::info!(pending = manager.pending(), "mdlink-node shut down");
    Ok(())
}

/// Connect to the mediator, run tasks until the connection drops, and try
/// again after the configured delay.
async fn connection_loop(
    services: &Arc<TaskServices>,
    manager: &mut TaskManager,
    config: &NodeConfig,
) -> Result<()> {
    let delay = Duration::from_millis(config.reconnect_delay_ms);
    loop {
        match TcpStream::connect(&config.mediator).await {
            Ok(stream) => {
                tracing::info!(mediator = %config.mediator, "connected");
                let error = run_session(services, manager, config, stream).await?;
                services.reset_connection_flags();
                if let TaskError::ServerClose {
                    can_reconnect: false,
                    message,
                } = &error
                {
                    bail!("mediator closed the connection for good: {message}");
                }
                tracing::warn!(error = %error, "connection lost");
            }
            Err(err) => {
                tracing::warn!(mediator = %config.mediator, error = %err, "failed to connect");
            }
        }
        tracing::debug!(delay_ms = config.reconnect_delay_ms, "waiting before reconnect");
        manager.run_disconnected(tokio::time::sleep(delay)).await;
    }
}

/// Drive one connection. Returns the error that ended it.
async fn run_session(
    services: &Arc<TaskServices>,
    manager: &mut TaskManager,
    config: &NodeConfig,
    stream: TcpStream,
) -> Result<TaskError> {
    let (controller, outbound) = TaskController::new(Arc::clone(services), config.outbound_capacity);
    // The mediator link in front of this node performs both handshakes.
    controller.authenticated(Layer::D2m);
    controller.authenticated(Layer::Csp);
    services
        .state
        .set_last_mediator_connection(services.now_ms())
        .context("failed to persist connection time")?;

    let codec = controller.codec();
    let (stop, stopped) = oneshot::channel::<()>();
    let frames = async {
        tokio::select! {
            result = run_connection(stream, &controller, outbound, config.max_frame_length) => result,
            _ = stopped => {
                controller.close();
                Ok(())
            }
        }
    };
    let tasks = async {
        let error = manager.run(codec).await;
        let _ = stop.send(());
        error
    };
    let (frames, error) = tokio::join!(frames, tasks);
    if let Err(err) = frames {
        tracing::warn!(error = format!("{err:#}"), "connection failed");
    }
    Ok(error)
}
