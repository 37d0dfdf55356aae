use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use homeface::{
    common::{system_data_dir, Config, DevMode},
    core::{CaptureBuffer, FaceWorkflow, TokenManager},
    service::{FaceAgent, FaceService, HttpFaceService, Request, Response},
    storage::{FileCredentialStore, PersonMirror},
};

#[derive(Parser, Debug)]
#[command(name = "homeface-agent")]
#[command(about = "Buffers images and submits them to the face service on request")]
struct Args {
    /// Run in development mode
    #[arg(long)]
    dev: bool,

    /// Socket path in dev mode
    #[arg(long, default_value = "/tmp/homeface-agent.sock")]
    dev_socket: PathBuf,

    /// Data directory in dev mode
    #[arg(long, default_value = "./dev_data")]
    dev_data_dir: PathBuf,

    /// Config file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting homeface agent (dev_mode: {})", args.dev);

    let dev_mode = DevMode::with_base_dir(args.dev, args.dev_data_dir.clone())?;
    let (socket_path, data_dir) = if args.dev {
        (args.dev_socket.clone(), args.dev_data_dir.clone())
    } else {
        (dev_mode.agent_socket(), system_data_dir())
    };
    let config_path = args.config.clone().unwrap_or_else(|| dev_mode.config_file());

    let config = if config_path.exists() {
        Config::load_from_path(&config_path)?
    } else {
        tracing::warn!("No config at {}, using defaults", config_path.display());
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        config
    };

    // Clean up old socket if exists
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir_all(&data_dir)?;

    let listener = UnixListener::bind(&socket_path).context("Failed to bind Unix socket")?;
    fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o660))?;
    tracing::info!("Listening on {}", socket_path.display());

    let cancel = CancellationToken::new();

    let service: Arc<dyn FaceService> = Arc::new(HttpFaceService::new(&config.service)?);
    let store = Arc::new(FileCredentialStore::new(dev_mode.credentials_file())?);
    let tokens = Arc::new(TokenManager::new(
        Arc::clone(&service),
        store.clone(),
        config.service.tokens_key.clone(),
        config.service.credentials(),
    ));
    store.spawn_poller(Duration::from_millis(config.service.store_poll_ms), cancel.clone());
    tokens.spawn_store_watch(cancel.clone());

    let buffer = CaptureBuffer::new(
        config.buffer.capacity,
        Some(Duration::from_secs(config.buffer.ingest_ttl_secs)),
    );
    let persons = PersonMirror::open(data_dir.join("persons.json"))?;
    let workflow = FaceWorkflow::new(Arc::clone(&tokens), service, config.service.engine);
    let agent = Arc::new(FaceAgent::new(workflow, buffer, persons));

    if !tokens.has_credentials() {
        tracing::warn!("No login configured, relying on tokens from the store");
    }
    match agent.handle(Request::Sync).await {
        Response::Synced(synced) => tracing::info!("Synced {} person(s)", synced.persons),
        other => tracing::warn!("Initial person sync failed: {:?}", other),
    }

    let server = tokio::spawn(Arc::clone(&agent).serve(listener, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cancel.cancel();
    if let Err(e) = server.await? {
        tracing::error!("Server loop failed: {}", e);
    }

    agent.shutdown().await;
    if let Err(e) = fs::remove_file(&socket_path) {
        tracing::debug!("Socket cleanup: {}", e);
    }

    Ok(())
}
