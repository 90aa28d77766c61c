use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pirtc::config::{self, AppConfig, ConfigStore};
use pirtc::events::EventBus;
use pirtc::orchestrator::{Orchestrator, SnapshotTarget, SENSOR_CHANNEL, SIGNALING_CHANNEL};
use pirtc::recording::{RecordingController, WebmContainerFactory};
use pirtc::transport::{ReconnectingTransport, RetryPolicy, UnixDialer, WsDialer};
use pirtc::upload::{HttpUploader, MediaUploader};
use pirtc::utils::run_periodic_cleanup;
use pirtc::video::{FfmpegCamera, FfmpegJpegEncoder, SharedStream};
use pirtc::webrtc::{SessionRegistry, WebRtcConnector};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// pirtc command line arguments
///
/// Settings given here override the stored configuration and are saved.
#[derive(Parser, Debug)]
#[command(name = "pirtc")]
#[command(version, about = "Camera node: WebRTC live view, recording and motion capture", long_about = None)]
struct CliArgs {
    /// Backend HTTP API base URI (with trailing slash)
    #[arg(long, env = "API_URI", value_name = "URI")]
    api_uri: Option<String>,

    /// Backend WebSocket base URI (with trailing slash)
    #[arg(long, env = "WS_URI", value_name = "URI")]
    ws_uri: Option<String>,

    /// API key; registration is skipped when set
    #[arg(long, env = "API_KEY", value_name = "KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Camera name reported on registration
    #[arg(long, env = "NAME")]
    name: Option<String>,

    /// Camera location reported on registration
    #[arg(long, env = "LOCATION")]
    location: Option<String>,

    /// Directory for recorded videos
    #[arg(long, env = "VIDEO_PATH", value_name = "DIR")]
    video_path: Option<PathBuf>,

    /// Directory for snapshots
    #[arg(long, env = "IMAGE_PATH", value_name = "DIR")]
    image_path: Option<PathBuf>,

    /// V4L2 camera device
    #[arg(long, value_name = "DEVICE")]
    device: Option<String>,

    /// Motion sensor socket; enables the sensor channel
    #[arg(long, env = "SENSOR_SOCKET", value_name = "PATH")]
    sensor_socket: Option<PathBuf>,

    /// Data directory path (default: /etc/pirtc)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    // Required by rustls 0.23+ (reqwest and the WebSocket client)
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing::info!("Starting pirtc v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = ConfigStore::open_in(&data_dir).await?;
    let mut config = (*config_store.get()).clone();
    if apply_overrides(&mut config, &args) {
        config_store.set(config).await?;
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;
    let identity = config::ensure_identity(&config_store, &client)
        .await
        .context("Failed to obtain device identity")?;
    tracing::info!("Device {}", identity.uuid);

    let config = config_store.get();
    if !config.camera.resolution.is_valid() {
        anyhow::bail!("Unsupported capture resolution {}", config.camera.resolution);
    }
    for dir in [&config.storage.video_dir, &config.storage.image_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let shutdown = CancellationToken::new();
    let events = Arc::new(EventBus::new());

    let stream = SharedStream::new(Arc::new(FfmpegCamera::new()), config.camera.clone());
    let uploader: Arc<dyn MediaUploader> = Arc::new(HttpUploader::new(
        client.clone(),
        &config.server.api_uri,
        &identity.api_key,
        &identity.uuid,
    ));
    let recordings = Arc::new(RecordingController::new(
        stream.clone(),
        Arc::new(WebmContainerFactory),
        uploader.clone(),
        events.clone(),
        config.storage.video_dir.clone(),
        shutdown.clone(),
    ));
    let sessions = Arc::new(SessionRegistry::new(
        Arc::new(WebRtcConnector::new(config.webrtc.clone())),
        stream.clone(),
        recordings.clone(),
        events.clone(),
        shutdown.clone(),
    ));

    let retry = RetryPolicy::fixed(Duration::from_secs(config.server.reconnect_delay_secs));
    let signaling = Arc::new(ReconnectingTransport::new(
        SIGNALING_CHANNEL,
        WsDialer::new(&config.server.ws_uri, &identity.api_key),
        retry,
        events.clone(),
    ));
    signaling
        .connect()
        .await
        .context("Failed to connect to signaling server")?;

    let orchestrator = Orchestrator::new(
        identity.uuid.clone(),
        sessions,
        recordings.clone(),
        stream,
        signaling.clone(),
        SnapshotTarget {
            encoder: Arc::new(FfmpegJpegEncoder::new(config.camera.ffmpeg_path.clone())),
            uploader,
            image_dir: config.storage.image_dir.clone(),
        },
        shutdown.clone(),
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        orchestrator.clone().run_event_loop(events.subscribe()),
    ));

    {
        let router = orchestrator.signaling_router();
        let signaling = signaling.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = signaling.listen(&router, &shutdown).await {
                tracing::error!("Signaling loop ended: {}", e);
            }
        }));
    }

    if config.sensor.enabled {
        let sensor = Arc::new(ReconnectingTransport::new(
            SENSOR_CHANNEL,
            UnixDialer::new(&config.sensor.socket_path),
            retry,
            events.clone(),
        ));
        if let Err(e) = sensor.connect().await {
            tracing::warn!("Sensor socket unavailable, retrying in background: {}", e);
        }
        let router = orchestrator.sensor_router(std::process::id());
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = sensor.listen(&router, &shutdown).await {
                tracing::error!("Sensor loop ended: {}", e);
            }
        }));
    }

    orchestrator.announce().await;

    if config.storage.cleanup_interval_hours > 0 {
        let dirs = vec![
            config.storage.video_dir.clone(),
            config.storage.image_dir.clone(),
        ];
        let interval = Duration::from_secs(config.storage.cleanup_interval_hours * 3600);
        let recordings = recordings.clone();
        tasks.push(tokio::spawn(run_periodic_cleanup(
            dirs,
            interval,
            move || recordings.active_paths(),
            shutdown.clone(),
        )));
    }

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    orchestrator.shutdown().await;
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("Task failed during shutdown: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Apply command line overrides; returns whether anything changed
fn apply_overrides(config: &mut AppConfig, args: &CliArgs) -> bool {
    let mut changed = false;

    if let Some(uri) = &args.api_uri {
        changed |= replace(&mut config.server.api_uri, uri.clone());
    }
    if let Some(uri) = &args.ws_uri {
        changed |= replace(&mut config.server.ws_uri, uri.clone());
    }
    if let Some(key) = &args.api_key {
        changed |= replace(&mut config.device.api_key, Some(key.clone()));
    }
    if let Some(name) = &args.name {
        changed |= replace(&mut config.device.name, name.clone());
    }
    if let Some(location) = &args.location {
        changed |= replace(&mut config.device.location, location.clone());
    }
    if let Some(dir) = &args.video_path {
        changed |= replace(&mut config.storage.video_dir, dir.clone());
    }
    if let Some(dir) = &args.image_path {
        changed |= replace(&mut config.storage.image_dir, dir.clone());
    }
    if let Some(device) = &args.device {
        changed |= replace(&mut config.camera.device, device.clone());
    }
    if let Some(socket) = &args.sensor_socket {
        changed |= replace(&mut config.sensor.socket_path, socket.clone());
        changed |= replace(&mut config.sensor.enabled, true);
    }

    changed
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "pirtc=error,webrtc=error",
        LogLevel::Warn => "pirtc=warn,webrtc=warn",
        LogLevel::Info => "pirtc=info,webrtc=warn",
        LogLevel::Verbose => "pirtc=debug,webrtc=warn",
        LogLevel::Debug => "pirtc=debug,webrtc=info",
        LogLevel::Trace => "pirtc=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("PIRTC_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/pirtc")
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for CTRL+C: {}", e);
    }
}
