//! SD Share Server
//!
//! Host build of the firmware: a directory stands in for the card and the
//! bus pins are simulated. Serves the status site and WebDAV.

use anyhow::Context;
use clap::Parser;
use sdshare::arbiter::hal::{DirectoryMedia, GpioBus, SimulatedSense, SimulatedSwitch};
use sdshare::config::SETTINGS_FILE_NAME;
use sdshare::link::BootKind;
use sdshare::{
    Arbiter, CredentialWatcher, DavHandler, HostControl, HttpServer, LogRing, SettingsFile,
    StatusHandler, Storage,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sdshare-server")]
#[command(about = "Share an SD card over WebDAV while a primary device uses it")]
struct Args {
    /// Directory standing in for the card
    #[arg(short = 'm', long)]
    media_root: PathBuf,

    /// Internal storage for settings, cached credentials and markers
    #[arg(short = 'i', long)]
    internal_dir: PathBuf,

    /// Bind address
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Status site port
    #[arg(long, default_value = "80")]
    status_port: u16,

    /// WebDAV port
    #[arg(long, default_value = "81")]
    dav_port: u16,

    /// Host name or address clients should use (defaults to the bind address)
    #[arg(long)]
    advertise_host: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let log = LogRing::default();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(log.layer())
        .init();

    let args = Args::parse();

    info!("Starting SD Share {}", env!("CARGO_PKG_VERSION"));
    info!("Media root: {:?}", args.media_root);

    std::fs::create_dir_all(&args.internal_dir)
        .with_context(|| format!("creating internal dir {:?}", args.internal_dir))?;
    let settings = SettingsFile::load_or_create(args.internal_dir.join(SETTINGS_FILE_NAME)).get();
    let arbiter_config = settings.effective_arbiter();
    info!(
        "Arbiter: debounce={} ms, poll={} ms, boot quiescence={} ms",
        arbiter_config.debounce_ms, arbiter_config.poll_interval_ms, arbiter_config.boot_quiescence_ms
    );

    let hardware = GpioBus::new(
        SimulatedSense::new(true),
        SimulatedSwitch::new(),
        DirectoryMedia::new(&args.media_root),
    );
    let arbiter = Arc::new(Arbiter::new(Box::new(hardware), arbiter_config));
    let storage = Arc::new(Storage::new(arbiter));

    let host = args
        .advertise_host
        .clone()
        .unwrap_or_else(|| args.bind.to_string());
    let dav_url = format!("http://{}:{}", host, args.dav_port);
    storage.queue_write("/ipAddress.txt", host.clone());

    let control = Arc::new(HostControl::new());
    let watcher = Arc::new(CredentialWatcher::new(
        storage.clone(),
        &args.internal_dir,
        control.clone(),
    ));
    if watcher.network_disabled() {
        warn!("Network disabled marker present; serving anyway on the host build");
    }
    let initial_check = match watcher.boot() {
        BootKind::Normal => Some(settings.boot_lock_delay()),
        BootKind::AfterCredentialUpdate => None,
    };
    let network_name = watcher.cached_credentials().map(|c| c.ssid);
    let _watcher = watcher
        .spawn(initial_check)
        .context("starting credential watcher")?;

    let dav = DavHandler::new(storage.clone(), &dav_url).context("building WebDAV handler")?;
    let dav_server = HttpServer::new("webdav", Arc::new(dav), settings.dispatch)
        .start(SocketAddr::new(args.bind, args.dav_port))
        .context("starting WebDAV server")?;
    info!("WebDAV listening on {}", dav_server.local_addr());

    let status = StatusHandler::new(storage, log, control, &args.internal_dir, &dav_url)
        .with_network_name(network_name);
    let status_server = HttpServer::new("status", Arc::new(status), settings.dispatch)
        .start(SocketAddr::new(args.bind, args.status_port))
        .context("starting status server")?;
    info!("Status site listening on {}", status_server.local_addr());

    status_server.join();
    dav_server.join();
    Ok(())
}
