use clap::Parser;
use ferrite::logging;
use meshwork::config::CoreConfig;
use meshwork::net::link::{LinkConfig, LinkManager, TcpDialer};
use meshwork::sched::{Scheduler, TaskContext};
use meshwork::session::RadioSession;
use meshwork::state::{JsonStore, MeshState};
use meshwork::vdev::{VirtualDeviceConfig, VirtualDeviceServer};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

mod config;

use config::RunnerConfig;

#[derive(Parser)]
#[command(name = "meshworkd", about = "Mesh gateway mediation daemon")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Physical gateway target, overriding the config file.
    #[arg(long)]
    device: Option<String>,

    /// Virtual device listener port, overriding the config file.
    #[arg(long)]
    vdev_port: Option<u16>,

    /// Log level (trace, debug, info, warning, error).
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RunnerConfig::load(path),
        None => RunnerConfig::default(),
    };

    // Environment, then flags, override the file.
    let env = CoreConfig::from_env();
    if std::env::var(meshwork::config::ENV_DEVICE).is_ok() {
        config.device.target = env.device_target.clone();
    }
    if std::env::var(meshwork::config::ENV_VDEV_PORT).is_ok() {
        config.virtual_device.port = env.vdev_port;
    }
    if env.vdev_allow_admin {
        config.virtual_device.allow_admin_commands = true;
    }
    if let Some(device) = args.device {
        config.device.target = device;
    }
    if let Some(port) = args.vdev_port {
        config.virtual_device.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let log = logging::init(&config.log_level);

    logging::info!(log, "meshworkd starting";
                   "context" => "main",
                   "device" => %config.device.target,
                   "vdev_port" => config.virtual_device.port);

    let store = JsonStore::new(&config.storage.snapshot_path);
    let state = Arc::new(
        MeshState::open(Box::new(store), &log).expect("Error opening state snapshot"),
    );

    let (link_tx, link_rx) = std::sync::mpsc::channel();
    let link = LinkManager::spawn(
        LinkConfig::new(config.device.target.clone()),
        TcpDialer::new(config.device.target.clone()),
        link_tx,
        &log,
    );

    let session = RadioSession::new(state, link.handle(), &log);
    let mesh_events = session.subscribe_events();

    let _vdev = VirtualDeviceServer::spawn(
        VirtualDeviceConfig::new(
            config.virtual_device.port,
            config.virtual_device.allow_admin_commands,
        ),
        &session,
        &log,
    )
    .expect("Error binding virtual device listener");

    let scheduler = Scheduler::with_default_tasks(
        TaskContext {
            session: session.clone(),
            log: log.new(logging::o!()),
        },
        &log,
    );

    let stop = Arc::new(AtomicBool::new(false));
    scheduler.run(mesh_events, stop);

    let session_thread = session.run(link_rx);

    // The daemon lives until the session loop exits (user disconnect or
    // process signal).
    drop(session_thread.join());

    if let Err(err) = session.state().persist() {
        logging::error!(log, "final persist failed"; "context" => "main", "error" => %err);
    }

    logging::info!(log, "meshworkd stopped"; "context" => "main");
}
