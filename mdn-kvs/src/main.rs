//! Binary entrypoint for `mdn-kvs`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use mdn_bus::{MessageBus, TcpBus};
use mdn_cluster::{
    ConfigEndpointMapper, ConfigHandle, ConfigSource, Configuration, TcpConfigSource,
};
use mdn_common::control::{spawn_signal_thread, DaemonControl};
use mdn_common::error::MdnResult;
use mdn_common::identity;
use mdn_kvs::migration::MigrationThread;
use mdn_kvs::{KvsDaemon, KvsOptions};
use mdn_storage::MemoryDataLayer;

const COORDINATOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "mdn-kvs")]
#[command(about = "meridian key-value store daemon")]
struct Args {
    /// Run in the foreground (supervisor-managed operation).
    #[arg(long)]
    foreground: bool,

    /// Data directory for identity and storage snapshots.
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Log directory; logging goes to stderr when omitted.
    #[arg(long)]
    log: Option<PathBuf>,

    /// Pidfile to write after startup.
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Listener endpoint for the message bus.
    #[arg(long, default_value = "127.0.0.1:22751")]
    listen: String,

    /// Coordinator rendezvous endpoint.
    #[arg(long, default_value = "127.0.0.1:22971")]
    coordinator: String,

    /// Number of network worker threads.
    #[arg(long, default_value_t = default_thread_count())]
    threads: usize,
}

fn default_thread_count() -> usize {
    thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log.as_deref());
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("mdn-kvs failed to start: {error}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_dir: Option<&std::path::Path>) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(dir) = log_dir {
        let _ = std::fs::create_dir_all(dir);
        match std::fs::File::options()
            .create(true)
            .append(true)
            .open(dir.join("mdn-kvs.log"))
        {
            Ok(file) => {
                let _ = builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(error) => eprintln!("could not open log file, logging to stderr: {error}"),
        }
    }
    builder.init();
}

fn run(args: &Args) -> MdnResult<()> {
    if !args.foreground {
        log::warn!("running attached; use a process supervisor for background operation");
    }

    let outcome = identity::load_or_generate(
        args.data.join("KVS"),
        &args.listen,
        &args.coordinator,
    )?;
    identity::save(args.data.join("KVS"), &outcome.identity)?;
    let id = outcome.identity.id;
    log::info!("starting mdn-kvs {id} on address {}", args.listen);
    log::info!("connecting to {}", args.coordinator);

    if let Some(pidfile) = &args.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .map_err(|error| mdn_common::error::MdnError::Io(error.to_string()))?;
    }

    let control = DaemonControl::new();
    let signal_thread = spawn_signal_thread(Arc::clone(&control))?;

    let config = Arc::new(ConfigHandle::new());
    let mapper = Arc::new(ConfigEndpointMapper::new(Arc::clone(&config)));
    let bus: Arc<TcpBus> = Arc::new(TcpBus::bind(id, &args.listen, mapper)?);
    let snapshot_path = args.data.join("kvs.snapshot");
    let data = Arc::new(MemoryDataLayer::open(&snapshot_path)?);

    let daemon = Arc::new(KvsDaemon::new(
        id,
        Arc::clone(&control),
        Arc::clone(&config),
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        Arc::clone(&data) as Arc<dyn mdn_storage::DataLayer>,
        KvsOptions::default(),
    ));

    let mut workers = Vec::with_capacity(args.threads.max(1));
    for worker_id in 0..args.threads.max(1) {
        let worker_daemon = Arc::clone(&daemon);
        let worker = thread::Builder::new()
            .name(format!("mdn-kvs-worker-{worker_id}"))
            .spawn(move || {
                log::info!("network thread {worker_id} started");
                worker_daemon.worker_loop();
                log::info!("network thread {worker_id} shutting down");
            })
            .map_err(|error| {
                mdn_common::error::MdnError::Io(format!("spawn worker failed: {error}"))
            })?;
        workers.push(worker);
    }

    let mut migration = MigrationThread::spawn(Arc::clone(&daemon));
    let mut source = TcpConfigSource::new(args.coordinator.clone());

    // Coordinator loop: pull configs, publish them, wake migration, and
    // surface server failures into the replicators.
    while !control.shutdown_requested() {
        match source.poll() {
            Ok(Some(blob)) => match Configuration::decode(&blob) {
                Ok(next) => {
                    let version = next.version();
                    if config.install(Arc::new(next)) {
                        log::info!("updating to configuration {}", version.get());
                        migration.new_config();
                    }
                }
                Err(error) => log::error!("received a bad configuration: {error}"),
            },
            Ok(None) => thread::sleep(COORDINATOR_POLL_INTERVAL),
            Err(error) => {
                log::warn!("coordinator link error: {error}");
                thread::sleep(COORDINATOR_POLL_INTERVAL);
            }
        }
        for id in source.take_failures() {
            log::info!("coordinator reported server failure for {id}");
            daemon.note_peer_failure(id);
        }
    }

    control.request_shutdown();
    migration.shutdown();
    bus.shutdown();
    for worker in workers {
        let _ = worker.join();
    }
    if let Err(error) = data.persist(&snapshot_path) {
        log::warn!("failed to persist storage snapshot: {error}");
    }
    drop(signal_thread);
    log::info!("mdn-kvs is gracefully shutting down");
    Ok(())
}
