//! Entry point: parses arguments, loads configuration, and runs the server
//! until a signal requests shutdown.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use log::{error, info};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};

use fss::config::{Config, SOCKET_PATH};
use fss::dispatch::Dispatcher;
use fss::queue::ReadyQueue;
use fss::signals;
use fss::storage::Storage;
use fss::wakeup::Wakeup;
use fss::worker::{self, Job};

/// In-memory file storage server, shared over a local Unix socket.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to a `KEY=VALUE` config file. Defaults are used if omitted.
    config_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config_file {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!("failed to load config file {path:?}: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => {
            info!("no config file given, using default server configuration");
            Config::default()
        }
    };
    info!("starting with configuration: {config}");

    if let Err(err) = remove_stale_socket() {
        error!("failed to remove stale socket at {SOCKET_PATH}: {err}");
        return ExitCode::FAILURE;
    }

    let flags = match signals::install() {
        Ok(flags) => flags,
        Err(err) => {
            error!("failed to install signal handlers: {err}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match bind_listener(SOCKET_PATH, config.backlog) {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {SOCKET_PATH}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let storage = Arc::new(Storage::new(config.storage_max_file_number, config.storage_max_size));
    let jobs = Arc::new(ReadyQueue::<Job>::new());
    let wakeup = match Wakeup::new() {
        Ok(wakeup) => Arc::new(wakeup),
        Err(err) => {
            error!("failed to create wakeup pipe: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut handles = Vec::with_capacity(config.worker_pool_size);
    for i in 0..config.worker_pool_size {
        let storage = Arc::clone(&storage);
        let jobs = Arc::clone(&jobs);
        let wakeup = Arc::clone(&wakeup);
        handles.push(
            thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker::run(storage, jobs, wakeup))
                .expect("spawn worker thread"),
        );
    }

    info!("listening on {SOCKET_PATH} with {} worker(s)", config.worker_pool_size);
    let dispatcher = Dispatcher::new(listener, Arc::clone(&storage), Arc::clone(&jobs), wakeup, flags);
    dispatcher.run(config.worker_pool_size);

    for handle in handles {
        let _ = handle.join();
    }

    if let Err(err) = remove_stale_socket() {
        error!("failed to remove socket at {SOCKET_PATH} on exit: {err}");
        return ExitCode::FAILURE;
    }

    let stats = storage.stats();
    info!(
        "shut down cleanly: peak {} file(s), peak {} byte(s), {} eviction(s)",
        stats.peak_file_number, stats.peak_size, stats.evictions
    );
    ExitCode::SUCCESS
}

/// `std::os::unix::net::UnixListener::bind` hardcodes its listen backlog;
/// honoring a configurable one needs the raw socket/bind/listen sequence,
/// so this builds the socket through `nix` and only converts to a standard
/// `UnixListener` at the end.
fn bind_listener(path: &str, backlog: i32) -> std::io::Result<UnixListener> {
    let fd = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)?;
    let addr = UnixAddr::new(path)?;
    socket::bind(fd.as_raw_fd(), &addr)?;
    socket::listen(&fd, backlog as usize)?;
    Ok(UnixListener::from(fd))
}

fn remove_stale_socket() -> std::io::Result<()> {
    match std::fs::remove_file(SOCKET_PATH) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
