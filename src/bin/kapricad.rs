//! The kaprica daemon: binds the Wayland data-control transport, shadows the
//! compositor's clipboard into a durable history store, and re-serves the
//! latest entry on demand.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use clap::Parser;
use log::{error, info, warn};

use kaprica::config::{self, CliOverrides};
use kaprica::engine::Engine;
use kaprica::error::{KapricaError, Result};
use kaprica::retention;
use kaprica::store::Store;

/// Wayland clipboard manager daemon.
#[derive(Parser, Debug)]
#[command(name = "kapricad", version, about)]
struct Args {
    /// Wayland seat name (defaults to the first available).
    #[arg(long)]
    seat: Option<String>,
    /// Path to the history database file.
    #[arg(long)]
    database: Option<PathBuf>,
    /// Maximum on-disk database size (suffix KB/MB/GB accepted).
    #[arg(long)]
    size: Option<String>,
    /// Days to retain history entries.
    #[arg(long)]
    expire: Option<u32>,
    /// Maximum number of history entries to retain.
    #[arg(long)]
    limit: Option<u64>,
    /// Path to an INI configuration file, overriding the default discovery
    /// order.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// `SIGINT` + `SIGTERM` are blocked from default delivery and consumed via
/// a `signalfd`, polled alongside the display and timer fds.
fn block_signals_into_fd() -> Result<OwnedFd> {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGINT);
        libc::sigaddset(&mut mask, libc::SIGTERM);
        if libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
            return Err(KapricaError::Io(std::io::Error::last_os_error()));
        }
        let fd = libc::signalfd(-1, &mask, libc::SFD_CLOEXEC);
        if fd < 0 {
            return Err(KapricaError::Io(std::io::Error::last_os_error()));
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

/// Periodic retention timer: first fire at +1 minute, then every 5 minutes.
fn create_retention_timer() -> Result<OwnedFd> {
    unsafe {
        let fd = libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC);
        if fd < 0 {
            return Err(KapricaError::Io(std::io::Error::last_os_error()));
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 5 * 60, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: 60, tv_nsec: 0 },
        };
        if libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(KapricaError::Io(err));
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

fn poll_fds(fds: &mut [libc::pollfd]) -> Result<i32> {
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
    if ret < 0 {
        return Err(KapricaError::Io(std::io::Error::last_os_error()));
    }
    Ok(ret)
}

fn readable(pfd: &libc::pollfd) -> bool {
    pfd.revents & libc::POLLIN != 0
}

/// Drain a `signalfd`/`timerfd`'s notification payload so the next `poll`
/// doesn't immediately re-fire on stale bytes.
fn drain_fd(fd: RawFd, buf: &mut [u8]) {
    unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let overrides = CliOverrides {
        config_path: args.config,
        database_path: args.database,
        expire_days: args.expire,
        size_cap_bytes: args.size.as_deref().map(parse_size).transpose()?,
        max_entries: args.limit,
    };
    let config = config::load(&overrides)?;
    if let Some(seat) = &args.seat {
        info!("seat override requested: {seat} (first-available seat is used; multi-seat selection is not modeled)");
    }

    let mut store = Store::open(&config.database_path)?;
    let mut engine = Engine::init()?;
    engine.startup(&mut store)?;

    let signal_fd = block_signals_into_fd()?;
    let timer_fd = create_retention_timer()?;

    info!("kapricad running, database at {}", config.database_path.display());

    loop {
        engine.flush()?;

        let mut fds = [
            libc::pollfd { fd: engine.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: signal_fd.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: timer_fd.as_raw_fd(), events: libc::POLLIN, revents: 0 },
        ];

        poll_fds(&mut fds)?;

        if readable(&fds[1]) {
            let mut buf = [0u8; std::mem::size_of::<libc::signalfd_siginfo>()];
            drain_fd(signal_fd.as_raw_fd(), &mut buf);
            info!("received shutdown signal, stopping");
            break;
        }

        if readable(&fds[2]) {
            let mut buf = [0u8; 8];
            drain_fd(timer_fd.as_raw_fd(), &mut buf);
            if let Err(e) = retention::run(&mut store, &config, engine.served_id()) {
                warn!("retention pass failed: {e}");
            }
        }

        if readable(&fds[0]) {
            engine.read_events()?;
            engine.pump();

            if engine.take_revoked() {
                error!("data-control device revoked by compositor, exiting");
                break;
            }

            if engine.needs_reconcile() {
                if let Err(e) = engine.reconcile(&mut store) {
                    warn!("reconcile failed: {e}");
                }
            }
        }
    }

    Ok(())
}

fn parse_size(value: &str) -> Result<u64> {
    config::parse_size(value).map_err(KapricaError::Other)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(1);
    }
}
