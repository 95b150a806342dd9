//! Signal handling: translates process signals into cooperative shutdown
//! requests the dispatcher polls for.
//!
//! `SIGPIPE` is ignored outright: every write goes through [`std::io::Write`]
//! on a `UnixStream`, and a broken pipe should surface as an `Err`, not take
//! the process down. `SIGHUP` requests a soft exit (stop accepting new
//! connections, keep serving connected clients until they disconnect);
//! `SIGINT`/`SIGQUIT` request a hard exit (stop immediately). Both are
//! modeled as plain atomic flags the dispatcher polls after `poll` wakes up,
//! following `signal-hook`'s flag-registration idiom rather than running
//! code inside the signal handler itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, SigHandler, Signal};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT};
use signal_hook::flag;

#[derive(Clone)]
pub struct ShutdownFlags {
    pub soft_exit: Arc<AtomicBool>,
    pub hard_exit: Arc<AtomicBool>,
}

impl ShutdownFlags {
    pub fn soft_requested(&self) -> bool {
        self.soft_exit.load(Ordering::Relaxed)
    }

    pub fn hard_requested(&self) -> bool {
        self.hard_exit.load(Ordering::Relaxed)
    }
}

/// Installs the flag-based handlers. Must run before any worker thread
/// starts, since `signal-hook` registers process-wide handlers.
pub fn install() -> std::io::Result<ShutdownFlags> {
    let soft_exit = Arc::new(AtomicBool::new(false));
    let hard_exit = Arc::new(AtomicBool::new(false));

    flag::register(SIGHUP, Arc::clone(&soft_exit))?;
    flag::register(SIGINT, Arc::clone(&hard_exit))?;
    flag::register(SIGQUIT, Arc::clone(&hard_exit))?;

    // SAFETY: SigIgn sets the disposition only, no handler code runs.
    unsafe {
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }

    Ok(ShutdownFlags { soft_exit, hard_exit })
}
