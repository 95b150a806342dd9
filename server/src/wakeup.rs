//! The worker-to-dispatcher wakeup channel.
//!
//! A worker that just finished a request needs to tell the dispatcher
//! "this client is ready to be polled again" (or "this client is gone")
//! without the dispatcher's `poll` loop ever blocking on anything but file
//! descriptors. The payload (a [`ClientId`] plus, when relevant, the actual
//! [`UnixStream`]) travels over a plain mutex-guarded queue; the pipe
//! itself carries only a single wakeup byte per event. See DESIGN.md.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe, read, write};

use crate::client::ClientId;

#[derive(Debug)]
pub enum WorkerEvent {
    /// The request completed normally; hand the socket back to the poll set.
    Resume { client: ClientId, stream: UnixStream },
    /// The client disconnected (or a fatal I/O error occurred); storage-side
    /// cleanup has already run, there is nothing left to poll.
    Disconnected { client: ClientId },
}

pub struct Wakeup {
    events: Mutex<VecDeque<WorkerEvent>>,
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl Wakeup {
    pub fn new() -> nix::Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        let flags = OFlag::from_bits_truncate(fcntl(&read_fd, FcntlArg::F_GETFL)?);
        fcntl(&read_fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        Ok(Self {
            events: Mutex::new(VecDeque::new()),
            read_fd,
            write_fd,
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.read_fd.as_fd()
    }

    /// Queues an event and wakes the dispatcher's `poll`. Called from
    /// worker threads only.
    pub fn notify(&self, event: WorkerEvent) {
        self.events.lock().unwrap().push_back(event);
        let _ = write(&self.write_fd, &[0u8]);
    }

    /// Drains both the pipe and the event queue. Called from the
    /// dispatcher thread after `poll` reports the read end is readable.
    pub fn drain(&self) -> Vec<WorkerEvent> {
        let mut scratch = [0u8; 256];
        loop {
            match read(self.read_fd.as_raw_fd(), &mut scratch) {
                Ok(0) => break,
                Ok(n) if n < scratch.len() => break,
                Ok(_) => continue,
                Err(Errno::EAGAIN) | Err(Errno::EWOULDBLOCK) => break,
                Err(_) => break,
            }
        }
        self.events.lock().unwrap().drain(..).collect()
    }
}
