//! The master dispatcher.
//!
//! One thread multiplexes the listening socket, the wakeup pipe, and every
//! client currently idle (registered, not mid-request) via `nix::poll`.
//! A client fd becoming readable means "a new request is waiting"; the
//! dispatcher removes it from the idle set and hands it to a worker. It
//! never reads a byte of the request itself — that's the worker's job,
//! keeping the dispatcher thread free to keep multiplexing.

use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags};

use crate::client::{ClientId, ClientIdAllocator};
use crate::queue::ReadyQueue;
use crate::signals::ShutdownFlags;
use crate::storage::Storage;
use crate::wakeup::{Wakeup, WorkerEvent};
use crate::worker::Job;

enum PollError {
    Interrupted,
    Fatal(nix::errno::Errno),
}

struct ReadySet {
    listener: bool,
    wakeup: bool,
    idle: Vec<bool>,
}

pub struct Dispatcher {
    listener: UnixListener,
    storage: Arc<Storage>,
    jobs: Arc<ReadyQueue<Job>>,
    wakeup: Arc<Wakeup>,
    flags: ShutdownFlags,
    ids: ClientIdAllocator,
    idle: HashMap<ClientId, UnixStream>,
    connected: usize,
}

impl Dispatcher {
    pub fn new(
        listener: UnixListener,
        storage: Arc<Storage>,
        jobs: Arc<ReadyQueue<Job>>,
        wakeup: Arc<Wakeup>,
        flags: ShutdownFlags,
    ) -> Self {
        listener
            .set_nonblocking(true)
            .expect("listening socket supports non-blocking mode");
        Self {
            listener,
            storage,
            jobs,
            wakeup,
            flags,
            ids: ClientIdAllocator::new(),
            idle: HashMap::new(),
            connected: 0,
        }
    }

    /// Runs the accept/poll loop until a hard exit is requested, or a soft
    /// exit is requested and every connected client has since disconnected.
    /// Enqueues one [`Job::Shutdown`] per worker before returning.
    pub fn run(mut self, worker_pool_size: usize) {
        loop {
            if self.flags.hard_requested() {
                info!("hard exit requested, shutting down immediately");
                break;
            }

            let idle_ids: Vec<ClientId> = self.idle.keys().copied().collect();
            let ready = match self.poll_once(&idle_ids) {
                Ok(ready) => ready,
                Err(PollError::Interrupted) => {
                    if self.flags.hard_requested() {
                        info!("hard exit requested, shutting down immediately");
                        break;
                    }
                    if self.flags.soft_requested() && self.connected == 0 {
                        info!("soft exit: all clients disconnected, shutting down");
                        break;
                    }
                    continue;
                }
                Err(PollError::Fatal(errno)) => {
                    warn!("poll failed: {errno}");
                    break;
                }
            };

            if ready.listener {
                self.accept_all();
            }
            if ready.wakeup {
                self.drain_wakeup();
            }
            for (id, readable) in idle_ids.iter().zip(ready.idle.iter()) {
                if *readable {
                    if let Some(stream) = self.idle.remove(id) {
                        self.jobs.enqueue(Job::Request { client: *id, stream });
                        debug!("{id}: request queued, {} job(s) pending", self.jobs.len());
                    }
                }
            }

            if self.flags.soft_requested() && self.connected == 0 {
                info!("soft exit: all clients disconnected, shutting down");
                break;
            }
        }

        self.shutdown(worker_pool_size);
    }

    fn poll_once(&self, idle_ids: &[ClientId]) -> Result<ReadySet, PollError> {
        let idle_fds: Vec<BorrowedFd<'_>> = idle_ids.iter().map(|id| self.idle[id].as_fd()).collect();

        let mut fds = Vec::with_capacity(2 + idle_fds.len());
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(self.wakeup.as_fd(), PollFlags::POLLIN));
        for fd in &idle_fds {
            fds.push(PollFd::new(*fd, PollFlags::POLLIN));
        }

        // -1: block indefinitely.
        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Err(PollError::Interrupted),
            Err(errno) => return Err(PollError::Fatal(errno)),
        }

        let hit = |pf: &PollFd| {
            pf.revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
                .unwrap_or(false)
        };

        Ok(ReadySet {
            listener: hit(&fds[0]),
            wakeup: hit(&fds[1]),
            idle: fds[2..].iter().map(hit).collect(),
        })
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if self.flags.soft_requested() {
                        // reject immediately: no new client is admitted once
                        // a soft exit has been requested.
                        drop(stream);
                        continue;
                    }
                    let id = self.ids.alloc();
                    self.connected += 1;
                    self.idle.insert(id, stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn drain_wakeup(&mut self) {
        for event in self.wakeup.drain() {
            match event {
                WorkerEvent::Resume { client, stream } => {
                    self.idle.insert(client, stream);
                }
                WorkerEvent::Disconnected { client } => {
                    self.connected = self.connected.saturating_sub(1);
                    debug!("{client}: disconnected, {} client(s) remain", self.connected);
                }
            }
        }
    }

    fn shutdown(&self, worker_pool_size: usize) {
        let stranded = self.storage.drain_all_pending_locks();
        if !stranded.is_empty() {
            info!("shutdown: closing {} socket(s) parked on a lock queue", stranded.len());
        }
        // `stranded` sockets are simply dropped: the server is going away
        // entirely, there is no response left to send.
        for _ in 0..worker_pool_size {
            self.jobs.enqueue(Job::Shutdown);
        }
    }
}
