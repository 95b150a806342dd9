//! Worker thread pool.
//!
//! Each worker loops on [`ReadyQueue::dequeue`], handles exactly one request
//! per iteration, and then either hands the client's socket back to the
//! dispatcher via [`Wakeup::notify`] or, for a request that must block
//! indefinitely (`lockFile` against an already-locked file), leaves the
//! socket parked on the file's own wait queue and returns to the pool
//! without notifying anyone. No worker thread ever blocks waiting for
//! another client to call `unlockFile`.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use log::{debug, warn};

use crate::client::ClientId;
use crate::error::{Error, ErrorKind};
use crate::protocol::{self, Request, ResponseCode};
use crate::queue::ReadyQueue;
use crate::storage::{LockOutcome, Storage, Waiter};
use crate::wakeup::{Wakeup, WorkerEvent};

/// One unit of work handed from the dispatcher to the pool.
pub enum Job {
    Request { client: ClientId, stream: UnixStream },
    Shutdown,
}

/// Runs the worker loop until a [`Job::Shutdown`] is received.
pub fn run(storage: Arc<Storage>, jobs: Arc<ReadyQueue<Job>>, wakeup: Arc<Wakeup>) {
    loop {
        match jobs.dequeue() {
            Job::Shutdown => break,
            Job::Request { client, stream } => handle_one(&storage, &wakeup, client, stream),
        }
    }
}

fn handle_one(storage: &Storage, wakeup: &Wakeup, client: ClientId, mut stream: UnixStream) {
    let code = match protocol::read_request_code(&mut stream) {
        Ok(Some(code)) => code,
        Ok(None) => return finish_disconnect(storage, wakeup, client, stream),
        Err(e) => {
            warn!("{client}: error reading request code: {e}");
            return finish_disconnect(storage, wakeup, client, stream);
        }
    };

    let request = match protocol::read_request_body(&mut stream, code) {
        Ok(request) => request,
        Err(err) => {
            let _ = protocol::write_error(&mut stream, &err);
            return wakeup.notify(WorkerEvent::Resume { client, stream });
        }
    };

    dispatch(storage, wakeup, client, request, stream);
}

fn dispatch(storage: &Storage, wakeup: &Wakeup, client: ClientId, request: Request, mut stream: UnixStream) {
    match request {
        Request::Lock { path } => {
            match storage.lock(&path, client, stream) {
                LockOutcome::Granted(mut stream) => {
                    let _ = protocol::write_bare(&mut stream, ResponseCode::Ok);
                    wakeup.notify(WorkerEvent::Resume { client, stream });
                }
                LockOutcome::NotFound(mut stream) => {
                    let _ = protocol::write_error(&mut stream, &Error::new(ErrorKind::NotFound));
                    wakeup.notify(WorkerEvent::Resume { client, stream });
                }
                LockOutcome::Parked => {
                    debug!("{client}: parked on lock queue");
                }
            }
        }

        Request::Open { path, flags } => {
            match storage.open(&path, flags, client) {
                Ok(outcome) => {
                    let _ = protocol::write_bare(&mut stream, ResponseCode::Ok);
                    notify_not_found(wakeup, outcome.evicted_waiters);
                }
                Err(err) => {
                    let _ = protocol::write_error(&mut stream, &err);
                }
            }
            wakeup.notify(WorkerEvent::Resume { client, stream });
        }

        Request::Read { path } => {
            match storage.read(&path, client) {
                Ok(outcome) => {
                    let _ = protocol::write_read_ok(&mut stream, &outcome.data);
                }
                Err(err) => {
                    let _ = protocol::write_error(&mut stream, &err);
                }
            }
            wakeup.notify(WorkerEvent::Resume { client, stream });
        }

        Request::ReadN { up_to } => {
            match storage.read_many(up_to) {
                Ok(outcome) => {
                    let _ = protocol::write_read_many_ok(&mut stream, &outcome.files);
                }
                Err(err) => {
                    let _ = protocol::write_error(&mut stream, &err);
                }
            }
            wakeup.notify(WorkerEvent::Resume { client, stream });
        }

        Request::Write { path, data } => {
            if !storage.can_write(&path, client) {
                let _ = protocol::write_error(&mut stream, &Error::new(ErrorKind::Forbidden));
            } else {
                run_append(storage, wakeup, client, &path, &data, &mut stream);
            }
            wakeup.notify(WorkerEvent::Resume { client, stream });
        }

        Request::Append { path, data } => {
            run_append(storage, wakeup, client, &path, &data, &mut stream);
            wakeup.notify(WorkerEvent::Resume { client, stream });
        }

        Request::Unlock { path } => {
            match storage.unlock(&path, client) {
                Ok(outcome) => {
                    let _ = protocol::write_bare(&mut stream, ResponseCode::Ok);
                    wakeup.notify(WorkerEvent::Resume { client, stream });
                    if let Some(holder) = outcome.new_holder {
                        notify_granted(wakeup, holder);
                    }
                    return;
                }
                Err(err) => {
                    let _ = protocol::write_error(&mut stream, &err);
                }
            }
            wakeup.notify(WorkerEvent::Resume { client, stream });
        }

        Request::Close { path } => {
            match storage.close(&path, client) {
                Ok(()) => {
                    let _ = protocol::write_bare(&mut stream, ResponseCode::Ok);
                }
                Err(err) => {
                    let _ = protocol::write_error(&mut stream, &err);
                }
            }
            wakeup.notify(WorkerEvent::Resume { client, stream });
        }

        Request::Remove { path } => {
            match storage.remove(&path, client) {
                Ok(outcome) => {
                    let _ = protocol::write_bare(&mut stream, ResponseCode::Ok);
                    notify_not_found(wakeup, outcome.notify_not_found);
                }
                Err(err) => {
                    let _ = protocol::write_error(&mut stream, &err);
                }
            }
            wakeup.notify(WorkerEvent::Resume { client, stream });
        }
    }
}

/// Writes the OK-plus-evicted-stream response for a successful append, or
/// the bare error response for a failed one. Even on failure, any waiters
/// displaced by a partial eviction before the failure still get notified,
/// so a failed append can never leave a client parked forever on a file
/// that no longer exists.
fn run_append(storage: &Storage, wakeup: &Wakeup, client: ClientId, path: &std::path::Path, data: &[u8], stream: &mut UnixStream) {
    match storage.append(path, data, client) {
        Ok(outcome) => {
            let _ = protocol::write_append_ok(stream, &outcome.evicted);
            notify_not_found(wakeup, outcome.notify_not_found);
        }
        Err(failure) => {
            let _ = protocol::write_error(stream, &failure.error);
            notify_not_found(wakeup, failure.notify_not_found);
        }
    }
}

fn notify_not_found(wakeup: &Wakeup, waiters: Vec<Waiter>) {
    for waiter in waiters {
        notify_with(wakeup, waiter, Err(Error::new(ErrorKind::NotFound)));
    }
}

fn notify_granted(wakeup: &Wakeup, waiter: Waiter) {
    notify_with(wakeup, waiter, Ok(()));
}

fn notify_with(wakeup: &Wakeup, mut waiter: Waiter, result: Result<(), Error>) {
    match result {
        Ok(()) => {
            let _ = protocol::write_bare(&mut waiter.stream, ResponseCode::Ok);
        }
        Err(err) => {
            let _ = protocol::write_error(&mut waiter.stream, &err);
        }
    }
    wakeup.notify(WorkerEvent::Resume {
        client: waiter.client,
        stream: waiter.stream,
    });
}

fn finish_disconnect(storage: &Storage, wakeup: &Wakeup, client: ClientId, stream: UnixStream) {
    let granted = storage.user_exit(client);
    drop(stream);
    for waiter in granted {
        notify_granted(wakeup, waiter);
    }
    wakeup.notify(WorkerEvent::Disconnected { client });
}
