//! A single stored file and the state needed to arbitrate access to it.
//!
//! Content lives behind a `RwLock` so concurrent reads genuinely run in
//! parallel; the small bookkeeping fields (owner, lock holder, who has it
//! open, the FIFO of parked lockers) live behind a plain `Mutex` since they
//! are only ever held for the duration of a pointer chase, never across I/O
//! or a wait. See DESIGN.md for why this replaces a hand-rolled
//! mutex-plus-condvar-plus-counters scheme.

use std::collections::{HashSet, VecDeque};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use crate::client::ClientId;

/// A client parked on a file's lock queue. Its socket travels with it so the
/// eventual grant (or a FILE_NOT_FOUND eviction notice) can be written
/// straight to it without the dispatcher ever seeing the request again.
pub struct Waiter {
    pub client: ClientId,
    pub stream: UnixStream,
}

pub(crate) struct FileMeta {
    pub owner: Option<ClientId>,
    pub modified: bool,
    pub opened_by: HashSet<ClientId>,
    pub locked_by: Option<ClientId>,
    pub pending_locks: VecDeque<Waiter>,
}

impl FileMeta {
    fn new() -> Self {
        Self {
            owner: None,
            modified: false,
            opened_by: HashSet::new(),
            locked_by: None,
            pending_locks: VecDeque::new(),
        }
    }
}

pub struct FileEntry {
    pub pathname: PathBuf,
    content: RwLock<Vec<u8>>,
    meta: Mutex<FileMeta>,
}

impl FileEntry {
    pub fn new(pathname: PathBuf) -> Self {
        Self {
            pathname,
            content: RwLock::new(Vec::new()),
            meta: Mutex::new(FileMeta::new()),
        }
    }

    pub(crate) fn meta(&self) -> std::sync::MutexGuard<'_, FileMeta> {
        self.meta.lock().unwrap()
    }

    pub fn size(&self) -> u64 {
        self.content.read().unwrap().len() as u64
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.content.read().unwrap().clone()
    }

    pub(crate) fn append(&self, data: &[u8]) {
        self.content.write().unwrap().extend_from_slice(data);
    }
}
