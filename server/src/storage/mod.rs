//! The in-memory file storage engine.
//!
//! One [`Storage`] per server process, shared by every worker thread behind
//! a single [`Mutex`]. Operations that only touch one file's bookkeeping
//! (read, lock, unlock, close) release that mutex as soon as the file is
//! found, so unrelated files make independent progress; operations that
//! mutate the dictionary or the insertion-ordered sequence itself (open of a
//! new file, append/write with its eviction loop, remove) hold it for their
//! whole duration, since they may need to scan or rewrite that sequence.
//!
//! Eviction unlinks a victim from the dictionary and sequence immediately;
//! nothing waits for in-flight readers/writers of the victim to finish
//! first. An `Arc<FileEntry>` already checked out by another thread keeps
//! that file alive until it's done, and is simply not reachable by new
//! lookups — Rust's reference counting gives us the "destruction waits for
//! quiescence" property `file_destroy` had to hand-roll in C, for free. See
//! DESIGN.md.

mod file;

use std::collections::{HashMap, VecDeque};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use file::Waiter;
use file::FileEntry;

use crate::bail;
use crate::client::ClientId;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::OpenFlags;

pub struct OpenOutcome {
    pub evicted_waiters: Vec<Waiter>,
}

pub struct ReadOutcome {
    pub data: Vec<u8>,
}

pub struct ReadManyOutcome {
    pub files: Vec<(PathBuf, Vec<u8>)>,
}

pub struct AppendOutcome {
    pub evicted: Vec<(PathBuf, Vec<u8>)>,
    pub notify_not_found: Vec<Waiter>,
}

/// `append`'s eviction loop can unlink several victims before it discovers
/// there is still no room. Those unlinks already happened and are not
/// undone, so their displaced content and must-notify waiters ride along
/// even on failure.
pub struct AppendFailure {
    pub error: Error,
    pub evicted: Vec<(PathBuf, Vec<u8>)>,
    pub notify_not_found: Vec<Waiter>,
}

pub enum LockOutcome {
    Granted(UnixStream),
    /// The caller's socket is now owned by the pending-lock queue; the
    /// worker must not write a response or return the descriptor.
    Parked,
    NotFound(UnixStream),
}

pub struct UnlockOutcome {
    pub new_holder: Option<Waiter>,
}

pub struct RemoveOutcome {
    pub notify_not_found: Vec<Waiter>,
}

#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub file_number: usize,
    pub size: u64,
    pub peak_file_number: usize,
    pub peak_size: u64,
    pub evictions: u64,
}

struct StorageInner {
    dictionary: HashMap<PathBuf, Arc<FileEntry>>,
    order: VecDeque<Arc<FileEntry>>,
    size: u64,
    peak_file_number: usize,
    peak_size: u64,
    evictions: u64,
}

impl StorageInner {
    /// The first file in insertion order that has been modified since
    /// creation and isn't `spare` (the file the caller is actively
    /// appending to). Never-modified files are never picked: an empty or
    /// untouched file is not yet eligible for eviction.
    fn select_victim(&self, spare: Option<&Path>) -> Option<Arc<FileEntry>> {
        for file in &self.order {
            if spare == Some(file.pathname.as_path()) {
                continue;
            }
            if file.meta().modified {
                return Some(Arc::clone(file));
            }
        }
        None
    }

    fn unlink(&mut self, victim: &Arc<FileEntry>) -> VecDeque<Waiter> {
        self.dictionary.remove(&victim.pathname);
        if let Some(pos) = self.order.iter().position(|f| Arc::ptr_eq(f, victim)) {
            self.order.remove(pos);
        }
        self.size = self.size.saturating_sub(victim.size());
        std::mem::take(&mut victim.meta().pending_locks)
    }

    fn insert(&mut self, file: Arc<FileEntry>) {
        self.dictionary.insert(file.pathname.clone(), Arc::clone(&file));
        self.order.push_back(file);
        self.peak_file_number = self.peak_file_number.max(self.order.len());
    }
}

/// The shared, in-memory file store.
pub struct Storage {
    inner: Mutex<StorageInner>,
    max_file_number: usize,
    max_size: u64,
}

impl Storage {
    pub fn new(max_file_number: usize, max_size: u64) -> Self {
        Self {
            inner: Mutex::new(StorageInner {
                dictionary: HashMap::new(),
                order: VecDeque::new(),
                size: 0,
                peak_file_number: 0,
                peak_size: 0,
                evictions: 0,
            }),
            max_file_number,
            max_size,
        }
    }

    pub fn stats(&self) -> StorageStats {
        let inner = self.inner.lock().unwrap();
        StorageStats {
            file_number: inner.order.len(),
            size: inner.size,
            peak_file_number: inner.peak_file_number,
            peak_size: inner.peak_size,
            evictions: inner.evictions,
        }
    }

    pub fn open(&self, path: &Path, flags: OpenFlags, user: ClientId) -> Result<OpenOutcome> {
        if path.as_os_str().is_empty() {
            bail!(ErrorKind::Malformed, "empty pathname");
        }
        let create = flags.contains(OpenFlags::CREATE);
        let want_lock = flags.contains(OpenFlags::LOCK);

        let mut inner = self.inner.lock().unwrap();

        if let Some(file) = inner.dictionary.get(path).cloned() {
            if create {
                bail!(ErrorKind::AlreadyExists);
            }
            let mut meta = file.meta();
            if want_lock {
                match meta.locked_by {
                    None => meta.locked_by = Some(user),
                    Some(holder) if holder == user => {}
                    Some(_) => bail!(ErrorKind::Forbidden),
                }
            }
            meta.opened_by.insert(user);
            return Ok(OpenOutcome {
                evicted_waiters: Vec::new(),
            });
        }

        if !create {
            bail!(ErrorKind::NotFound);
        }

        let mut evicted_waiters = Vec::new();
        if inner.order.len() >= self.max_file_number {
            let victim = inner
                .select_victim(None)
                .ok_or_else(|| Error::new(ErrorKind::CapacityExceeded))?;
            evicted_waiters.extend(inner.unlink(&victim));
            inner.evictions += 1;
        }

        let file = Arc::new(FileEntry::new(path.to_path_buf()));
        {
            let mut meta = file.meta();
            meta.opened_by.insert(user);
            if want_lock {
                meta.locked_by = Some(user);
                meta.owner = Some(user);
            }
        }
        inner.insert(file);
        Ok(OpenOutcome { evicted_waiters })
    }

    pub fn read(&self, path: &Path, user: ClientId) -> Result<ReadOutcome> {
        let file = self.lookup(path)?;
        {
            let meta = file.meta();
            if !meta.opened_by.contains(&user) {
                bail!(ErrorKind::Forbidden);
            }
            if matches!(meta.locked_by, Some(holder) if holder != user) {
                bail!(ErrorKind::Forbidden);
            }
        }
        let data = file.snapshot();
        file.meta().owner = None;
        Ok(ReadOutcome { data })
    }

    /// Scans the insertion-ordered sequence for up to `up_to` non-empty
    /// files (or all of them, if `up_to <= 0`). NO_CONTENT if none qualify.
    pub fn read_many(&self, up_to: i64) -> Result<ReadManyOutcome> {
        let inner = self.inner.lock().unwrap();
        let limit = if up_to <= 0 { usize::MAX } else { up_to as usize };
        let mut files = Vec::new();
        for file in inner.order.iter() {
            if files.len() >= limit {
                break;
            }
            let data = file.snapshot();
            if data.is_empty() {
                continue;
            }
            files.push((file.pathname.clone(), data));
        }
        drop(inner);
        if files.is_empty() {
            bail!(ErrorKind::NoContent);
        }
        Ok(ReadManyOutcome { files })
    }

    /// Shared engine behind both `writeFile` and `appendToFile`; the two
    /// differ only in the access gate the caller applies (`can_write`)
    /// before calling this.
    pub fn append(
        &self,
        path: &Path,
        data: &[u8],
        user: ClientId,
    ) -> std::result::Result<AppendOutcome, AppendFailure> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .dictionary
            .get(path)
            .cloned()
            .ok_or_else(|| AppendFailure {
                error: Error::new(ErrorKind::NotFound),
                evicted: Vec::new(),
                notify_not_found: Vec::new(),
            })?;

        {
            let meta = file.meta();
            if !meta.opened_by.contains(&user) {
                return Err(AppendFailure {
                    error: Error::new(ErrorKind::Forbidden),
                    evicted: Vec::new(),
                    notify_not_found: Vec::new(),
                });
            }
            if matches!(meta.locked_by, Some(holder) if holder != user) {
                return Err(AppendFailure {
                    error: Error::new(ErrorKind::Forbidden),
                    evicted: Vec::new(),
                    notify_not_found: Vec::new(),
                });
            }
        }

        let current_len = file.size();
        let new_len = current_len + data.len() as u64;

        if new_len > self.max_size {
            return Err(AppendFailure {
                error: Error::with_detail(ErrorKind::CapacityExceeded, "payload exceeds storage capacity"),
                evicted: Vec::new(),
                notify_not_found: Vec::new(),
            });
        }

        let mut evicted = Vec::new();
        let mut notify_not_found = Vec::new();
        while inner.size - current_len + new_len > self.max_size {
            let victim = match inner.select_victim(Some(path)) {
                Some(v) => v,
                None => {
                    return Err(AppendFailure {
                        error: Error::new(ErrorKind::CapacityExceeded),
                        evicted,
                        notify_not_found,
                    })
                }
            };
            let victim_data = victim.snapshot();
            notify_not_found.extend(inner.unlink(&victim));
            evicted.push((victim.pathname.clone(), victim_data));
            inner.evictions += 1;
        }

        file.append(data);
        inner.size = inner.size - current_len + new_len;
        inner.peak_size = inner.peak_size.max(inner.size);
        let mut meta = file.meta();
        meta.modified = true;
        meta.owner = None;
        drop(meta);

        Ok(AppendOutcome {
            evicted,
            notify_not_found,
        })
    }

    /// Grants the lock immediately, or parks `stream` on the file's FIFO
    /// wait queue. Unlike every other operation here, a NOT_FOUND or
    /// FORBIDDEN-free success must still hand the socket back to the
    /// caller, so this returns an enum rather than a `Result`.
    pub fn lock(&self, path: &Path, user: ClientId, stream: UnixStream) -> LockOutcome {
        let file = match self.lookup(path) {
            Ok(file) => file,
            Err(_) => return LockOutcome::NotFound(stream),
        };
        let mut meta = file.meta();
        match meta.locked_by {
            None => {
                meta.locked_by = Some(user);
                meta.owner = None;
                LockOutcome::Granted(stream)
            }
            Some(holder) if holder == user => {
                meta.owner = None;
                LockOutcome::Granted(stream)
            }
            Some(_) => {
                meta.pending_locks.push_back(Waiter { client: user, stream });
                LockOutcome::Parked
            }
        }
    }

    pub fn unlock(&self, path: &Path, user: ClientId) -> Result<UnlockOutcome> {
        let file = self.lookup(path)?;
        let mut meta = file.meta();
        if meta.locked_by != Some(user) {
            bail!(ErrorKind::Forbidden);
        }
        let new_holder = meta.pending_locks.pop_front();
        meta.locked_by = new_holder.as_ref().map(|w| w.client);
        meta.owner = None;
        Ok(UnlockOutcome { new_holder })
    }

    pub fn close(&self, path: &Path, user: ClientId) -> Result<()> {
        let file = self.lookup(path)?;
        let mut meta = file.meta();
        if !meta.opened_by.remove(&user) {
            bail!(ErrorKind::Forbidden);
        }
        meta.owner = None;
        Ok(())
    }

    pub fn remove(&self, path: &Path, user: ClientId) -> Result<RemoveOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .dictionary
            .get(path)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        if file.meta().locked_by != Some(user) {
            bail!(ErrorKind::Forbidden);
        }
        let waiters = inner.unlink(&file);
        Ok(RemoveOutcome {
            notify_not_found: waiters.into(),
        })
    }

    /// Releases every hold `user` has across the whole store: drops it from
    /// every `opened_by` set, releases any lock it held (granting the next
    /// FIFO waiter, if any), and strikes it from every pending-lock queue it
    /// was parked in. Called once per disconnect, graceful or not.
    pub fn user_exit(&self, user: ClientId) -> Vec<Waiter> {
        let inner = self.inner.lock().unwrap();
        let mut granted = Vec::new();
        for file in inner.order.iter() {
            let mut meta = file.meta();
            if meta.locked_by == Some(user) {
                let new_holder = meta.pending_locks.pop_front();
                meta.locked_by = new_holder.as_ref().map(|w| w.client);
                if let Some(w) = new_holder {
                    granted.push(w);
                }
            }
            meta.pending_locks.retain(|w| w.client != user);
            meta.opened_by.remove(&user);
        }
        granted
    }

    /// Drains every parked lock waiter across the whole store, for use
    /// during shutdown so no client is left hanging on a socket nobody will
    /// ever write to again.
    pub fn drain_all_pending_locks(&self) -> Vec<Waiter> {
        let inner = self.inner.lock().unwrap();
        let mut drained = Vec::new();
        for file in inner.order.iter() {
            drained.extend(std::mem::take(&mut file.meta().pending_locks));
        }
        drained
    }

    /// `true` iff `path` exists and `user` is the sole owner allowed to
    /// call `writeFile` on it (the client that created and locked it, and
    /// who hasn't since read it or been overtaken by another write).
    pub fn can_write(&self, path: &Path, user: ClientId) -> bool {
        match self.lookup(path) {
            Ok(file) => file.meta().owner == Some(user),
            Err(_) => false,
        }
    }

    fn lookup(&self, path: &Path) -> Result<Arc<FileEntry>> {
        let inner = self.inner.lock().unwrap();
        inner
            .dictionary
            .get(path)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientIdAllocator;

    fn client(alloc: &ClientIdAllocator) -> ClientId {
        alloc.alloc()
    }

    #[test]
    fn create_open_read_round_trip() {
        let storage = Storage::new(16, 1 << 20);
        let alloc = ClientIdAllocator::new();
        let me = client(&alloc);
        let path = Path::new("/greeting");

        storage.open(path, OpenFlags::CREATE, me).unwrap();
        storage.append(path, b"hello", me).unwrap();
        let out = storage.read(path, me).unwrap();
        assert_eq!(out.data, b"hello");
    }

    #[test]
    fn create_without_flag_on_existing_file_fails() {
        let storage = Storage::new(16, 1 << 20);
        let alloc = ClientIdAllocator::new();
        let me = client(&alloc);
        let path = Path::new("/f");
        storage.open(path, OpenFlags::CREATE, me).unwrap();
        let err = storage.open(path, OpenFlags::CREATE, me).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn open_missing_without_create_is_not_found() {
        let storage = Storage::new(16, 1 << 20);
        let alloc = ClientIdAllocator::new();
        let me = client(&alloc);
        let err = storage.open(Path::new("/nope"), OpenFlags::empty(), me).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn append_requires_the_file_be_open_and_unlocked_by_someone_else() {
        let storage = Storage::new(16, 1 << 20);
        let alloc = ClientIdAllocator::new();
        let owner = client(&alloc);
        let stranger = client(&alloc);
        let path = Path::new("/f");

        storage.open(path, OpenFlags::CREATE, owner).unwrap();
        // never opened this file: forbidden regardless of a lock
        let err = storage.append(path, b"x", stranger).unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Forbidden);

        storage.open(path, OpenFlags::LOCK, owner).unwrap();
        storage.open(path, OpenFlags::empty(), stranger).unwrap();
        // opened, but someone else holds the lock
        let err = storage.append(path, b"x", stranger).unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn lock_queues_second_claimant() {
        let storage = Storage::new(16, 1 << 20);
        let alloc = ClientIdAllocator::new();
        let first = client(&alloc);
        let second = client(&alloc);
        let path = Path::new("/f");
        storage.open(path, OpenFlags::CREATE, first).unwrap();

        let (a, _b) = UnixStream::pair().unwrap();
        match storage.lock(path, first, a) {
            LockOutcome::Granted(_) => {}
            _ => panic!("expected immediate grant"),
        }

        let (c, _d) = UnixStream::pair().unwrap();
        match storage.lock(path, second, c) {
            LockOutcome::Parked => {}
            _ => panic!("expected the second claimant to park"),
        }

        let unlocked = storage.unlock(path, first).unwrap();
        assert!(unlocked.new_holder.is_some());
        assert_eq!(unlocked.new_holder.unwrap().client, second);
    }

    #[test]
    fn eviction_picks_first_modified_file() {
        let storage = Storage::new(1, 1 << 20);
        let alloc = ClientIdAllocator::new();
        let me = client(&alloc);

        storage.open(Path::new("/a"), OpenFlags::CREATE, me).unwrap();
        storage.append(Path::new("/a"), b"data", me).unwrap();

        let outcome = storage.open(Path::new("/b"), OpenFlags::CREATE, me).unwrap();
        assert!(outcome.evicted_waiters.is_empty());
        assert!(storage.read(Path::new("/b"), me).is_ok());
        let stats = storage.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.file_number, 1);
    }

    #[test]
    fn never_modified_file_is_not_evicted() {
        let storage = Storage::new(1, 1 << 20);
        let alloc = ClientIdAllocator::new();
        let me = client(&alloc);
        storage.open(Path::new("/a"), OpenFlags::CREATE, me).unwrap();
        let err = storage.open(Path::new("/b"), OpenFlags::CREATE, me).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    }

    #[test]
    fn read_many_skips_empty_files_and_respects_limit() {
        let storage = Storage::new(16, 1 << 20);
        let alloc = ClientIdAllocator::new();
        let me = client(&alloc);
        storage.open(Path::new("/empty"), OpenFlags::CREATE, me).unwrap();
        storage.open(Path::new("/a"), OpenFlags::CREATE, me).unwrap();
        storage.append(Path::new("/a"), b"x", me).unwrap();
        storage.open(Path::new("/b"), OpenFlags::CREATE, me).unwrap();
        storage.append(Path::new("/b"), b"y", me).unwrap();

        let out = storage.read_many(1).unwrap();
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.files[0].0, PathBuf::from("/a"));
    }

    #[test]
    fn read_many_on_empty_store_is_no_content() {
        let storage = Storage::new(16, 1 << 20);
        let err = storage.read_many(-1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoContent);
    }

    #[test]
    fn user_exit_releases_lock_to_next_waiter_and_forgets_queued_self() {
        let storage = Storage::new(16, 1 << 20);
        let alloc = ClientIdAllocator::new();
        let owner = client(&alloc);
        let waiter = client(&alloc);
        let path = Path::new("/f");
        storage.open(path, OpenFlags::CREATE | OpenFlags::LOCK, owner).unwrap();

        let (a, _b) = UnixStream::pair().unwrap();
        match storage.lock(path, waiter, a) {
            LockOutcome::Parked => {}
            _ => panic!("expected park"),
        }

        let granted = storage.user_exit(owner);
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].client, waiter);
    }

    #[test]
    fn append_too_large_for_capacity_fails_without_partial_state() {
        let storage = Storage::new(16, 4);
        let alloc = ClientIdAllocator::new();
        let me = client(&alloc);
        storage.open(Path::new("/f"), OpenFlags::CREATE, me).unwrap();
        let failure = storage.append(Path::new("/f"), b"way too big", me).unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::CapacityExceeded);
        assert!(failure.evicted.is_empty());
    }

    #[test]
    fn append_capacity_check_counts_existing_content_not_just_the_new_payload() {
        // max_size is 5; the file already holds 4 bytes, so a 3-byte append
        // (small on its own) makes the file's resulting size exceed max_size
        // and must fail outright rather than evicting other files to make
        // room for a request that could never fit regardless.
        let storage = Storage::new(16, 5);
        let alloc = ClientIdAllocator::new();
        let me = client(&alloc);
        storage.open(Path::new("/f"), OpenFlags::CREATE, me).unwrap();
        storage.append(Path::new("/f"), b"abcd", me).unwrap();

        storage.open(Path::new("/other"), OpenFlags::CREATE, me).unwrap();
        storage.append(Path::new("/other"), b"x", me).unwrap();

        let failure = storage.append(Path::new("/f"), b"xyz", me).unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::CapacityExceeded);
        assert!(failure.evicted.is_empty(), "must fail before evicting anything");
        assert!(storage.read(Path::new("/other"), me).is_ok(), "unrelated file must survive");
    }
}
