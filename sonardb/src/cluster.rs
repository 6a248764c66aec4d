/// A cluster store: the data of one cluster, either a persistent directory tree that can be read
/// and appended to, or a transient read-only view over an explicit list of files.
///
/// Lifecycle: a store is Open from creation until `close`, which moves it to Draining while the
/// append coordinator is flushed and stopped, and then to Closed.  Every operation on a store
/// that is not Open fails with `ClusterClosed`.  Appending to a read-only store fails with
/// `ReadOnlyDir`.
///
/// At most one persistent store, and hence one append coordinator, is open on a directory within
/// the process.  Opening a second fails with `AlreadyOpen` until the first is closed or dropped.
use crate::appender::Appender;
use crate::error::StoreError;
use crate::logtree::{find_files, FileKind};
use crate::reader::{read_files, ReadOptions, ReadResult};
use crate::sacct::{parse_sacct_file, SacctRecord};
use crate::sample::Sample;
use crate::samplefile::parse_sample_file;
use crate::sysinfo::{parse_sysinfo_file, SysinfoRecord};

use anyhow::{bail, Context, Result};
use rustutils::{parse_timestamp, HostGlobber, Timestamp};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Tuning knobs for a store.

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub read: ReadOptions,
    pub queue_depth: usize,
    pub timestamp_slack: chrono::Duration,
}

impl Default for StoreOptions {
    fn default() -> StoreOptions {
        StoreOptions {
            read: ReadOptions::default(),
            queue_depth: 1024,
            timestamp_slack: chrono::Duration::hours(25),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Open(OpenMode),
    Draining,
    Closed,
}

enum Source {
    Files(Vec<PathBuf>),
    Tree(PathBuf),
}

// Canonical paths of the directories that have an open persistent store.

static PERSISTENT_DIRS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn persistent_dirs() -> std::sync::MutexGuard<'static, HashSet<PathBuf>> {
    PERSISTENT_DIRS
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

// Holds a directory's entry in the registry; the entry is removed when this is dropped.

struct Registration(PathBuf);

impl Registration {
    fn claim(dir: &Path) -> Result<Registration> {
        let canonical = dir
            .canonicalize()
            .context("Not a viable data directory")?;
        if !persistent_dirs().insert(canonical.clone()) {
            return Err(StoreError::AlreadyOpen.into());
        }
        Ok(Registration(canonical))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        persistent_dirs().remove(&self.0);
    }
}

// Fields drop in order: the appender is stopped before the registration is released.

struct Inner {
    state: StoreState,
    appender: Option<Appender>,
    registration: Option<Registration>,
}

pub struct ClusterStore {
    source: Source,
    options: StoreOptions,
    inner: Mutex<Inner>,
}

impl ClusterStore {
    /// A read-only store over exactly `files`.  The files are not checked until they are read.
    pub fn open_read_only(files: Vec<PathBuf>, options: StoreOptions) -> ClusterStore {
        ClusterStore {
            source: Source::Files(files),
            options,
            inner: Mutex::new(Inner {
                state: StoreState::Open(OpenMode::ReadOnly),
                appender: None,
                registration: None,
            }),
        }
    }

    /// A read-only store over the tree rooted at `dir`, which must exist.
    pub fn open_tree_read_only(dir: &Path, options: StoreOptions) -> Result<ClusterStore> {
        if !dir.is_dir() {
            // Path redacted so as not to reveal secrets
            bail!("Not a viable data directory");
        }
        Ok(ClusterStore {
            source: Source::Tree(dir.to_path_buf()),
            options,
            inner: Mutex::new(Inner {
                state: StoreState::Open(OpenMode::ReadOnly),
                appender: None,
                registration: None,
            }),
        })
    }

    /// A read-write store owning the tree rooted at `dir`, which must exist.
    pub fn open_persistent(dir: &Path, options: StoreOptions) -> Result<ClusterStore> {
        if !dir.is_dir() {
            // Path redacted so as not to reveal secrets
            bail!("Not a viable data directory");
        }
        let registration = Registration::claim(dir)?;
        let appender = Appender::start(dir, options.queue_depth, options.timestamp_slack)?;
        Ok(ClusterStore {
            source: Source::Tree(dir.to_path_buf()),
            options,
            inner: Mutex::new(Inner {
                state: StoreState::Open(OpenMode::Persistent),
                appender: Some(appender),
                registration: Some(registration),
            }),
        })
    }

    pub fn state(&self) -> StoreState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_open(&self) -> Result<()> {
        match self.lock().state {
            StoreState::Open(_) => Ok(()),
            _ => Err(StoreError::ClusterClosed.into()),
        }
    }

    /// The files of `kind` for the window and hosts.  For a read-only store that is the subset of
    /// its files whose names denote the kind and match the host filter; the window is not used.
    pub fn files(
        &self,
        kind: FileKind,
        hosts: &HostGlobber,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<PathBuf>> {
        self.check_open()?;
        match &self.source {
            Source::Tree(root) => find_files(root, kind, hosts, from, to),
            Source::Files(files) => Ok(files
                .iter()
                .filter(|p| {
                    let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    match kind.host_of(name) {
                        Some(h) => {
                            kind == FileKind::Sacct || hosts.is_empty() || hosts.match_hostname(h)
                        }
                        None => false,
                    }
                })
                .cloned()
                .collect::<Vec<PathBuf>>()),
        }
    }

    pub fn read_samples(
        &self,
        hosts: &HostGlobber,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<ReadResult<Sample>> {
        let files = self.files(FileKind::Sample, hosts, from, to)?;
        Ok(read_files(&files, &self.options.read, parse_sample_file))
    }

    pub fn read_sysinfo(
        &self,
        hosts: &HostGlobber,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<ReadResult<SysinfoRecord>> {
        let files = self.files(FileKind::Sysinfo, hosts, from, to)?;
        Ok(read_files(&files, &self.options.read, parse_sysinfo_file))
    }

    pub fn read_sacct(&self, from: Timestamp, to: Timestamp) -> Result<ReadResult<SacctRecord>> {
        let files = self.files(FileKind::Sacct, &HostGlobber::new(true), from, to)?;
        Ok(read_files(&files, &self.options.read, parse_sacct_file))
    }

    pub fn append_sample(&self, host: &str, timestamp: &str, line: &str) -> Result<()> {
        self.append(FileKind::Sample, host, timestamp, line)
    }

    pub fn append_sysinfo(&self, host: &str, timestamp: &str, payload: &str) -> Result<()> {
        self.append(FileKind::Sysinfo, host, timestamp, payload)
    }

    pub fn append_sacct(&self, timestamp: &str, line: &str) -> Result<()> {
        self.append(FileKind::Sacct, "", timestamp, line)
    }

    // The lock is not held while sending, as the send may block on a full queue.

    fn append(&self, kind: FileKind, host: &str, timestamp: &str, line: &str) -> Result<()> {
        let t = parse_timestamp(timestamp).map_err(|_| StoreError::BadTimestamp)?;
        let sender = {
            let inner = self.lock();
            match (inner.state, &inner.appender) {
                (StoreState::Open(OpenMode::Persistent), Some(a)) => a.sender(),
                (StoreState::Open(_), _) => return Err(StoreError::ReadOnlyDir.into()),
                _ => return Err(StoreError::ClusterClosed.into()),
            }
        };
        sender.append(kind, host, t, line)
    }

    /// Wait for queued appends to reach the disk.  Returns any write error since the last flush.
    pub fn flush(&self) -> Result<()> {
        let sender = {
            let inner = self.lock();
            match (inner.state, &inner.appender) {
                (StoreState::Open(_), Some(a)) => a.sender(),
                (StoreState::Open(_), None) => return Ok(()),
                _ => return Err(StoreError::ClusterClosed.into()),
            }
        };
        sender.flush()
    }

    /// Flush and stop the append coordinator, if any, and release the directory for another
    /// persistent store.
    pub fn close(&self) -> Result<()> {
        let (appender, registration) = {
            let mut inner = self.lock();
            match inner.state {
                StoreState::Open(_) => {}
                _ => return Err(StoreError::ClusterClosed.into()),
            }
            inner.state = StoreState::Draining;
            (inner.appender.take(), inner.registration.take())
        };
        let res = match appender {
            Some(a) => a.close(),
            None => Ok(()),
        };
        drop(registration);
        self.lock().state = StoreState::Closed;
        res
    }
}

#[cfg(test)]
use crate::error::is_store_error;

#[cfg(test)]
use rustutils::{epoch, far_future, now};

#[test]
fn test_store_lifecycle() {
    let td = tempfile::TempDir::new().unwrap();
    let store = ClusterStore::open_persistent(td.path(), StoreOptions::default()).unwrap();
    assert!(store.state() == StoreState::Open(OpenMode::Persistent));

    let t = now();
    let ts = t.to_rfc3339();
    let line = format!("v=1,time={ts},host=h1,user=u,cmd=c,pid=17");
    store.append_sample("h1", &ts, &line).unwrap();
    store.append_sacct(&ts, "v=1,JobIDRaw=5,End=Unknown").unwrap();
    store.flush().unwrap();

    let all = HostGlobber::new(true);
    let t1 = t + chrono::Duration::seconds(1);
    let r = store.read_samples(&all, t, t1).unwrap();
    assert_eq!(r.num_records(), 1);
    assert!(r.records[0][0].pid == 17);
    let r = store.read_sacct(t, t1).unwrap();
    assert_eq!(r.num_records(), 1);

    // Bad timestamps are rejected and nothing is queued.
    let future = (t + chrono::Duration::hours(48)).to_rfc3339();
    let e = store.append_sample("h1", &future, "v=1").err().unwrap();
    assert!(is_store_error(&e, StoreError::BadTimestamp));
    let e = store.append_sample("h1", "garbage", "v=1").err().unwrap();
    assert!(is_store_error(&e, StoreError::BadTimestamp));

    store.close().unwrap();
    assert!(store.state() == StoreState::Closed);
    let e = store.append_sample("h1", &ts, &line).err().unwrap();
    assert!(is_store_error(&e, StoreError::ClusterClosed));
    let e = store.read_samples(&all, t, t1).err().unwrap();
    assert!(is_store_error(&e, StoreError::ClusterClosed));
    let e = store.flush().err().unwrap();
    assert!(is_store_error(&e, StoreError::ClusterClosed));
    let e = store.close().err().unwrap();
    assert!(is_store_error(&e, StoreError::ClusterClosed));
}

#[test]
fn test_read_only_store() {
    let td = tempfile::TempDir::new().unwrap();
    let a = td.path().join("a.csv");
    let b = td.path().join("b.csv");
    let s = td.path().join("sacct.csv");
    std::fs::write(&a, "v=1,time=2024-01-01T00:00:00Z,host=a,user=u,cmd=c\n").unwrap();
    std::fs::write(&b, "v=1,time=2024-01-01T00:00:00Z,host=b,user=u,cmd=c\n").unwrap();
    std::fs::write(&s, "v=1,JobIDRaw=5,End=Unknown\n").unwrap();
    let store = ClusterStore::open_read_only(vec![a, b, s], StoreOptions::default());

    let r = store.read_samples(&HostGlobber::new(true), epoch(), far_future()).unwrap();
    assert_eq!(r.num_records(), 2);
    let hosts = HostGlobber::from_multi_pattern(true, "b").unwrap();
    let r = store.read_samples(&hosts, epoch(), far_future()).unwrap();
    assert_eq!(r.num_records(), 1);
    let r = store.read_sacct(epoch(), far_future()).unwrap();
    assert_eq!(r.num_records(), 1);

    let ts = now().to_rfc3339();
    let e = store.append_sample("a", &ts, "v=1").err().unwrap();
    assert!(is_store_error(&e, StoreError::ReadOnlyDir));
    assert!(store.flush().is_ok());
    store.close().unwrap();
    let e = store.append_sample("a", &ts, "v=1").err().unwrap();
    assert!(is_store_error(&e, StoreError::ClusterClosed));
}

#[test]
fn test_window_with_no_files() {
    let td = tempfile::TempDir::new().unwrap();
    let store = ClusterStore::open_persistent(td.path(), StoreOptions::default()).unwrap();
    let r = store
        .read_samples(
            &HostGlobber::new(true),
            rustutils::timestamp_from_ymd(2020, 1, 1),
            rustutils::timestamp_from_ymd(2020, 2, 1),
        )
        .unwrap();
    assert!(r.records.is_empty());
    assert!(r.status().is_ok());
    assert!(ClusterStore::open_persistent(&td.path().join("x"), StoreOptions::default()).is_err());
}

#[test]
fn test_read_only_tree() {
    let td = tempfile::TempDir::new().unwrap();
    let writer = ClusterStore::open_persistent(td.path(), StoreOptions::default()).unwrap();
    let t = now();
    let ts = t.to_rfc3339();
    writer
        .append_sample("h1", &ts, &format!("v=1,time={ts},host=h1,user=u,cmd=c,pid=3"))
        .unwrap();
    writer.close().unwrap();

    let reader = ClusterStore::open_tree_read_only(td.path(), StoreOptions::default()).unwrap();
    assert!(reader.state() == StoreState::Open(OpenMode::ReadOnly));
    let r = reader
        .read_samples(&HostGlobber::new(true), t, t + chrono::Duration::seconds(1))
        .unwrap();
    assert_eq!(r.num_records(), 1);
    let e = reader.append_sample("h1", &ts, "v=1").err().unwrap();
    assert!(is_store_error(&e, StoreError::ReadOnlyDir));
    assert!(ClusterStore::open_tree_read_only(&td.path().join("nope"), StoreOptions::default()).is_err());
}

#[test]
fn test_one_persistent_store_per_dir() {
    let td = tempfile::TempDir::new().unwrap();
    let first = ClusterStore::open_persistent(td.path(), StoreOptions::default()).unwrap();
    let e = ClusterStore::open_persistent(td.path(), StoreOptions::default()).err().unwrap();
    assert!(is_store_error(&e, StoreError::AlreadyOpen));

    // Another spelling of the same directory is the same directory.
    let other = td.path().join(".");
    let e = ClusterStore::open_persistent(&other, StoreOptions::default()).err().unwrap();
    assert!(is_store_error(&e, StoreError::AlreadyOpen));

    // Readers are not affected.
    let reader = ClusterStore::open_tree_read_only(td.path(), StoreOptions::default()).unwrap();
    reader.close().unwrap();

    let ts = now().to_rfc3339();
    first.append_sacct(&ts, "v=1,JobIDRaw=5,End=Unknown").unwrap();
    first.close().unwrap();

    // Closing releases the directory, and so does dropping.
    let second = ClusterStore::open_persistent(td.path(), StoreOptions::default()).unwrap();
    drop(second);
    let third = ClusterStore::open_persistent(td.path(), StoreOptions::default()).unwrap();
    third.close().unwrap();
}

#[test]
fn test_concurrent_appends_and_flushes() {
    let td = tempfile::TempDir::new().unwrap();
    let options = StoreOptions {
        queue_depth: 1,
        ..Default::default()
    };
    let store = ClusterStore::open_persistent(td.path(), options).unwrap();
    let t = now();
    let ts = t.to_rfc3339();
    std::thread::scope(|s| {
        for h in 0..4 {
            let store = &store;
            let ts = &ts;
            s.spawn(move || {
                for i in 0..50 {
                    let line = format!("v=1,time={ts},host=h{h},user=u,cmd=c,pid={}", i + 1);
                    store.append_sample(&format!("h{h}"), ts, &line).unwrap();
                }
            });
        }
        // Flushes interleave with producers that are blocked on the full queue.
        for _ in 0..10 {
            store.flush().unwrap();
        }
    });
    store.close().unwrap();

    let reader = ClusterStore::open_tree_read_only(td.path(), StoreOptions::default()).unwrap();
    let r = reader
        .read_samples(&HostGlobber::new(true), t, t + chrono::Duration::seconds(1))
        .unwrap();
    assert_eq!(r.num_records(), 200);
}
