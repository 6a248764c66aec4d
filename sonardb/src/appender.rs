/// The append coordinator: a single writer thread per cluster that owns every day-file handle of
/// that cluster.
///
/// Appends are validated on the caller's thread, then sent to the writer over a bounded queue and
/// return immediately.  The writer appends each record to its day-file with a single write of the
/// record plus newline, so a record is either on disk in full or not at all.  A failed write is
/// retried once on a fresh handle; if that fails too the record is dropped with a warning and the
/// error is kept until the next `flush`, which reports it.
///
/// `flush` waits for everything queued before it, fsyncs and closes all open handles, and
/// returns the first I/O error retained since the previous flush, if any.
use crate::error::StoreError;
use crate::logtree::{data_file, FileKind};

use anyhow::{anyhow, Context, Result};
use rustutils::{now, Timestamp};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

/// Records longer than this, including the newline, are rejected.
pub const MAX_RECORD_BYTES: usize = 4096;

struct AppendWork {
    kind: FileKind,
    host: String,
    timestamp: Timestamp,
    line: String,
}

enum AppendCommand {
    Append(AppendWork),
    Flush(mpsc::Sender<Result<()>>),
}

pub struct Appender {
    sender: AppendSender,
    handle: Option<thread::JoinHandle<()>>,
}

/// The sending end of a writer's queue.  Clones may be used from any thread while the writer
/// lives; once it has stopped every operation fails with `ClusterClosed`.

#[derive(Clone)]
pub struct AppendSender {
    tx: mpsc::SyncSender<AppendCommand>,
    slack: chrono::Duration,
}

impl Appender {
    /// Spawn the writer for the tree rooted at `root`.  `queue_depth` bounds the number of records
    /// in flight; `slack` is how far from the current time a record's timestamp may be.
    pub fn start(root: &Path, queue_depth: usize, slack: chrono::Duration) -> Result<Appender> {
        let (tx, rx) = mpsc::sync_channel(queue_depth.max(1));
        let root = root.to_path_buf();
        let handle = thread::Builder::new()
            .name("sonardb-append".to_string())
            .spawn(move || append_worker(&root, rx))
            .context("spawn append thread")?;
        Ok(Appender {
            sender: AppendSender { tx, slack },
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> AppendSender {
        self.sender.clone()
    }

    pub fn append(
        &self,
        kind: FileKind,
        host: &str,
        timestamp: Timestamp,
        line: &str,
    ) -> Result<()> {
        self.sender.append(kind, host, timestamp, line)
    }

    pub fn flush(&self) -> Result<()> {
        self.sender.flush()
    }

    /// Flush, then stop the writer and wait for it.
    pub fn close(mut self) -> Result<()> {
        let res = self.flush();
        self.stop();
        res
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // The writer exits when the queue is disconnected, so replace our end with a dead one.
            // Clones handed out by `sender` keep it alive until they are dropped.
            let (dead, _) = mpsc::sync_channel(0);
            drop(std::mem::replace(&mut self.sender.tx, dead));
            if handle.join().is_err() {
                tracing::error!("Append thread panicked");
            }
        }
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AppendSender {
    /// Queue `line` for the day-file of `kind` for `host` on the day of `timestamp`.  Errors:
    /// `BadTimestamp` if the timestamp is too far from now, an error if the record is too long or
    /// contains a newline, `ClusterClosed` if the writer has stopped.  Nothing is queued on error.
    pub fn append(
        &self,
        kind: FileKind,
        host: &str,
        timestamp: Timestamp,
        line: &str,
    ) -> Result<()> {
        let t = now();
        if timestamp < t - self.slack || timestamp > t + self.slack {
            return Err(StoreError::BadTimestamp.into());
        }
        if line.contains('\n') {
            return Err(anyhow!("Record contains a newline"));
        }
        if line.len() + 1 > MAX_RECORD_BYTES {
            return Err(anyhow!(
                "Record too long: {} bytes, max {}",
                line.len() + 1,
                MAX_RECORD_BYTES
            ));
        }
        if line.is_empty() {
            return Ok(());
        }
        self.tx
            .send(AppendCommand::Append(AppendWork {
                kind,
                host: host.to_string(),
                timestamp,
                line: line.to_string(),
            }))
            .map_err(|_| anyhow::Error::from(StoreError::ClusterClosed))
    }

    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.tx
            .send(AppendCommand::Flush(tx))
            .map_err(|_| anyhow::Error::from(StoreError::ClusterClosed))?;
        rx.recv()
            .map_err(|_| anyhow::Error::from(StoreError::ClusterClosed))?
    }
}

struct WriterState {
    root: PathBuf,
    files: HashMap<PathBuf, File>,
    retained: Option<anyhow::Error>,
    failures: usize,
}

fn append_worker(root: &Path, rx: mpsc::Receiver<AppendCommand>) {
    let mut state = WriterState {
        root: root.to_path_buf(),
        files: HashMap::new(),
        retained: None,
        failures: 0,
    };
    // Drains everything queued before the sender went away.
    while let Ok(cmd) = rx.recv() {
        match cmd {
            AppendCommand::Append(work) => state.append(&work),
            AppendCommand::Flush(tx) => {
                let _ = tx.send(state.flush());
            }
        }
    }
    let _ = state.flush();
}

impl WriterState {
    fn append(&mut self, work: &AppendWork) {
        let path = data_file(&self.root, work.kind, &work.host, work.timestamp);
        let mut buf = Vec::with_capacity(work.line.len() + 1);
        buf.extend_from_slice(work.line.as_bytes());
        buf.push(b'\n');

        if let Err(first) = self.write_record(&path, &buf) {
            tracing::debug!("Append to {} failed, retrying: {first}", path.display());
            // The handle may be bad, get a new one.
            self.files.remove(&path);
            if let Err(e) = self.write_record(&path, &buf) {
                self.files.remove(&path);
                tracing::warn!("Dropping record for {}: {e}", path.display());
                self.failures += 1;
                if self.retained.is_none() {
                    self.retained = Some(e.context(format!("Appending to {}", path.display())));
                }
            }
        }
    }

    fn write_record(&mut self, path: &Path, buf: &[u8]) -> Result<()> {
        if !self.files.contains_key(path) {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let f = OpenOptions::new().create(true).append(true).open(path)?;
            self.files.insert(path.to_path_buf(), f);
        }
        match self.files.get_mut(path) {
            Some(f) => Ok(f.write_all(buf)?),
            None => Err(anyhow!("No handle for {}", path.display())),
        }
    }

    fn flush(&mut self) -> Result<()> {
        for (path, f) in self.files.drain() {
            if let Err(e) = f.sync_all() {
                tracing::warn!("Sync of {} failed: {e}", path.display());
                if self.retained.is_none() {
                    let e = anyhow::Error::from(e);
                    self.retained = Some(e.context(format!("Syncing {}", path.display())));
                }
            }
        }
        let failures = std::mem::take(&mut self.failures);
        match self.retained.take() {
            None => Ok(()),
            Some(e) if failures > 1 => Err(e.context(format!("{failures} records dropped"))),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
use crate::error::is_store_error;

#[test]
fn test_append_and_flush() {
    let td = tempfile::TempDir::new().unwrap();
    let a = Appender::start(td.path(), 4, chrono::Duration::hours(25)).unwrap();
    let t = now();
    for i in 0..10 {
        a.append(FileKind::Sample, "h1", t, &format!("v=1,n={i}")).unwrap();
    }
    a.append(FileKind::Sacct, "", t, "v=1,JobID=1").unwrap();
    a.flush().unwrap();
    let text = fs::read_to_string(data_file(td.path(), FileKind::Sample, "h1", t)).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert_eq!(lines.len(), 10);
    assert_eq!(lines[0], "v=1,n=0");
    assert_eq!(lines[9], "v=1,n=9");
    assert!(data_file(td.path(), FileKind::Sacct, "", t).exists());

    // Appending after a flush reopens and extends the file.
    a.append(FileKind::Sample, "h1", t, "v=1,n=10").unwrap();
    a.close().unwrap();
    let text = fs::read_to_string(data_file(td.path(), FileKind::Sample, "h1", t)).unwrap();
    assert_eq!(text.lines().count(), 11);
}

#[test]
fn test_append_rejects() {
    let td = tempfile::TempDir::new().unwrap();
    let a = Appender::start(td.path(), 4, chrono::Duration::hours(25)).unwrap();
    let future = now() + chrono::Duration::hours(48);
    let e = a.append(FileKind::Sample, "h1", future, "v=1").err().unwrap();
    assert!(is_store_error(&e, StoreError::BadTimestamp));
    let past = now() - chrono::Duration::hours(26);
    let e = a.append(FileKind::Sample, "h1", past, "v=1").err().unwrap();
    assert!(is_store_error(&e, StoreError::BadTimestamp));
    let big = "x".repeat(MAX_RECORD_BYTES);
    assert!(a.append(FileKind::Sample, "h1", now(), &big).is_err());
    assert!(a.append(FileKind::Sample, "h1", now(), "a\nb").is_err());
    a.flush().unwrap();
    // Nothing was written.
    assert!(fs::read_dir(td.path()).unwrap().next().is_none());
}

#[test]
fn test_append_error_retained() {
    let td = tempfile::TempDir::new().unwrap();
    let t = now();
    // A plain file where the day directory should be makes every write fail.
    let day = crate::logtree::day_dir(td.path(), t);
    fs::create_dir_all(day.parent().unwrap()).unwrap();
    fs::write(&day, "").unwrap();

    let a = Appender::start(td.path(), 4, chrono::Duration::hours(25)).unwrap();
    a.append(FileKind::Sample, "h1", t, "v=1").unwrap();
    a.append(FileKind::Sample, "h1", t, "v=2").unwrap();
    assert!(a.flush().is_err());
    // The error is reported once.
    assert!(a.flush().is_ok());
}
