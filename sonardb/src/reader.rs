/// Parallel reading of data files, and deduplication of the records read.
///
/// Files are parsed by a bounded pool of scoped worker threads that pull file indices from a
/// shared counter.  Each file's records end up at that file's index in the result, so the result
/// does not depend on how the work was scheduled.  A file that cannot be read is logged, counted
/// and skipped.  Workers check the cancellation token before starting on a file; a cancelled read
/// still returns what was parsed.
use crate::error::StoreError;
use crate::sacct::SacctRecord;
use crate::sample::Sample;
use crate::samplefile::DecodeStats;
use crate::sysinfo::SysinfoRecord;

use anyhow::Result;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// A shareable cancellation flag.  Clones observe the same flag.

#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub workers: usize,
    pub cancel: CancelToken,
}

impl Default for ReadOptions {
    fn default() -> ReadOptions {
        ReadOptions {
            workers: default_workers(),
            cancel: CancelToken::new(),
        }
    }
}

/// The available parallelism, at least 1.

pub fn default_workers() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// The records read, one inner vector per file in the order of the file list.

#[derive(Debug)]
pub struct ReadResult<T> {
    pub records: Vec<Vec<Box<T>>>,
    pub records_dropped: usize,
    pub bad_timestamps: usize,
    pub files_failed: usize,
    pub cancelled: bool,
}

impl<T> Default for ReadResult<T> {
    fn default() -> ReadResult<T> {
        ReadResult {
            records: vec![],
            records_dropped: 0,
            bad_timestamps: 0,
            files_failed: 0,
            cancelled: false,
        }
    }
}

impl<T> ReadResult<T> {
    pub fn num_records(&self) -> usize {
        self.records.iter().map(|v| v.len()).sum()
    }

    /// `StoreError::Cancelled` if the read was cancelled.  The records are valid either way.
    pub fn status(&self) -> Result<()> {
        if self.cancelled {
            Err(StoreError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

struct FileResult<T> {
    index: usize,
    records: Vec<Box<T>>,
    stats: DecodeStats,
    failed: bool,
}

/// Parse `files` with `parse` using up to `opts.workers` threads.

pub fn read_files<T, F>(files: &[PathBuf], opts: &ReadOptions, parse: F) -> ReadResult<T>
where
    T: Send,
    F: Fn(&Path, &mut Vec<Box<T>>) -> Result<DecodeStats> + Sync,
{
    let mut result = ReadResult::<T>::default();
    if files.is_empty() {
        return result;
    }

    let next = &AtomicUsize::new(0);
    let parse = &parse;
    let workers = opts.workers.clamp(1, files.len());
    let per_worker = thread::scope(|s| {
        let handles = (0..workers)
            .map(|_| {
                s.spawn(move || {
                    let mut mine = vec![];
                    loop {
                        if opts.cancel.is_cancelled() {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        if index >= files.len() {
                            break;
                        }
                        let mut records = vec![];
                        match parse(files[index].as_path(), &mut records) {
                            Ok(stats) => mine.push(FileResult {
                                index,
                                records,
                                stats,
                                failed: false,
                            }),
                            Err(e) => {
                                tracing::warn!("Skipping {}: {e}", files[index].display());
                                mine.push(FileResult {
                                    index,
                                    records: vec![],
                                    stats: DecodeStats::default(),
                                    failed: true,
                                })
                            }
                        }
                    }
                    mine
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(v) => v,
                Err(e) => std::panic::resume_unwind(e),
            })
            .collect::<Vec<Vec<FileResult<T>>>>()
    });

    let mut slots = (0..files.len()).map(|_| vec![]).collect::<Vec<Vec<Box<T>>>>();
    let mut done = 0;
    for fr in per_worker.into_iter().flatten() {
        done += 1;
        result.records_dropped += fr.stats.discarded;
        result.bad_timestamps += fr.stats.bad_timestamps;
        if fr.failed {
            result.files_failed += 1;
        }
        slots[fr.index] = fr.records;
    }
    result.records = slots;
    result.cancelled = done < files.len();
    tracing::debug!(
        "Read {} files: {} records, {} dropped at decode, {} files failed",
        done,
        result.num_records(),
        result.records_dropped,
        result.files_failed
    );
    result
}

/// Flatten the per-file vectors, keeping only the last record seen for each key.  A record keeps
/// the position where its key was first seen.

pub fn dedup_by_key<T, K, F>(records: Vec<Vec<Box<T>>>, key: F) -> Vec<Box<T>>
where
    K: Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut index = HashMap::<K, usize>::new();
    let mut out = Vec::<Box<T>>::new();
    for r in records.into_iter().flatten() {
        let k = key(&r);
        if let Some(ix) = index.get(&k) {
            out[*ix] = r;
        } else {
            index.insert(k, out.len());
            out.push(r);
        }
    }
    out
}

pub fn sample_key(s: &Sample) -> (u32, i64, u32, u32, u32) {
    (
        s.hostname.id(),
        s.timestamp.timestamp(),
        s.pid,
        s.job_id,
        s.command.id(),
    )
}

pub fn sacct_key(r: &SacctRecord) -> (u32, u32) {
    (r.job_id, r.job_step.id())
}

pub fn sysinfo_key(r: &SysinfoRecord) -> (u32, i64) {
    (r.hostname.id(), r.timestamp.timestamp())
}

pub fn dedup_samples(records: Vec<Vec<Box<Sample>>>) -> Vec<Box<Sample>> {
    dedup_by_key(records, sample_key)
}

pub fn dedup_sacct(records: Vec<Vec<Box<SacctRecord>>>) -> Vec<Box<SacctRecord>> {
    dedup_by_key(records, sacct_key)
}

pub fn dedup_sysinfo(records: Vec<Vec<Box<SysinfoRecord>>>) -> Vec<Box<SysinfoRecord>> {
    dedup_by_key(records, sysinfo_key)
}

#[cfg(test)]
use crate::samplefile::parse_sample_file;

#[cfg(test)]
fn write_files(dir: &Path, contents: &[&str]) -> Vec<PathBuf> {
    contents
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let p = dir.join(format!("f{i:03}.csv"));
            std::fs::write(&p, c).unwrap();
            p
        })
        .collect::<Vec<PathBuf>>()
}

#[test]
fn test_read_files_ordered() {
    let td = tempfile::TempDir::new().unwrap();
    let contents = (0..20)
        .map(|i| {
            format!(
                "v=1,time=2024-01-01T00:{i:02}:00Z,host=h,user=u,cmd=c,pid={i}\nv=1,junk\n"
            )
        })
        .collect::<Vec<String>>();
    let mut files = write_files(
        td.path(),
        &contents.iter().map(|s| s.as_str()).collect::<Vec<&str>>(),
    );
    files.push(td.path().join("missing.csv"));
    for workers in [1, 3, 16] {
        let opts = ReadOptions {
            workers,
            cancel: CancelToken::new(),
        };
        let r = read_files(&files, &opts, parse_sample_file);
        assert!(r.status().is_ok());
        assert_eq!(r.records.len(), 21);
        assert_eq!(r.num_records(), 20);
        assert_eq!(r.records_dropped, 20);
        assert_eq!(r.files_failed, 1);
        for i in 0..20 {
            assert!(r.records[i][0].pid == i as u32);
        }
    }
}

#[test]
fn test_read_files_cancelled() {
    let td = tempfile::TempDir::new().unwrap();
    let files = write_files(td.path(), &["v=1,time=2024-01-01T00:00:00Z,host=h,user=u,cmd=c\n"]);
    let opts = ReadOptions::default();
    opts.cancel.cancel();
    let r = read_files(&files, &opts, parse_sample_file);
    assert!(crate::error::is_store_error(
        &r.status().err().unwrap(),
        StoreError::Cancelled
    ));
    assert_eq!(r.num_records(), 0);

    let r = read_files::<Sample, _>(&[], &ReadOptions::default(), parse_sample_file);
    assert!(r.status().is_ok() && r.records.is_empty());
}

#[test]
fn test_dedup() {
    let td = tempfile::TempDir::new().unwrap();
    let a = "v=1,time=2024-01-01T00:00:00Z,host=h,user=u,cmd=c,pid=1,cpu%=1
v=1,time=2024-01-01T00:05:00Z,host=h,user=u,cmd=c,pid=1,cpu%=2
v=1,time=2024-01-01T00:05:00Z,host=h,user=u,cmd=c,pid=1,job=7,cpu%=3
";
    let b = "v=1,time=2024-01-01T00:05:00Z,host=h,user=u,cmd=c,pid=1,cpu%=4
v=1,time=2024-01-01T00:10:00Z,host=h,user=u,cmd=c,pid=1,cpu%=5
";
    let files = write_files(td.path(), &[a, b]);
    let r = read_files(&files, &ReadOptions::default(), parse_sample_file);
    let xs = dedup_samples(r.records);
    assert_eq!(xs.len(), 4);
    assert!(xs[0].cpu_pct == 1.0);
    assert!(xs[1].cpu_pct == 4.0);
    assert!(xs[2].cpu_pct == 3.0);
    assert!(xs[3].cpu_pct == 5.0);

    // Reading the same file twice gives the same set as reading it once.
    let once = read_files(&files[..1], &ReadOptions::default(), parse_sample_file);
    let twice = read_files(
        &[files[0].clone(), files[0].clone()],
        &ReadOptions::default(),
        parse_sample_file,
    );
    assert!(dedup_samples(once.records) == dedup_samples(twice.records));
}
