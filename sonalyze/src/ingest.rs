/// The `add` operation: append records from stdin or a command's output to the cluster store.
///
/// Sample and sacct input is one record per line, sysinfo input is one JSON document.  Each record
/// is decoded to find its host and time before it is appended.  Records whose timestamp is bad or
/// outside the window the store accepts are counted and skipped, as are records that do not
/// decode; other errors abort the operation.
use crate::{cluster_dir, command, AddCmdArgs};

use anyhow::{Context, Result};
use sonardb::{decode_sample, decode_sysinfo, encode_sysinfo, is_store_error, parse_sacct};
use sonardb::{ClusterStore, StoreError, StoreOptions};
use std::io::{self, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Sample,
    Sysinfo,
    Sacct,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AddStats {
    pub added: usize,
    pub discarded: usize,
    pub bad_timestamps: usize,
}

impl AddCmdArgs {
    fn kind(&self) -> DataKind {
        if self.sysinfo {
            DataKind::Sysinfo
        } else if self.sacct {
            DataKind::Sacct
        } else {
            DataKind::Sample
        }
    }
}

pub fn run(args: &AddCmdArgs) -> Result<()> {
    let kind = args.kind();
    let text = match args.command {
        Some(ref cmd) => command::run_with_timeout(cmd, args.timeout)?,
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("Reading input")?;
            text
        }
    };
    let dir = cluster_dir(&args.data_path, &args.cluster)?;
    let store = ClusterStore::open_persistent(&dir, StoreOptions::default())?;
    let result = add_records(&store, kind, &text);
    let closed = store.close();
    let stats = result?;
    closed?;
    if stats.discarded > 0 || stats.bad_timestamps > 0 {
        tracing::warn!(
            "{} records discarded, {} with bad timestamps",
            stats.discarded,
            stats.bad_timestamps
        );
    }
    tracing::info!("{} {kind:?} records added", stats.added);
    Ok(())
}

// Ok(false) for a benign failure, which the caller counts.

fn appended(r: Result<()>) -> Result<bool> {
    match r {
        Ok(()) => Ok(true),
        Err(e) if is_store_error(&e, StoreError::BadTimestamp) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode `text` as records of `kind` and append them to `store`, then flush.

pub fn add_records(store: &ClusterStore, kind: DataKind, text: &str) -> Result<AddStats> {
    let mut stats = AddStats::default();
    let count = |ok: bool, stats: &mut AddStats| {
        if ok {
            stats.added += 1;
        } else {
            stats.bad_timestamps += 1;
        }
    };
    match kind {
        DataKind::Sample => {
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match decode_sample(line) {
                    Ok(s) if !s.hostname.as_str().is_empty() => {
                        let ok = appended(store.append_sample(
                            s.hostname.as_str(),
                            &s.timestamp.to_rfc3339(),
                            line,
                        ))?;
                        count(ok, &mut stats);
                    }
                    Ok(_) => {
                        tracing::debug!("Sample record without host");
                        stats.discarded += 1;
                    }
                    Err(e) if is_store_error(&e, StoreError::BadTimestamp) => {
                        tracing::debug!("Sample record with bad timestamp");
                        stats.bad_timestamps += 1;
                    }
                    Err(e) => {
                        tracing::debug!("Sample record discarded: {e}");
                        stats.discarded += 1;
                    }
                }
            }
        }
        DataKind::Sysinfo => match decode_sysinfo(text.trim()) {
            Ok(r) => {
                let ok = appended(store.append_sysinfo(
                    r.hostname.as_str(),
                    &r.timestamp.to_rfc3339(),
                    &encode_sysinfo(&r),
                ))?;
                count(ok, &mut stats);
            }
            Err(e) if is_store_error(&e, StoreError::BadTimestamp) => {
                tracing::debug!("Sysinfo record with bad timestamp");
                stats.bad_timestamps += 1;
            }
            Err(e) => {
                tracing::debug!("Sysinfo record discarded: {e}");
                stats.discarded += 1;
            }
        },
        DataKind::Sacct => {
            // Sacct records are filed by the time the job ended.
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                let mut records = vec![];
                let s = parse_sacct(line.as_bytes(), &mut records)?;
                stats.discarded += s.discarded;
                stats.bad_timestamps += s.bad_timestamps;
                for r in records {
                    match r.end {
                        Some(end) => {
                            let ok = appended(store.append_sacct(&end.to_rfc3339(), line))?;
                            count(ok, &mut stats);
                        }
                        None => {
                            tracing::debug!("Sacct record for job {} has no end time", r.job_id);
                            stats.bad_timestamps += 1;
                        }
                    }
                }
            }
        }
    }
    store.flush()?;
    Ok(stats)
}

#[cfg(test)]
use rustutils::{now, HostGlobber};

#[test]
fn test_add_samples() {
    let td = tempfile::TempDir::new().unwrap();
    let store = ClusterStore::open_persistent(td.path(), StoreOptions::default()).unwrap();
    let t = now();
    let ts = t.to_rfc3339();
    let far = (t - chrono::Duration::days(10)).to_rfc3339();
    let text = format!(
        "v=1.0.0,time={ts},host=c1,user=u,cmd=c,pid=1\n\
         \n\
         v=1.0.0,time={ts},host=c2,user=u,cmd=c,pid=2\n\
         v=1.0.0,time={far},host=c1,user=u,cmd=c,pid=3\n\
         v=1.0.0,time=yesterday,host=c1,user=u,cmd=c,pid=4\n"
    );
    let stats = add_records(&store, DataKind::Sample, &text).unwrap();
    assert_eq!(
        stats,
        AddStats {
            added: 2,
            discarded: 0,
            bad_timestamps: 2
        }
    );

    let r = store
        .read_samples(&HostGlobber::new(true), t, t + chrono::Duration::seconds(1))
        .unwrap();
    assert_eq!(r.num_records(), 2);
    store.close().unwrap();
}

#[test]
fn test_add_sysinfo() {
    let td = tempfile::TempDir::new().unwrap();
    let store = ClusterStore::open_persistent(td.path(), StoreOptions::default()).unwrap();
    let t = now();
    let text = format!(
        r#"{{
  "timestamp": "{}",
  "hostname": "c1",
  "cpu_cores": 8,
  "mem_gb": 32
}}
"#,
        t.to_rfc3339()
    );
    let stats = add_records(&store, DataKind::Sysinfo, &text).unwrap();
    assert_eq!(stats.added, 1);
    let stats = add_records(&store, DataKind::Sysinfo, "{not json").unwrap();
    assert_eq!(stats.discarded, 1);

    let r = store
        .read_sysinfo(&HostGlobber::new(true), t, t + chrono::Duration::seconds(1))
        .unwrap();
    assert_eq!(r.num_records(), 1);
    assert!(r.records[0][0].node.cpu_cores == 8);
    store.close().unwrap();
}

#[test]
fn test_add_sacct() {
    let td = tempfile::TempDir::new().unwrap();
    let store = ClusterStore::open_persistent(td.path(), StoreOptions::default()).unwrap();
    let t = now();
    let text = format!(
        "v=0.1.0,JobID=10,JobIDRaw=10,User=ann,End={}\n\
         v=0.1.0,JobID=11,JobIDRaw=11,User=bob,End=Unknown\n",
        t.to_rfc3339()
    );
    let stats = add_records(&store, DataKind::Sacct, &text).unwrap();
    assert_eq!(stats.added, 1);
    assert_eq!(stats.bad_timestamps, 1);

    let r = store.read_sacct(t, t + chrono::Duration::seconds(1)).unwrap();
    assert_eq!(r.num_records(), 1);
    store.close().unwrap();

    // A closed store is an error, not a count.
    assert!(add_records(&store, DataKind::Sacct, &text).is_err());
}
