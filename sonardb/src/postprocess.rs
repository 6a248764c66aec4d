/// Postprocess samples after ingestion: reconstruct the sample streams and compute derived data.
///
/// A stream is identified by the triple (hostname, stream-id, command), where the stream-id is the
/// job ID, or the pid for samples that have no job.  There may be several streams per job, both on
/// one host (several commands) and across hosts.
///
/// There are some important invariants on the samples that make up a stream in addition to them
/// having the same key:
///
/// - the vector is sorted ascending by timestamp
/// - no two timestamps are the same
/// - the vector is not empty
use crate::cputime::deduct_foreign_children;
use crate::intern::Sym;
use crate::sample::{gib_to_kib, merge_gpu_status, Sample};

use rustutils::{union_gpuset, ClusterConfig, Timestamp};
use std::boxed::Box;
use std::cmp::{max, min};
use std::collections::HashMap;

pub type InputStreamKey = (Sym, u32, Sym);

/// Maps an InputStreamKey to the samples of that stream.  It is named as it is because the key is
/// meaningful only for streams that have not been merged.

pub type InputStreamSet = HashMap<InputStreamKey, Vec<Box<Sample>>>;

/// The earliest and latest times observed for a host.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebound {
    pub earliest: Timestamp,
    pub latest: Timestamp,
}

pub type Timebounds = HashMap<Sym, Timebound>;

pub fn compute_timebounds(entries: &[Box<Sample>]) -> Timebounds {
    let mut bounds = Timebounds::new();
    for e in entries {
        bounds
            .entry(e.hostname)
            .and_modify(|b| {
                b.earliest = min(b.earliest, e.timestamp);
                b.latest = max(b.latest, e.timestamp);
            })
            .or_insert(Timebound {
                earliest: e.timestamp,
                latest: e.timestamp,
            });
    }
    bounds
}

/// Apply postprocessing to the samples:
///
/// - compute time bounds per host, before anything is removed
/// - deduct CPU time of departed children that ran in other jobs (see cputime.rs)
/// - reconstruct the individual sample streams and sort them by time
/// - collapse samples with equal timestamps: samples for the same pid last-wins, samples for
///   different pids by summing them as if the collector had rolled them up
/// - compute `cpu_util_pct` from `cputime_sec` and the timestamps of consecutive samples
/// - if `config` has the necessary information for a host, make `gpumem_pct` and `gpumem_kib`
///   consistent with each other
/// - after all that, remove samples for which the filter returns false, and then empty streams
///
/// Input samples are assumed to have been deduplicated already.

pub fn postprocess_samples<F>(
    entries: Vec<Box<Sample>>,
    filter: F,
    config: Option<&ClusterConfig>,
) -> (InputStreamSet, Timebounds)
where
    F: Fn(&Sample) -> bool,
{
    let bounds = compute_timebounds(&entries);
    let num_entries = entries.len();

    let mut by_host: HashMap<Sym, Vec<Box<Sample>>> = HashMap::new();
    for e in entries {
        by_host.entry(e.hostname).or_default().push(e);
    }

    let mut streams = InputStreamSet::new();
    let mut deductions = 0;
    for (_, mut samples) in by_host.drain() {
        deductions += deduct_foreign_children(&mut samples);
        for s in samples {
            streams
                .entry((s.hostname, s.stream_id(), s.command))
                .or_default()
                .push(s);
        }
    }

    let mut coalesced = 0;
    for stream in streams.values_mut() {
        // Stable, so that "last" among equal timestamps means last in input order.
        stream.sort_by_key(|s| s.timestamp);
        coalesced += collapse_equal_timestamps(stream);
        compute_cpu_util(stream);
    }

    if let Some(config) = config {
        for stream in streams.values_mut() {
            rectify_gpumem(stream, config);
        }
    }

    let mut retained = 0;
    for stream in streams.values_mut() {
        stream.retain(|s| filter(s));
        retained += stream.len();
    }
    streams.retain(|_, v| !v.is_empty());

    tracing::debug!(
        "Postprocessed {num_entries} samples: {deductions} cpu time deductions, {coalesced} \
         samples coalesced, {retained} samples in {} streams after filtering",
        streams.len()
    );

    (streams, bounds)
}

// Stream is sorted.  Returns the number of samples removed.

fn collapse_equal_timestamps(stream: &mut Vec<Box<Sample>>) -> usize {
    let before = stream.len();
    let mut out: Vec<Box<Sample>> = Vec::with_capacity(stream.len());
    let mut run: Vec<Box<Sample>> = vec![];
    for s in stream.drain(..) {
        if let Some(first) = run.first() {
            if first.timestamp != s.timestamp {
                out.push(coalesce_run(std::mem::take(&mut run)));
            }
        }
        if let Some(ix) = run.iter().position(|r| r.pid == s.pid) {
            run[ix] = s;
        } else {
            run.push(s);
        }
    }
    if !run.is_empty() {
        out.push(coalesce_run(run));
    }
    *stream = out;
    before - stream.len()
}

// The run is nonempty and has distinct pids.

fn coalesce_run(mut run: Vec<Box<Sample>>) -> Box<Sample> {
    let mut acc = run.remove(0);
    if run.is_empty() {
        return acc;
    }
    let mut processes = acc.rolledup + 1;
    for s in run {
        acc.cpu_pct += s.cpu_pct;
        acc.cpu_kib += s.cpu_kib;
        acc.rssanon_kib += s.rssanon_kib;
        union_gpuset(&mut acc.gpus, &s.gpus);
        acc.gpu_pct += s.gpu_pct;
        acc.gpumem_pct += s.gpumem_pct;
        acc.gpumem_kib += s.gpumem_kib;
        acc.gpu_status = merge_gpu_status(acc.gpu_status, s.gpu_status);
        acc.cputime_sec += s.cputime_sec;
        processes += s.rolledup + 1;
    }
    acc.rolledup = processes - 1;
    // The sample no longer represents one process.
    acc.pid = 0;
    acc.ppid = 0;
    acc
}

// The first sample gets the collector's running average since there is nothing to diff against.
// Negative differences come from counter resets and pid reuse and are clamped.

fn compute_cpu_util(stream: &mut [Box<Sample>]) {
    if stream.is_empty() {
        return;
    }
    stream[0].cpu_util_pct = stream[0].cpu_pct;
    for i in 1..stream.len() {
        let dt = (stream[i].timestamp - stream[i - 1].timestamp).num_seconds() as f64;
        let dc = stream[i].cputime_sec - stream[i - 1].cputime_sec;
        stream[i].cpu_util_pct = if dt > 0.0 && dc > 0.0 {
            ((dc / dt) * 100.0) as f32
        } else {
            0.0
        };
    }
}

fn rectify_gpumem(stream: &mut [Box<Sample>], config: &ClusterConfig) {
    let Some(node) = stream.first().and_then(|s| config.lookup(s.hostname.as_str())) else {
        return;
    };
    if node.gpu_cards == 0 || node.gpumem_gb == 0 {
        return;
    }
    let cardsize = node.gpumem_gb as f64 / node.gpu_cards as f64;
    for s in stream.iter_mut() {
        if node.gpumem_pct {
            s.gpumem_kib = gib_to_kib(s.gpumem_pct as f64 / 100.0 * cardsize);
        } else {
            s.gpumem_pct = (s.gpumem_gb() / cardsize * 100.0) as f32;
        }
    }
}

#[cfg(test)]
use crate::intern::intern;

#[cfg(test)]
use rustutils::{timestamp_from_seconds, NodeConfig};

#[cfg(test)]
fn sample(host: &str, t: i64, pid: u32, job: u32, cmd: &str, cputime: f64) -> Box<Sample> {
    let mut s = crate::sample::empty_sample(timestamp_from_seconds(t).unwrap(), intern(host));
    s.pid = pid;
    s.job_id = job;
    s.command = intern(cmd);
    s.user = intern("u");
    s.cputime_sec = cputime;
    s
}

#[cfg(test)]
fn key(host: &str, id: u32, cmd: &str) -> InputStreamKey {
    (intern(host), id, intern(cmd))
}

#[test]
fn test_cpu_util_derivation() {
    let mut a = sample("h1", 100, 5, 7, "python", 50.0);
    a.cpu_pct = 42.0;
    let b = sample("h1", 130, 5, 7, "python", 80.0);
    // Arrive out of order
    let (streams, bounds) = postprocess_samples(vec![b, a], |_| true, None);
    assert_eq!(streams.len(), 1);
    let s = &streams[&key("h1", 7, "python")];
    assert_eq!(s.len(), 2);
    assert!(s[0].cpu_util_pct == 42.0);
    assert!(s[1].cpu_util_pct == 100.0);
    let b = bounds[&intern("h1")];
    assert!(b.earliest == timestamp_from_seconds(100).unwrap());
    assert!(b.latest == timestamp_from_seconds(130).unwrap());
}

#[test]
fn test_single_sample_and_reset() {
    let mut a = sample("h1", 100, 5, 0, "sh", 500.0);
    a.cpu_pct = 12.5;
    let b = sample("h1", 200, 5, 0, "sh", 10.0);
    let mut c = sample("h1", 100, 6, 0, "sh", 1.0);
    c.cpu_pct = 3.0;
    let (streams, _) = postprocess_samples(vec![a, b, c], |_| true, None);
    // Job 0: one stream per pid.
    assert_eq!(streams.len(), 2);
    let s = &streams[&key("h1", 5, "sh")];
    assert!(s[0].cpu_util_pct == 12.5);
    assert!(s[1].cpu_util_pct == 0.0);
    let s = &streams[&key("h1", 6, "sh")];
    assert_eq!(s.len(), 1);
    assert!(s[0].cpu_util_pct == 3.0);
}

#[test]
fn test_equal_timestamps() {
    let mut a = sample("h1", 100, 5, 7, "python", 10.0);
    a.cpu_pct = 1.0;
    let mut b = sample("h1", 100, 5, 7, "python", 20.0);
    b.cpu_pct = 2.0;
    let mut c = sample("h1", 100, 6, 7, "python", 30.0);
    c.cpu_pct = 3.0;
    c.rolledup = 2;
    let d = sample("h1", 200, 5, 7, "python", 90.0);
    let (streams, _) = postprocess_samples(vec![a, b, c, d], |_| true, None);
    let s = &streams[&key("h1", 7, "python")];
    assert_eq!(s.len(), 2);
    // pid 5 last-wins (b), then summed with pid 6.
    assert!(s[0].cpu_pct == 5.0);
    assert!(s[0].cputime_sec == 50.0);
    assert!(s[0].rolledup == 3);
    assert!(s[0].pid == 0);
    assert!(s[1].cpu_util_pct == 40.0);
    assert!(s[0].timestamp < s[1].timestamp);
}

#[test]
fn test_filter_after_bounds() {
    let a = sample("h1", 100, 5, 7, "python", 10.0);
    let b = sample("h1", 200, 5, 7, "python", 20.0);
    let c = sample("h2", 300, 5, 8, "python", 20.0);
    let t150 = timestamp_from_seconds(150).unwrap();
    let (streams, bounds) = postprocess_samples(vec![a, b, c], |s| s.timestamp > t150, None);
    assert_eq!(streams.len(), 2);
    let s = &streams[&key("h1", 7, "python")];
    assert_eq!(s.len(), 1);
    // The utilization is computed before filtering.
    assert!(s[0].cpu_util_pct == 10.0);
    assert!(bounds[&intern("h1")].earliest == timestamp_from_seconds(100).unwrap());

    let (streams, bounds) = postprocess_samples(vec![], |_| true, None);
    assert!(streams.is_empty() && bounds.is_empty());
}

#[test]
fn test_gpumem_rectification() {
    let cfg = ClusterConfig::from_nodes(
        "c",
        vec![
            NodeConfig {
                hostname: "g1".to_string(),
                gpu_cards: 4,
                gpumem_gb: 64,
                gpumem_pct: true,
                ..Default::default()
            },
            NodeConfig {
                hostname: "g2".to_string(),
                gpu_cards: 2,
                gpumem_gb: 32,
                gpumem_pct: false,
                ..Default::default()
            },
        ],
    );
    let mut a = sample("g1", 100, 5, 7, "x", 0.0);
    a.gpumem_pct = 50.0;
    let mut b = sample("g2", 100, 5, 7, "x", 0.0);
    b.gpumem_kib = 8 * 1024 * 1024;
    let mut c = sample("g3", 100, 5, 7, "x", 0.0);
    c.gpumem_pct = 10.0;
    let (streams, _) = postprocess_samples(vec![a, b, c], |_| true, Some(&cfg));
    assert!(streams[&key("g1", 7, "x")][0].gpumem_kib == 8 * 1024 * 1024);
    assert!(streams[&key("g2", 7, "x")][0].gpumem_pct == 50.0);
    assert!(streams[&key("g3", 7, "x")][0].gpumem_kib == 0);
}

#[test]
fn test_deduction_applied_before_utilization() {
    let mut xs = vec![];
    for (t, pid, ppid, job, cpu) in [
        (100, 20, 10, 1, 50.0),
        (100, 30, 20, 2, 10.0),
        (200, 20, 10, 1, 100.0),
        (200, 30, 20, 2, 60.0),
        (250, 20, 10, 1, 200.0),
    ] {
        let mut s = sample("h1", t, pid, job, "p", cpu);
        s.ppid = ppid;
        xs.push(s);
    }
    let (streams, _) = postprocess_samples(xs, |_| true, None);
    let s = &streams[&key("h1", 1, "p")];
    assert!(s[2].cputime_sec == 140.0);
    assert!(s[2].cpu_util_pct == 80.0);
}

#[cfg(test)]
fn canonical_streams(streams: &InputStreamSet) -> Vec<String> {
    let mut out = streams
        .values()
        .flat_map(|v| {
            v.iter().map(|s| {
                format!(
                    "{} util={}",
                    crate::samplefile::encode_sample(s),
                    s.cpu_util_pct
                )
            })
        })
        .collect::<Vec<String>>();
    out.sort();
    out
}

#[test]
fn test_independent_of_partitioning_and_workers() {
    use crate::reader::{dedup_samples, read_files, CancelToken, ReadOptions};
    use crate::samplefile::parse_sample_file;

    // Pseudo-random input from a fixed-seed LCG.
    let mut seed = 0x5eed_u64;
    let mut rand = |n: u64| -> u64 {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (seed >> 33) % n
    };

    // Two pids of job 10 run the same command, so some timestamps are coalesced.
    let procs = [(100u32, 10u32, "python"), (101, 10, "python"), (200, 0, "bash"), (300, 11, "gmx")];
    let mut lines = vec![];
    for host in ["a", "b"] {
        for step in 0..12u64 {
            for (pid, job, cmd) in procs {
                if rand(5) == 0 {
                    continue;
                }
                let job_field = if job == 0 {
                    String::new()
                } else {
                    format!(",job={job}")
                };
                lines.push(format!(
                    "v=0.11.0,time=2024-01-01T00:{step:02}:00Z,host={host},user=u,pid={pid},ppid=1{job_field},cmd={cmd},cpu%={},cpukib={},cputime_sec={}",
                    pid % 50,
                    1000 * (pid % 5 + 1),
                    step * (pid as u64 % 7 + 1) * 30
                ));
            }
        }
    }

    let td = tempfile::TempDir::new().unwrap();
    let mut baseline: Option<Vec<String>> = None;
    for (round, (parts, workers)) in [(1usize, 1usize), (2, 1), (3, 4), (7, 2), (7, 16)]
        .into_iter()
        .enumerate()
    {
        // Scatter the records over the files in random order, duplicating some of them.
        let mut files: Vec<Vec<String>> = vec![vec![]; parts];
        for l in &lines {
            let copies = if rand(4) == 0 { 2 } else { 1 };
            for _ in 0..copies {
                let f = &mut files[rand(parts as u64) as usize];
                let at = rand(f.len() as u64 + 1) as usize;
                f.insert(at, l.clone());
            }
        }
        let dir = td.path().join(format!("r{round}"));
        std::fs::create_dir(&dir).unwrap();
        let paths = files
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let p = dir.join(format!("{i}.csv"));
                let text = f.iter().map(|l| format!("{l}\n")).collect::<String>();
                std::fs::write(&p, text).unwrap();
                p
            })
            .collect::<Vec<std::path::PathBuf>>();

        let opts = ReadOptions {
            workers,
            cancel: CancelToken::new(),
        };
        let r = read_files(&paths, &opts, parse_sample_file);
        assert_eq!(r.records_dropped, 0);
        assert_eq!(r.files_failed, 0);
        let (streams, _) = postprocess_samples(dedup_samples(r.records), |_| true, None);
        for v in streams.values() {
            assert!(v.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        }
        let got = canonical_streams(&streams);
        match &baseline {
            None => baseline = Some(got),
            Some(b) => assert!(*b == got),
        }
    }
    assert!(baseline.map_or(false, |b| !b.is_empty()));
}
