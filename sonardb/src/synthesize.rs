/// Merging of sample streams into synthesized streams for jobs and hosts, and folding of streams
/// into time buckets.
///
/// A merged stream satisfies the same invariants as an input stream: it is nonempty, it is sorted
/// ascending by time, and no two samples have the same timestamp.
use crate::intern::{intern, Sym};
use crate::postprocess::{InputStreamSet, Timebound, Timebounds};
use crate::sample::{merge_gpu_status, GpuStatus, Sample};

use rustutils::{
    compress_hostnames, empty_gpuset, far_future, union_gpuset, ClusterConfig, Timestamp,
};
use std::boxed::Box;
use std::cmp::{max, min};
use std::collections::{BTreeSet, HashMap};

/// The name used for the user and command of streams merged across jobs.
pub const MERGED: &str = "_merged_";

/// A stream synthesized from one or more input streams, with the metadata of its inputs.

#[derive(Debug, Clone)]
pub struct MergedStream {
    /// The contributing hosts, sorted by name.
    pub hosts: Vec<Sym>,

    /// The contributing hosts as a compressed host pattern list, eg "c1-[1-3],c2-4".  This is also
    /// the hostname of every synthesized sample.
    pub hostname: Sym,

    /// The contributing commands, sorted by name.
    pub commands: Vec<Sym>,

    pub user: Sym,

    pub job_id: u32,

    /// `earliest` is the earliest of the contributing hosts' earliest bounds, `latest` the latest of
    /// their latest bounds.
    pub bound: Timebound,

    pub samples: Vec<Box<Sample>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Streams for the same job on the same host are merged.
    ByHostAndJob,

    /// Streams for the same job are merged across all hosts.
    ByJob,

    /// Streams for the same job are merged across hosts whose config says `cross_node_jobs`, and
    /// within the host for other hosts.
    Hybrid,
}

// Grouping key: (job, host) where host is None for cross-host groups.
type GroupKey = (u32, Option<Sym>);

/// Merge input streams into job streams according to `mode`.  Streams with job ID zero are not
/// merged with anything, each remains its own job.  The output is sorted by job ID, then by host
/// name, then by command, so that it does not depend on hashing.
///
/// `config` is only consulted for `Hybrid`; without it no host merges across nodes.

pub fn merge_jobs(
    mut streams: InputStreamSet,
    bounds: &Timebounds,
    mode: MergeMode,
    config: Option<&ClusterConfig>,
) -> Vec<MergedStream> {
    let mut groups: HashMap<GroupKey, Vec<Vec<Box<Sample>>>> = HashMap::new();
    let mut result = vec![];

    for ((host, _, cmd), v) in streams.drain() {
        let job_id = v[0].job_id;
        if job_id == 0 {
            let user = v[0].user;
            result.push(make_stream(vec![host], vec![cmd], user, 0, bounds, vec![v]));
            continue;
        }
        let across = match mode {
            MergeMode::ByHostAndJob => false,
            MergeMode::ByJob => true,
            MergeMode::Hybrid => config
                .map(|c| c.cross_node_jobs(host.as_str()))
                .unwrap_or(false),
        };
        let key = (job_id, if across { None } else { Some(host) });
        groups.entry(key).or_default().push(v);
    }

    for ((job_id, _), streams) in groups.drain() {
        let hosts = distinct(streams.iter().map(|s| s[0].hostname));
        let commands = distinct(streams.iter().map(|s| s[0].command));
        // Any user from any record is fine, the streams are nonempty.
        let user = streams[0][0].user;
        result.push(make_stream(hosts, commands, user, job_id, bounds, streams));
    }

    sort_streams(&mut result);
    result
}

/// Merge input streams by host, across jobs.  The user and command of the output are "_merged_"
/// and the job ID is zero.  The output is sorted by host name.

pub fn merge_by_host(mut streams: InputStreamSet, bounds: &Timebounds) -> Vec<MergedStream> {
    let mut collections: HashMap<Sym, Vec<Vec<Box<Sample>>>> = HashMap::new();
    for ((host, _, _), v) in streams.drain() {
        collections.entry(host).or_default().push(v);
    }

    let merged = intern(MERGED);
    let mut result = collections
        .drain()
        .map(|(host, streams)| make_stream(vec![host], vec![merged], merged, 0, bounds, streams))
        .collect::<Vec<MergedStream>>();
    sort_streams(&mut result);
    result
}

/// Merge already-merged host streams into one stream for all the hosts together.

pub fn merge_across_hosts(streams: Vec<MergedStream>) -> Option<MergedStream> {
    if streams.is_empty() {
        return None;
    }
    let hosts = distinct(streams.iter().flat_map(|s| s.hosts.iter().copied()));
    let bound = streams
        .iter()
        .map(|s| s.bound)
        .reduce(widen)
        .unwrap_or(streams[0].bound);
    let merged = intern(MERGED);
    let hostname = host_pattern(&hosts);
    let samples = merge_streams(
        hostname,
        merged,
        0,
        streams.into_iter().map(|s| s.samples).collect(),
    );
    Some(MergedStream {
        hosts,
        hostname,
        commands: vec![merged],
        user: merged,
        job_id: 0,
        bound,
        samples,
    })
}

fn make_stream(
    hosts: Vec<Sym>,
    commands: Vec<Sym>,
    user: Sym,
    job_id: u32,
    bounds: &Timebounds,
    streams: Vec<Vec<Box<Sample>>>,
) -> MergedStream {
    let bound = hosts
        .iter()
        .filter_map(|h| bounds.get(h).copied())
        .reduce(widen)
        .unwrap_or_else(|| stream_bound(&streams));
    let hostname = host_pattern(&hosts);
    let unchanged = streams.len() == 1
        && commands.len() == 1
        && streams[0][0].command == commands[0]
        && streams[0][0].user == user;
    let samples = if unchanged {
        streams.into_iter().flatten().collect()
    } else {
        merge_streams(hostname, user, job_id, streams)
    };
    MergedStream {
        hosts,
        hostname,
        commands,
        user,
        job_id,
        bound,
        samples,
    }
}

fn widen(a: Timebound, b: Timebound) -> Timebound {
    Timebound {
        earliest: min(a.earliest, b.earliest),
        latest: max(a.latest, b.latest),
    }
}

// Fallback for hosts that are missing from the bounds: the span of the samples themselves.

fn stream_bound(streams: &[Vec<Box<Sample>>]) -> Timebound {
    let mut earliest = far_future();
    let mut latest = rustutils::epoch();
    for s in streams.iter().flatten() {
        earliest = min(earliest, s.timestamp);
        latest = max(latest, s.timestamp);
    }
    Timebound { earliest, latest }
}

fn distinct(xs: impl Iterator<Item = Sym>) -> Vec<Sym> {
    xs.collect::<BTreeSet<Sym>>().into_iter().collect()
}

fn host_pattern(hosts: &[Sym]) -> Sym {
    intern(
        &compress_hostnames(&hosts.iter().map(|h| h.as_str()).collect::<Vec<&str>>()).join(","),
    )
}

fn sort_streams(xs: &mut [MergedStream]) {
    xs.sort_by(|a, b| {
        (a.job_id, a.hostname, &a.commands, a.samples[0].timestamp).cmp(&(
            b.job_id,
            b.hostname,
            &b.commands,
            b.samples[0].timestamp,
        ))
    })
}

/// How far back a stream's most recent sample is still taken to be in effect when another stream
/// has a sample and this one does not.
const CARRY_SECS: i64 = 30;

// Merge a set of streams into one.  At every distinct timestamp across the streams, the samples at
// that time are summed into one synthesized sample.  A stream that has started but not ended and
// has no sample at that time contributes its previous sample if that is no older than CARRY_SECS;
// sonar runs on different hosts are not perfectly synchronized and this avoids dropping the host
// from the sum.
//
// A synthesized sample has:
//
//   - version empty, pid and ppid zero, num_cores and memtotal zero
//   - hostname, user and job_id as given
//   - command the lexicographically least command of the samples that went into it
//   - cpu_pct, cpu_kib, rssanon_kib, gpu_pct, gpumem_pct, gpumem_kib, cputime_sec and
//     cpu_util_pct the sums of those fields
//   - gpus the union of the GPU sets, gpu_status failed if any was failed
//   - rolledup such that rolledup+1 is the number of processes that went into it
//
// Input invariants used: streams are nonempty, sorted, and have no duplicate timestamps.

fn merge_streams(
    hostname: Sym,
    user: Sym,
    job_id: u32,
    streams: Vec<Vec<Box<Sample>>>,
) -> Vec<Box<Sample>> {
    let mut records = vec![];
    let mut indices = vec![0usize; streams.len()];
    let mut selected: Vec<&Sample> = Vec::with_capacity(streams.len());
    let sentinel_time = far_future();

    loop {
        let mut min_time = sentinel_time;
        for (s, ix) in streams.iter().zip(indices.iter()) {
            if *ix < s.len() && s[*ix].timestamp < min_time {
                min_time = s[*ix].timestamp;
            }
        }
        if min_time == sentinel_time {
            break;
        }

        let near_past = min_time - chrono::Duration::seconds(CARRY_SECS);
        for (s, ix) in streams.iter().zip(indices.iter_mut()) {
            if *ix >= s.len() {
                continue;
            }
            if s[*ix].timestamp == min_time {
                selected.push(&s[*ix]);
                *ix += 1;
            } else if *ix > 0 && s[*ix - 1].timestamp >= near_past {
                selected.push(&s[*ix - 1]);
            }
        }

        let command = selected
            .iter()
            .map(|s| s.command)
            .min()
            .unwrap_or_else(Sym::empty);
        records.push(sum_samples(min_time, hostname, user, job_id, command, &selected));
        selected.clear();
    }

    records
}

fn sum_samples(
    timestamp: Timestamp,
    hostname: Sym,
    user: Sym,
    job_id: u32,
    command: Sym,
    selected: &[&Sample],
) -> Box<Sample> {
    let mut r = crate::sample::empty_sample(timestamp, hostname);
    r.user = user;
    r.job_id = job_id;
    r.command = command;
    r.gpus = empty_gpuset();
    r.gpu_status = GpuStatus::Ok;
    let mut processes = 0;
    for s in selected {
        r.cpu_pct += s.cpu_pct;
        r.cpu_kib += s.cpu_kib;
        r.rssanon_kib += s.rssanon_kib;
        union_gpuset(&mut r.gpus, &s.gpus);
        r.gpu_pct += s.gpu_pct;
        r.gpumem_pct += s.gpumem_pct;
        r.gpumem_kib += s.gpumem_kib;
        r.gpu_status = merge_gpu_status(r.gpu_status, s.gpu_status);
        r.cputime_sec += s.cputime_sec;
        r.cpu_util_pct += s.cpu_util_pct;
        processes += s.rolledup + 1;
    }
    r.rolledup = processes.max(1) - 1;
    r
}

/// Bucket the samples of a stream by hour and average each bucket.
pub fn fold_samples_hourly(samples: &[Box<Sample>]) -> Vec<Box<Sample>> {
    fold_samples(samples, rustutils::truncate_to_hour)
}

/// Bucket the samples of a stream by day and average each bucket.
pub fn fold_samples_daily(samples: &[Box<Sample>]) -> Vec<Box<Sample>> {
    fold_samples(samples, rustutils::truncate_to_day)
}

// The timestamp of a bucket is the start of its period.

fn fold_samples(
    samples: &[Box<Sample>],
    get_time: fn(Timestamp) -> Timestamp,
) -> Vec<Box<Sample>> {
    let mut result = vec![];
    let mut i = 0;
    while i < samples.len() {
        let s0 = &samples[i];
        let t0 = get_time(s0.timestamp);
        i += 1;
        let mut bucket: Vec<&Sample> = vec![s0];
        while i < samples.len() && get_time(samples[i].timestamp) == t0 {
            bucket.push(&samples[i]);
            i += 1;
        }
        let mut r = sum_samples(t0, s0.hostname, s0.user, s0.job_id, s0.command, &bucket);
        let n32 = bucket.len() as f32;
        let n64 = bucket.len() as u64;
        r.cpu_pct /= n32;
        r.cpu_kib /= n64;
        r.rssanon_kib /= n64;
        r.gpu_pct /= n32;
        r.gpumem_pct /= n32;
        r.gpumem_kib /= n64;
        r.cpu_util_pct /= n32;
        r.cputime_sec /= bucket.len() as f64;
        r.rolledup = 0;
        result.push(r);
    }

    result
}

#[cfg(test)]
use crate::postprocess::postprocess_samples;

#[cfg(test)]
use rustutils::{timestamp_from_seconds, NodeConfig};

#[cfg(test)]
fn sample(host: &str, t: i64, pid: u32, job: u32, cmd: &str, cpu: f32) -> Box<Sample> {
    let mut s = crate::sample::empty_sample(timestamp_from_seconds(t).unwrap(), intern(host));
    s.pid = pid;
    s.job_id = job;
    s.command = intern(cmd);
    s.user = intern("u");
    s.cpu_pct = cpu;
    s
}

#[cfg(test)]
fn hybrid_config() -> ClusterConfig {
    let node = |name: &str, cross: bool| NodeConfig {
        hostname: name.to_string(),
        cross_node_jobs: cross,
        cpu_cores: 64,
        ..Default::default()
    };
    ClusterConfig::from_nodes("c", vec![node("h1", true), node("h2", true), node("h3", false)])
}

#[cfg(test)]
fn job_input() -> (InputStreamSet, Timebounds) {
    let mut xs = vec![];
    for host in ["h1", "h2", "h3"] {
        for t in [100, 200] {
            xs.push(sample(host, t, 10, 77, "python", 100.0));
        }
    }
    xs.push(sample("h1", 300, 11, 0, "bash", 1.0));
    xs.push(sample("h1", 400, 12, 0, "bash", 1.0));
    postprocess_samples(xs, |_| true, None)
}

#[test]
fn test_merge_modes() {
    let cfg = hybrid_config();

    let (streams, bounds) = job_input();
    let jobs = merge_jobs(streams, &bounds, MergeMode::Hybrid, Some(&cfg));
    // Two job-0 streams, never merged, then job 77 twice.
    assert_eq!(jobs.len(), 4);
    assert!(jobs[0].job_id == 0 && jobs[1].job_id == 0);
    // "h3" sorts before "h[1-2]".
    assert!(jobs[2].job_id == 77 && jobs[2].hostname == "h3");
    assert!(jobs[3].job_id == 77 && jobs[3].hostname == "h[1-2]");
    assert!(jobs[3].hosts == vec![intern("h1"), intern("h2")]);
    assert!(jobs[3].samples.len() == 2);
    assert!(jobs[3].samples[0].cpu_pct == 200.0);
    assert!(jobs[3].samples[0].rolledup == 1);
    assert!(jobs[2].samples[0].cpu_pct == 100.0);
    // The bound covers both hosts; h1 runs longer because of its job-0 samples.
    assert!(jobs[3].bound.latest == timestamp_from_seconds(400).unwrap());
    assert!(jobs[2].bound.latest == timestamp_from_seconds(200).unwrap());

    let (streams, bounds) = job_input();
    let jobs = merge_jobs(streams, &bounds, MergeMode::ByJob, None);
    assert_eq!(jobs.len(), 3);
    assert!(jobs[2].hostname == "h[1-3]");
    assert!(jobs[2].samples[1].cpu_pct == 300.0);

    let (streams, bounds) = job_input();
    let jobs = merge_jobs(streams, &bounds, MergeMode::ByHostAndJob, None);
    assert_eq!(jobs.len(), 5);

    // Without config, hybrid merges nothing across hosts.
    let (streams, bounds) = job_input();
    let jobs = merge_jobs(streams, &bounds, MergeMode::Hybrid, None);
    assert_eq!(jobs.len(), 5);
}

#[test]
fn test_merge_commands_and_gpus() {
    let mut a = sample("h1", 100, 10, 5, "zed", 1.0);
    a.gpus = Some(1);
    a.gpu_status = GpuStatus::UnknownFailure;
    let mut b = sample("h1", 100, 11, 5, "alpha", 2.0);
    b.gpus = Some(4);
    let c = sample("h1", 200, 10, 5, "zed", 3.0);
    let (streams, bounds) = postprocess_samples(vec![a, b, c], |_| true, None);
    let jobs = merge_jobs(streams, &bounds, MergeMode::ByHostAndJob, None);
    assert_eq!(jobs.len(), 1);
    let j = &jobs[0];
    assert!(j.commands == vec![intern("alpha"), intern("zed")]);
    assert!(j.samples[0].command == "alpha");
    assert!(j.samples[0].gpus == Some(5));
    assert!(j.samples[0].gpu_status == GpuStatus::UnknownFailure);
    assert!(j.samples[0].cpu_pct == 3.0);
    // alpha's stream has ended by 200.
    assert!(j.samples[1].command == "zed");
    assert!(j.samples[1].cpu_pct == 3.0);
    for w in j.samples.windows(2) {
        assert!(w[0].timestamp < w[1].timestamp);
    }
}

#[test]
fn test_merge_carries_recent_values() {
    // h2 samples 10s after h1; between its samples its previous value is in effect.
    let xs = vec![
        sample("h1", 100, 10, 5, "p", 1.0),
        sample("h2", 110, 10, 5, "p", 2.0),
        sample("h1", 130, 10, 5, "p", 4.0),
        sample("h2", 140, 10, 5, "p", 8.0),
    ];
    let (streams, bounds) = postprocess_samples(xs, |_| true, None);
    let jobs = merge_jobs(streams, &bounds, MergeMode::ByJob, None);
    let s = &jobs[0].samples;
    assert_eq!(s.len(), 4);
    assert!(s[0].cpu_pct == 1.0);
    assert!(s[1].cpu_pct == 3.0);
    assert!(s[2].cpu_pct == 6.0);
    // h1 has ended.
    assert!(s[3].cpu_pct == 8.0);
}

#[test]
fn test_merge_by_host_and_fold() {
    let xs = vec![
        sample("h1", 3600, 10, 5, "p", 100.0),
        sample("h1", 3600, 11, 6, "q", 100.0),
        sample("h1", 3900, 10, 5, "p", 300.0),
        sample("h1", 7300, 10, 5, "p", 50.0),
        sample("h2", 3600, 10, 5, "p", 1.0),
    ];
    let (streams, bounds) = postprocess_samples(xs, |_| true, None);
    let hosts = merge_by_host(streams, &bounds);
    assert_eq!(hosts.len(), 2);
    assert!(hosts[0].hostname == "h1");
    assert!(hosts[0].user == MERGED);
    assert!(hosts[0].samples[0].cpu_pct == 200.0);

    let hourly = fold_samples_hourly(&hosts[0].samples);
    assert_eq!(hourly.len(), 2);
    assert!(hourly[0].timestamp == timestamp_from_seconds(3600).unwrap());
    // (200 + 300) / 2
    assert!(hourly[0].cpu_pct == 250.0);
    assert!(hourly[1].cpu_pct == 50.0);
    let daily = fold_samples_daily(&hosts[0].samples);
    assert_eq!(daily.len(), 1);

    let all = merge_across_hosts(hosts).unwrap();
    assert!(all.hostname == "h[1-2]");
    assert!(all.samples[0].cpu_pct == 201.0);
    assert!(merge_across_hosts(vec![]).is_none());
}
