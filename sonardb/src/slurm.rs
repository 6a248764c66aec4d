/// Joining of scheduler accounting records into jobs, and filtering of those jobs.
///
/// All the records with the same job id form one job: the *main* record is the one with a user
/// name, the others are *steps*.  A job whose main record was not seen is dropped.  This happens
/// when the main record falls just outside the window that was read, so it is not an error.
use crate::intern::Sym;
use crate::sacct::SacctRecord;

use itertools::Itertools;
use rustutils::{expand_pattern, split_multi_pattern, HostGlobber};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlurmJobKind {
    Regular,
    Array,
    Het,
}

#[derive(Debug, Clone)]
pub struct SlurmJob {
    pub main: Box<SacctRecord>,
    pub steps: Vec<Box<SacctRecord>>,
}

impl SlurmJob {
    pub fn job_id(&self) -> u32 {
        self.main.job_id
    }

    pub fn kind(&self) -> SlurmJobKind {
        if self.main.array_job_id != 0 {
            SlurmJobKind::Array
        } else if self.main.het_job_id != 0 {
            SlurmJobKind::Het
        } else {
            SlurmJobKind::Regular
        }
    }

    /// Max resident memory, GiB, across the main record and the steps.
    pub fn max_rss(&self) -> u32 {
        self.steps
            .iter()
            .map(|s| s.max_rss)
            .fold(self.main.max_rss, u32::max)
    }

    /// Core-seconds reserved: cores per node * nodes * elapsed time.
    pub fn requested_cpu(&self) -> u64 {
        self.main.req_cpus as u64 * self.main.req_nodes.max(1) as u64 * self.main.elapsed_raw as u64
    }

    /// Core-seconds used, user + system.
    pub fn used_cpu(&self) -> u64 {
        self.main.user_cpu + self.main.system_cpu
    }

    pub fn uses_gpu(&self) -> bool {
        !self.main.req_gpus.is_empty()
    }
}

/// Group deduplicated records by job id.  The result is sorted by job id, and the steps of each
/// job are in input order.

pub fn group_jobs(records: Vec<Box<SacctRecord>>) -> Vec<SlurmJob> {
    let (mains, steps): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| !r.user.is_empty());
    let mains = mains
        .into_iter()
        .map(|r| (r.job_id, r))
        .collect::<HashMap<u32, Box<SacctRecord>>>();
    let mut steps = steps.into_iter().into_group_map_by(|r| r.job_id);

    let mainless = steps.keys().filter(|id| !mains.contains_key(id)).count();
    if mainless > 0 {
        tracing::debug!("{mainless} jobs dropped due to no main record present");
    }

    let mut jobs = mains
        .into_iter()
        .map(|(id, main)| SlurmJob {
            main,
            steps: steps.remove(&id).unwrap_or_default(),
        })
        .collect::<Vec<SlurmJob>>();
    jobs.sort_by_key(|j| j.job_id());
    jobs
}

/// Filter on the main record of a job.  Empty sets and `None` mean "don't care".

#[derive(Debug, Default)]
pub struct SlurmFilter {
    /// Keep jobs with at least one node matching.
    pub hosts: Option<HostGlobber>,
    /// Keep jobs requesting a GPU whose type starts with one of these.
    pub gpu_types: Vec<String>,
    pub states: HashSet<String>,
    pub users: HashSet<String>,
    pub accounts: HashSet<String>,
    pub partitions: HashSet<String>,
    pub reservations: HashSet<String>,
    /// Matches the job id, or the array or heterogeneous job id the job is part of.
    pub job_ids: HashSet<u32>,
    /// Compared to the elapsed time, seconds.
    pub min_runtime: Option<u64>,
    pub max_runtime: Option<u64>,
    pub some_gpu: bool,
    pub no_gpu: bool,
}

fn in_set(set: &HashSet<String>, s: Sym) -> bool {
    set.is_empty() || set.contains(s.as_str())
}

impl SlurmFilter {
    pub fn accepts(&self, job: &SlurmJob) -> bool {
        let m = &job.main;
        let elapsed = m.elapsed_raw as u64;
        in_set(&self.states, m.state)
            && in_set(&self.users, m.user)
            && in_set(&self.accounts, m.account)
            && in_set(&self.partitions, m.partition)
            && in_set(&self.reservations, m.reservation)
            && (self.job_ids.is_empty()
                || self.job_ids.contains(&m.job_id)
                || (m.array_job_id != 0 && self.job_ids.contains(&m.array_job_id))
                || (m.het_job_id != 0 && self.job_ids.contains(&m.het_job_id)))
            && self.min_runtime.map_or(true, |t| elapsed >= t)
            && self.max_runtime.map_or(true, |t| elapsed <= t)
            && (!self.some_gpu || job.uses_gpu())
            && (!self.no_gpu || !job.uses_gpu())
            && (self.gpu_types.is_empty() || requests_gpu_type(m.req_gpus, &self.gpu_types))
            && self
                .hosts
                .as_ref()
                .map_or(true, |h| h.is_empty() || runs_on(m.node_list, h))
    }
}

// `req_gpus` is a list of type=count, with `*` for an unspecified type.

fn requests_gpu_type(req_gpus: Sym, types: &[String]) -> bool {
    req_gpus.as_str().split(',').any(|item| {
        let ty = item.split_once('=').map_or(item, |(t, _)| t);
        types.iter().any(|p| ty.starts_with(p.as_str()))
    })
}

// A node list that can't be parsed or expanded matches nothing.

fn runs_on(node_list: Sym, hosts: &HostGlobber) -> bool {
    let Ok(patterns) = split_multi_pattern(node_list.as_str()) else {
        return false;
    };
    for p in patterns {
        let Ok(nodes) = expand_pattern(&p) else {
            continue;
        };
        if nodes.iter().any(|n| hosts.match_hostname(n)) {
            return true;
        }
    }
    false
}

/// Group and filter.

pub fn select_jobs(records: Vec<Box<SacctRecord>>, filter: &SlurmFilter) -> Vec<SlurmJob> {
    let jobs = group_jobs(records);
    let before = jobs.len();
    let jobs = jobs
        .into_iter()
        .filter(|j| filter.accepts(j))
        .collect::<Vec<SlurmJob>>();
    tracing::debug!("{before} jobs, {} after filtering", jobs.len());
    jobs
}

#[cfg(test)]
use crate::sacct::parse_sacct;

#[cfg(test)]
fn jobs_from(text: &str) -> Vec<SlurmJob> {
    let mut entries = vec![];
    parse_sacct(text.as_bytes(), &mut entries).unwrap();
    group_jobs(entries)
}

#[cfg(test)]
const SACCT_TEXT: &str = "\
v=0.1.0,JobID=20.batch,JobIDRaw=20.batch,End=Unknown,MaxRSS=4G
v=0.1.0,JobID=20,JobIDRaw=20,User=ann,Account=ec1,Partition=normal,State=COMPLETED,End=2024-11-04T11:00:00Z,ElapsedRaw=3600,NodeList=c1-[1-4],ReqCPUS=8,ReqNodes=2,MaxRSS=1G,UserCPU=10:00
v=0.1.0,JobID=30_2,JobIDRaw=31,User=bob,Account=ec2,Partition=accel,State=FAILED,End=2024-11-04T11:00:00Z,ElapsedRaw=60,NodeList=gpu-7,\"AllocTRES=gres/gpu:a100=1\"
v=0.1.0,JobID=40.extern,JobIDRaw=40.extern,End=Unknown
v=0.1.0,JobID=50,JobIDRaw=50,User=ann,Account=ec1,Partition=normal,State=RUNNING,Reservation=maint,End=Unknown,ElapsedRaw=10,NodeList=c2-1
";

#[test]
fn test_group_jobs() {
    let jobs = jobs_from(SACCT_TEXT);
    // Job 40 has no main record.
    assert!(jobs.iter().map(|j| j.job_id()).collect::<Vec<u32>>() == vec![20, 31, 50]);
    let j = &jobs[0];
    assert!(j.steps.len() == 1 && j.steps[0].job_step == "batch");
    assert!(j.max_rss() == 4);
    assert!(j.requested_cpu() == 8 * 2 * 3600);
    assert!(j.used_cpu() == 600);
    assert!(j.kind() == SlurmJobKind::Regular);
    assert!(jobs[1].kind() == SlurmJobKind::Array);
    assert!(jobs[1].uses_gpu() && !j.uses_gpu());
}

#[test]
fn test_slurm_filter() {
    let ids = |f: &SlurmFilter| {
        jobs_from(SACCT_TEXT)
            .into_iter()
            .filter(|j| f.accepts(j))
            .map(|j| j.job_id())
            .collect::<Vec<u32>>()
    };
    assert!(ids(&SlurmFilter::default()) == vec![20, 31, 50]);

    let f = SlurmFilter {
        hosts: Some(HostGlobber::from_multi_pattern(false, "c1-3").unwrap()),
        ..Default::default()
    };
    assert!(ids(&f) == vec![20]);

    let f = SlurmFilter {
        gpu_types: vec!["a1".to_string()],
        ..Default::default()
    };
    assert!(ids(&f) == vec![31]);
    let f = SlurmFilter {
        no_gpu: true,
        users: HashSet::from(["ann".to_string()]),
        ..Default::default()
    };
    assert!(ids(&f) == vec![20, 50]);
    let f = SlurmFilter {
        reservations: HashSet::from(["maint".to_string()]),
        ..Default::default()
    };
    assert!(ids(&f) == vec![50]);
    // The array job id matches the element.
    let f = SlurmFilter {
        job_ids: HashSet::from([30]),
        ..Default::default()
    };
    assert!(ids(&f) == vec![31]);
    let f = SlurmFilter {
        min_runtime: Some(60),
        max_runtime: Some(600),
        ..Default::default()
    };
    assert!(ids(&f) == vec![31]);
    let f = SlurmFilter {
        states: HashSet::from(["COMPLETED".to_string(), "RUNNING".to_string()]),
        accounts: HashSet::from(["ec1".to_string()]),
        partitions: HashSet::from(["normal".to_string()]),
        ..Default::default()
    };
    assert!(ids(&f) == vec![20, 50]);
}
