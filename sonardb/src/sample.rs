use crate::intern::Sym;

use rustutils::{empty_gpuset, GpuSet, Timestamp};
use std::boxed::Box;

/// GPU Status value

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GpuStatus {
    Ok = 0,
    UnknownFailure = 1,
}

pub fn merge_gpu_status(lhs: GpuStatus, rhs: GpuStatus) -> GpuStatus {
    match (lhs, rhs) {
        (GpuStatus::Ok, GpuStatus::Ok) => GpuStatus::Ok,
        _ => GpuStatus::UnknownFailure,
    }
}

/// One observation of one process (or of a rolled-up group of sibling processes) at one point in
/// time, as written by sonar.  Memory quantities are kept in KiB as on the wire, so that records
/// can be written back out exactly; accessors provide GiB.
///
/// Space is at a premium because there are very many of these: strings are interned and the
/// numeric fields are no wider than they need to be.

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Version of the collector that produced the record, "major.minor.bugfix".
    pub version: Sym,

    /// The time is common to all records created by the same sonar invocation.  It has no subsecond
    /// precision.
    pub timestamp: Timestamp,

    /// Fully qualified domain name.
    pub hostname: Sym,

    /// Number of cores on the node, zero if unknown.
    pub num_cores: u32,

    /// Total memory installed on the node, zero if unknown.
    pub memtotal_kib: u64,

    /// Unix user name, or `_zombie_<PID>` for a zombie whose owner could not be determined.
    pub user: Sym,

    /// Process ID, zero for a rolled-up record in some collector versions.
    pub pid: u32,

    /// Parent process ID, zero if unknown.
    pub ppid: u32,

    /// Job ID, zero for "no job".
    pub job_id: u32,

    /// The command contains at least the executable name.  It may contain spaces and other special
    /// characters, and ends with ` <defunct>` for zombies.
    pub command: Sym,

    /// Running average of CPU usage over the lifetime of the process(es).  IT IS NOT A SAMPLE.
    /// 100.0 = one core's worth.  Generally `cpu_util_pct` is more useful.
    pub cpu_pct: f32,

    /// Virtual memory (data + stack) at the time of sampling.
    pub cpu_kib: u64,

    /// Resident anonymous memory at the time of sampling.
    pub rssanon_kib: u64,

    /// The set of GPUs used by the process(es).
    pub gpus: GpuSet,

    /// Percent of one card's capacity, summed across cards, so it may exceed 100.
    pub gpu_pct: f32,

    /// GPU memory as a percentage of one card's memory, summed across cards.
    pub gpumem_pct: f32,

    /// GPU memory used across all cards in `gpus`.
    pub gpumem_kib: u64,

    pub gpu_status: GpuStatus,

    /// Accumulated CPU time since process start, including children that have terminated and
    /// been waited for.  Adjusted by the postprocessor for children that belong to other jobs.
    pub cputime_sec: f64,

    /// Number of *other* processes rolled up into this record.
    pub rolledup: u32,

    /// Collector flags, opaque here.
    pub flags: u32,

    /// Computed field.  CPU utilization in percent since the previous record in the same stream,
    /// summed across the `rolledup + 1` processes of the record.  For the first record of a stream
    /// this is `cpu_pct`.
    pub cpu_util_pct: f32,
}

const KIB_PER_GIB: f64 = 1024.0 * 1024.0;

impl Sample {
    pub fn mem_gb(&self) -> f64 {
        self.cpu_kib as f64 / KIB_PER_GIB
    }

    pub fn rssanon_gb(&self) -> f64 {
        self.rssanon_kib as f64 / KIB_PER_GIB
    }

    pub fn gpumem_gb(&self) -> f64 {
        self.gpumem_kib as f64 / KIB_PER_GIB
    }

    pub fn memtotal_gb(&self) -> f64 {
        self.memtotal_kib as f64 / KIB_PER_GIB
    }

    /// CPU utilization per process: the rolled-up total divided by the number of processes.
    pub fn per_process_cpu_util(&self) -> f32 {
        self.cpu_util_pct / (self.rolledup + 1) as f32
    }

    /// The stream id: the job id, or the pid if there is no job.
    pub fn stream_id(&self) -> u32 {
        if self.job_id != 0 {
            self.job_id
        } else {
            self.pid
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.command.as_str().contains("<defunct>") || self.user.as_str().starts_with("_zombie_")
    }
}

pub fn gib_to_kib(gb: f64) -> u64 {
    (gb * KIB_PER_GIB).round() as u64
}

/// A sensible "zero" Sample for use when we need one, with all numeric fields zero.

pub fn empty_sample(t: Timestamp, hostname: Sym) -> Box<Sample> {
    Box::new(Sample {
        version: Sym::empty(),
        timestamp: t,
        hostname,
        num_cores: 0,
        memtotal_kib: 0,
        user: Sym::empty(),
        pid: 0,
        ppid: 0,
        job_id: 0,
        command: Sym::empty(),
        cpu_pct: 0.0,
        cpu_kib: 0,
        rssanon_kib: 0,
        gpus: empty_gpuset(),
        gpu_pct: 0.0,
        gpumem_pct: 0.0,
        gpumem_kib: 0,
        gpu_status: GpuStatus::Ok,
        cputime_sec: 0.0,
        rolledup: 0,
        flags: 0,
        cpu_util_pct: 0.0,
    })
}

#[test]
fn test_sample_accessors() {
    use crate::intern::intern;
    let mut s = empty_sample(rustutils::epoch(), intern("a"));
    s.cpu_kib = 2 * 1024 * 1024;
    s.rolledup = 3;
    s.cpu_util_pct = 400.0;
    assert!(s.mem_gb() == 2.0);
    assert!(s.per_process_cpu_util() == 100.0);
    s.pid = 17;
    assert!(s.stream_id() == 17);
    s.job_id = 4;
    assert!(s.stream_id() == 4);
    assert!(!s.is_zombie());
    s.command = intern("python <defunct>");
    assert!(s.is_zombie());
    s.command = intern("python");
    s.user = intern("_zombie_1234");
    assert!(s.is_zombie());
    assert!(gib_to_kib(1.5) == 1536 * 1024);
    assert!(merge_gpu_status(GpuStatus::Ok, GpuStatus::UnknownFailure) == GpuStatus::UnknownFailure);
}
