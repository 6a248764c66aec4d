/// Aggregation of merged job streams into job summaries, and filtering of the summaries.
///
/// Averages are sums divided by the number of samples, peaks are running maxima.  CPU utilization
/// is taken from the derived `cpu_util_pct`, not the collector's running average.
///
/// The relative figures (the r* fields) are percentages of the resources of the job's hosts as
/// given by the cluster config: 100 means all the cores, all the memory, or all the cards.  When a
/// job spans several hosts the resources are summed across them, so a job using all cores on two
/// 64-core nodes has rcpu 100 against the 128-core total.  If any contributing host has no config,
/// the relative figures are zero and `relative` is false.
use crate::intern::Sym;
use crate::sample::{merge_gpu_status, GpuStatus, Sample};
use crate::synthesize::MergedStream;

use rustutils::{empty_gpuset, is_empty_gpuset, union_gpuset, ClusterConfig, GpuSet, Timestamp};

/// Bit values for JobSummary::classification.

pub const LIVE_AT_END: u32 = 1; // Latest timestamp coincides with the latest bound of the job's hosts
pub const LIVE_AT_START: u32 = 2; // Ditto earliest/earliest

#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub job_id: u32,
    pub user: Sym,
    pub hosts: Vec<Sym>,
    pub hostname: Sym, // Compressed host list
    pub commands: Vec<Sym>,

    pub first: Timestamp, // Earliest timestamp seen for job
    pub last: Timestamp,  // Latest ditto
    pub duration: i64,    // Seconds
    pub samples: usize,

    pub uses_gpu: bool, // True if there's reason to believe a GPU was ever used by the job
    pub gpus: GpuSet,
    pub gpu_status: GpuStatus,
    pub zombie: bool,

    pub cpu_avg: f64,  // Average CPU utilization, 1 core == 100%
    pub cpu_peak: f64, // Peak CPU utilization ditto
    pub rcpu_avg: f64, // Average CPU utilization, all cores == 100%
    pub rcpu_peak: f64,

    pub mem_avg: f64, // Virtual memory, GiB
    pub mem_peak: f64,
    pub rmem_avg: f64, // All memory == 100%
    pub rmem_peak: f64,

    pub res_avg: f64, // Resident memory, GiB
    pub res_peak: f64,
    pub rres_avg: f64,
    pub rres_peak: f64,

    pub gpu_avg: f64, // GPU utilization, 1 card == 100%
    pub gpu_peak: f64,
    pub rgpu_avg: f64, // All cards == 100%
    pub rgpu_peak: f64,

    pub gpumem_avg: f64, // GPU memory, GiB
    pub gpumem_peak: f64,
    pub rgpumem_avg: f64, // All GPU memory == 100%
    pub rgpumem_peak: f64,

    pub cputime_sec: f64, // CPU time at the last sample, summed across processes
    pub relative: bool,   // The r* fields are meaningful
    pub classification: u32,

    /// The merged samples of the job, if asked for.  These are copies owned by the summary.
    pub stream: Option<Vec<Box<Sample>>>,
}

#[derive(Debug, Default)]
struct Denominators {
    cores: f64,
    mem_gb: f64,
    cards: f64,
    gpumem_gb: f64,
}

fn denominators(hosts: &[Sym], config: Option<&ClusterConfig>) -> Option<Denominators> {
    let config = config?;
    let mut d = Denominators::default();
    for h in hosts {
        let node = config.lookup(h.as_str())?;
        d.cores += node.cpu_cores as f64;
        d.mem_gb += node.mem_gb as f64;
        d.cards += node.gpu_cards as f64;
        d.gpumem_gb += node.gpumem_gb as f64;
    }
    Some(d)
}

// Zero for a resource the hosts don't have.

fn ratio(x: f64, total: f64) -> f64 {
    if total > 0.0 {
        x / total
    } else {
        0.0
    }
}

/// Summarize one job stream.  The stream is nonempty.  With `retain_stream` the summary gets its own
/// copy of the job's samples.

pub fn aggregate_job(
    job: &MergedStream,
    config: Option<&ClusterConfig>,
    retain_stream: bool,
) -> JobSummary {
    let samples = &job.samples;
    let n = samples.len() as f64;
    let first = samples[0].timestamp;
    let last = samples[samples.len() - 1].timestamp;

    let mut gpus = empty_gpuset();
    let mut gpu_status = GpuStatus::Ok;
    let mut zombie = false;
    let (mut cpu_sum, mut cpu_peak) = (0.0f64, 0.0f64);
    let (mut mem_sum, mut mem_peak) = (0.0f64, 0.0f64);
    let (mut res_sum, mut res_peak) = (0.0f64, 0.0f64);
    let (mut gpu_sum, mut gpu_peak) = (0.0f64, 0.0f64);
    let (mut gpumem_sum, mut gpumem_peak) = (0.0f64, 0.0f64);
    for s in samples {
        union_gpuset(&mut gpus, &s.gpus);
        gpu_status = merge_gpu_status(gpu_status, s.gpu_status);
        zombie = zombie || s.is_zombie();
        let cpu = s.cpu_util_pct as f64;
        cpu_sum += cpu;
        cpu_peak = cpu_peak.max(cpu);
        mem_sum += s.mem_gb();
        mem_peak = mem_peak.max(s.mem_gb());
        res_sum += s.rssanon_gb();
        res_peak = res_peak.max(s.rssanon_gb());
        let gpu = s.gpu_pct as f64;
        gpu_sum += gpu;
        gpu_peak = gpu_peak.max(gpu);
        gpumem_sum += s.gpumem_gb();
        gpumem_peak = gpumem_peak.max(s.gpumem_gb());
    }
    let uses_gpu = samples.iter().any(|s| !is_empty_gpuset(&s.gpus));

    let mut summary = JobSummary {
        job_id: job.job_id,
        user: job.user,
        hosts: job.hosts.clone(),
        hostname: job.hostname,
        commands: job.commands.clone(),
        first,
        last,
        duration: (last - first).num_seconds(),
        samples: samples.len(),
        uses_gpu,
        gpus,
        gpu_status,
        zombie,
        cpu_avg: cpu_sum / n,
        cpu_peak,
        rcpu_avg: 0.0,
        rcpu_peak: 0.0,
        mem_avg: mem_sum / n,
        mem_peak,
        rmem_avg: 0.0,
        rmem_peak: 0.0,
        res_avg: res_sum / n,
        res_peak,
        rres_avg: 0.0,
        rres_peak: 0.0,
        gpu_avg: gpu_sum / n,
        gpu_peak,
        rgpu_avg: 0.0,
        rgpu_peak: 0.0,
        gpumem_avg: gpumem_sum / n,
        gpumem_peak,
        rgpumem_avg: 0.0,
        rgpumem_peak: 0.0,
        cputime_sec: samples[samples.len() - 1].cputime_sec,
        relative: false,
        classification: 0,
        stream: if retain_stream {
            Some(samples.iter().cloned().collect::<Vec<Box<Sample>>>())
        } else {
            None
        },
    };

    if let Some(d) = denominators(&job.hosts, config) {
        summary.relative = true;
        summary.rcpu_avg = ratio(summary.cpu_avg, d.cores);
        summary.rcpu_peak = ratio(summary.cpu_peak, d.cores);
        summary.rmem_avg = ratio(summary.mem_avg * 100.0, d.mem_gb);
        summary.rmem_peak = ratio(summary.mem_peak * 100.0, d.mem_gb);
        summary.rres_avg = ratio(summary.res_avg * 100.0, d.mem_gb);
        summary.rres_peak = ratio(summary.res_peak * 100.0, d.mem_gb);
        summary.rgpu_avg = ratio(summary.gpu_avg, d.cards);
        summary.rgpu_peak = ratio(summary.gpu_peak, d.cards);
        summary.rgpumem_avg = ratio(summary.gpumem_avg * 100.0, d.gpumem_gb);
        summary.rgpumem_peak = ratio(summary.gpumem_peak * 100.0, d.gpumem_gb);
    }

    if first == job.bound.earliest {
        summary.classification |= LIVE_AT_START;
    }
    if last == job.bound.latest {
        summary.classification |= LIVE_AT_END;
    }
    summary
}

/// A numeric field of JobSummary that can be thresholded.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    CpuAvg,
    CpuPeak,
    RcpuAvg,
    RcpuPeak,
    MemAvg,
    MemPeak,
    RmemAvg,
    RmemPeak,
    ResAvg,
    ResPeak,
    RresAvg,
    RresPeak,
    GpuAvg,
    GpuPeak,
    RgpuAvg,
    RgpuPeak,
    GpumemAvg,
    GpumemPeak,
    RgpumemAvg,
    RgpumemPeak,
}

impl Metric {
    pub fn value(&self, j: &JobSummary) -> f64 {
        match self {
            Metric::CpuAvg => j.cpu_avg,
            Metric::CpuPeak => j.cpu_peak,
            Metric::RcpuAvg => j.rcpu_avg,
            Metric::RcpuPeak => j.rcpu_peak,
            Metric::MemAvg => j.mem_avg,
            Metric::MemPeak => j.mem_peak,
            Metric::RmemAvg => j.rmem_avg,
            Metric::RmemPeak => j.rmem_peak,
            Metric::ResAvg => j.res_avg,
            Metric::ResPeak => j.res_peak,
            Metric::RresAvg => j.rres_avg,
            Metric::RresPeak => j.rres_peak,
            Metric::GpuAvg => j.gpu_avg,
            Metric::GpuPeak => j.gpu_peak,
            Metric::RgpuAvg => j.rgpu_avg,
            Metric::RgpuPeak => j.rgpu_peak,
            Metric::GpumemAvg => j.gpumem_avg,
            Metric::GpumemPeak => j.gpumem_peak,
            Metric::RgpumemAvg => j.rgpumem_avg,
            Metric::RgpumemPeak => j.rgpumem_peak,
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(
            self,
            Metric::RcpuAvg
                | Metric::RcpuPeak
                | Metric::RmemAvg
                | Metric::RmemPeak
                | Metric::RresAvg
                | Metric::RresPeak
                | Metric::RgpuAvg
                | Metric::RgpuPeak
                | Metric::RgpumemAvg
                | Metric::RgpumemPeak
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub metric: Metric,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Filter applied to summaries.  Thresholds on relative metrics are ignored for jobs whose
/// relative figures are not available.

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub min_samples: usize,
    pub thresholds: Vec<Threshold>,
    pub min_runtime: Option<i64>, // Seconds
    pub max_runtime: Option<i64>,
    pub some_gpu: bool,
    pub no_gpu: bool,
    pub completed: bool, // Not LIVE_AT_END
    pub running: bool,   // LIVE_AT_END
    pub zombie: bool,
}

impl JobFilter {
    pub fn accepts(&self, j: &JobSummary) -> bool {
        if j.samples < self.min_samples {
            return false;
        }
        for t in &self.thresholds {
            if t.metric.is_relative() && !j.relative {
                continue;
            }
            let v = t.metric.value(j);
            if t.min.is_some_and(|m| v < m) || t.max.is_some_and(|m| v > m) {
                return false;
            }
        }
        if self.min_runtime.is_some_and(|m| j.duration < m)
            || self.max_runtime.is_some_and(|m| j.duration > m)
        {
            return false;
        }
        let mut required = 0;
        let mut forbidden = 0;
        if self.completed {
            forbidden |= LIVE_AT_END;
        }
        if self.running {
            required |= LIVE_AT_END;
        }
        (j.classification & required) == required
            && (j.classification & forbidden) == 0
            && (!self.some_gpu || j.uses_gpu)
            && (!self.no_gpu || !j.uses_gpu)
            && (!self.zombie || j.zombie)
    }
}

/// Aggregate every job and keep the ones the filter accepts, in input order.

pub fn aggregate_and_filter(
    jobs: &[MergedStream],
    config: Option<&ClusterConfig>,
    filter: &JobFilter,
    retain_stream: bool,
) -> Vec<JobSummary> {
    let summaries = jobs
        .iter()
        .filter(|j| j.samples.len() >= filter.min_samples)
        .map(|j| aggregate_job(j, config, retain_stream))
        .filter(|s| filter.accepts(s))
        .collect::<Vec<JobSummary>>();
    tracing::debug!(
        "{} jobs aggregated, {} after filtering",
        jobs.len(),
        summaries.len()
    );
    summaries
}

#[cfg(test)]
use crate::intern::intern;

#[cfg(test)]
use crate::postprocess::postprocess_samples;

#[cfg(test)]
use crate::synthesize::{merge_jobs, MergeMode};

#[cfg(test)]
use rustutils::{timestamp_from_seconds, NodeConfig};

#[cfg(test)]
fn sample(
    host: &str,
    t: i64,
    job: u32,
    cmd: &str,
    user: &str,
    cputime: f64,
) -> Box<crate::sample::Sample> {
    let mut s = crate::sample::empty_sample(timestamp_from_seconds(t).unwrap(), intern(host));
    s.pid = 100;
    s.job_id = job;
    s.command = intern(cmd);
    s.user = intern(user);
    s.cputime_sec = cputime;
    s
}

#[cfg(test)]
fn two_node_config() -> ClusterConfig {
    let node = |name: &str| NodeConfig {
        hostname: name.to_string(),
        cross_node_jobs: true,
        cpu_cores: 64,
        mem_gb: 256,
        ..Default::default()
    };
    ClusterConfig::from_nodes("c", vec![node("n1"), node("n2")])
}

#[test]
fn test_relative_against_summed_resources() {
    let cfg = two_node_config();
    let mut xs = vec![];
    for host in ["n1", "n2"] {
        // 64 cores busy for 100s on each node.
        xs.push(sample(host, 1000, 5, "x", "u", 0.0));
        xs.push(sample(host, 1100, 5, "x", "u", 6400.0));
    }
    xs.push(sample("n1", 1200, 6, "y", "u", 0.0));
    let (streams, bounds) = postprocess_samples(xs, |_| true, Some(&cfg));
    let jobs = merge_jobs(streams, &bounds, MergeMode::Hybrid, Some(&cfg));
    let summaries = aggregate_and_filter(&jobs, Some(&cfg), &JobFilter::default(), false);
    assert_eq!(summaries.len(), 2);
    let j = &summaries[0];
    assert!(j.job_id == 5);
    assert!(j.relative);
    assert!(j.cpu_peak == 12800.0);
    assert!(j.cpu_avg == 6400.0);
    assert!(j.rcpu_peak == 100.0);
    assert!(j.duration == 100);
    assert!(j.classification & LIVE_AT_START != 0);
    // n1 was observed later, at 1200.
    assert!(j.classification & LIVE_AT_END == 0);
    assert!(summaries[1].classification & LIVE_AT_END != 0);

    // No config: relative figures unavailable.
    let j = aggregate_job(&jobs[0], None, false);
    assert!(!j.relative);
    assert!(j.rcpu_peak == 0.0);
}

#[test]
fn test_zombie_detection() {
    let xs = vec![
        sample("h", 100, 1, "python <defunct>", "u", 0.0),
        sample("h", 100, 2, "python", "_zombie_1234", 0.0),
        sample("h", 100, 3, "python", "u", 0.0),
    ];
    let (streams, bounds) = postprocess_samples(xs, |_| true, None);
    let jobs = merge_jobs(streams, &bounds, MergeMode::ByHostAndJob, None);
    let filter = JobFilter {
        min_samples: 1,
        ..Default::default()
    };
    let all = aggregate_and_filter(&jobs, None, &filter, false);
    assert_eq!(all.len(), 3);
    assert!(all[0].zombie && all[1].zombie && !all[2].zombie);
    let filter = JobFilter {
        min_samples: 1,
        zombie: true,
        ..Default::default()
    };
    assert_eq!(aggregate_and_filter(&jobs, None, &filter, false).len(), 2);
}

#[test]
fn test_job_filter() {
    let xs = vec![
        sample("h", 100, 1, "a", "u", 0.0),
        sample("h", 200, 1, "a", "u", 100.0),
        sample("h", 100, 2, "b", "u", 0.0),
        sample("h", 200, 2, "b", "u", 10.0),
        sample("h", 300, 2, "b", "u", 20.0),
        sample("h", 300, 3, "c", "u", 20.0),
    ];
    let (streams, bounds) = postprocess_samples(xs, |_| true, None);
    let jobs = merge_jobs(streams, &bounds, MergeMode::ByHostAndJob, None);

    // Default min_samples in JobFilter is zero; the views set it.
    let filter = JobFilter {
        min_samples: 2,
        ..Default::default()
    };
    let xs = aggregate_and_filter(&jobs, None, &filter, false);
    assert!(xs.iter().map(|j| j.job_id).collect::<Vec<u32>>() == vec![1, 2]);

    let filter = JobFilter {
        min_samples: 2,
        thresholds: vec![Threshold {
            metric: Metric::CpuPeak,
            min: Some(50.0),
            max: None,
        }],
        ..Default::default()
    };
    let xs = aggregate_and_filter(&jobs, None, &filter, false);
    assert!(xs.len() == 1 && xs[0].job_id == 1);

    // Relative thresholds are ignored without config.
    let filter = JobFilter {
        thresholds: vec![Threshold {
            metric: Metric::RcpuAvg,
            min: Some(50.0),
            max: None,
        }],
        ..Default::default()
    };
    assert_eq!(aggregate_and_filter(&jobs, None, &filter, false).len(), 3);

    let filter = JobFilter {
        completed: true,
        ..Default::default()
    };
    let xs = aggregate_and_filter(&jobs, None, &filter, false);
    assert!(xs.len() == 1 && xs[0].job_id == 1);
    let filter = JobFilter {
        running: true,
        min_runtime: Some(150),
        ..Default::default()
    };
    let xs = aggregate_and_filter(&jobs, None, &filter, false);
    assert!(xs.len() == 1 && xs[0].job_id == 2);
    let filter = JobFilter {
        some_gpu: true,
        ..Default::default()
    };
    assert!(aggregate_and_filter(&jobs, None, &filter, false).is_empty());
}

#[test]
fn test_peak_at_least_avg() {
    // Pseudo-random input from a fixed-seed LCG.
    let mut seed: u64 = 0x2545F4914F6CDD1D;
    let mut next = move |n: u64| {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) % n
    };
    let mut xs = vec![];
    for job in 1..20u32 {
        let mut cputime = 0.0;
        for k in 0..(1 + next(30)) as i64 {
            cputime += next(1000) as f64;
            let mut s = sample(
                &format!("h{}", next(3)),
                1000 + k * 60,
                job,
                "p",
                "u",
                cputime,
            );
            s.cpu_pct = next(500) as f32;
            s.cpu_kib = next(1 << 30);
            s.rssanon_kib = next(1 << 30);
            s.gpu_pct = next(300) as f32;
            s.gpumem_kib = next(1 << 26);
            xs.push(s);
        }
    }
    let (streams, bounds) = postprocess_samples(xs, |_| true, None);
    let jobs = merge_jobs(streams, &bounds, MergeMode::ByJob, None);
    let summaries = aggregate_and_filter(&jobs, None, &JobFilter::default(), false);
    assert!(!summaries.is_empty());
    for j in &summaries {
        for (avg, peak) in [
            (j.cpu_avg, j.cpu_peak),
            (j.mem_avg, j.mem_peak),
            (j.res_avg, j.res_peak),
            (j.gpu_avg, j.gpu_peak),
            (j.gpumem_avg, j.gpumem_peak),
        ] {
            assert!(avg >= 0.0);
            assert!(peak >= avg - 1e-9);
        }
    }

    // Same input, same output.
    let again = aggregate_and_filter(&jobs, None, &JobFilter::default(), false);
    assert!(again == summaries);
}

#[test]
fn test_retained_stream() {
    let xs = vec![
        sample("h", 100, 1, "a", "u", 0.0),
        sample("h", 200, 1, "a", "u", 100.0),
        sample("h", 300, 1, "a", "u", 150.0),
    ];
    let (streams, bounds) = postprocess_samples(xs, |_| true, None);
    let jobs = merge_jobs(streams, &bounds, MergeMode::ByHostAndJob, None);

    let without = aggregate_and_filter(&jobs, None, &JobFilter::default(), false);
    assert!(without[0].stream.is_none());

    let with = aggregate_and_filter(&jobs, None, &JobFilter::default(), true);
    let stream = with[0].stream.as_ref().unwrap();
    assert_eq!(stream.len(), 3);
    assert_eq!(stream.len(), with[0].samples);
    for (copy, orig) in stream.iter().zip(jobs[0].samples.iter()) {
        assert!(copy == orig);
        assert!(!std::ptr::eq(&**copy, &**orig));
    }

    // The copy outlives the merged streams it was taken from.
    drop(jobs);
    assert!(with[0].stream.as_ref().unwrap()[2].cputime_sec == 150.0);
}
