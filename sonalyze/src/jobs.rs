/// The `jobs` view: merge the sample streams into jobs, summarize each job, filter the summaries
/// and print them.
use crate::format::{self, Report};
use crate::{host_globber, read_config, usage, FilterDefaults, JobCmdArgs};
use crate::{JobFilterAndAggregationArgs, JobPrintArgs};

use anyhow::Result;
use sonardb::{aggregate_and_filter, merge_jobs, postprocess_samples};
use sonardb::{Field, FieldKind, JobFilter, JobSummary, MergeMode, Sample, Value};
use sonardb::{LIVE_AT_END, LIVE_AT_START};
use std::collections::HashMap;
use std::io;

pub fn run(args: &JobCmdArgs) -> Result<()> {
    let fields = job_fields();
    let out = &args.output_args;
    if format::maybe_help(&out.fmt, &fields, ALIASES, FMT_DEFAULTS) {
        return Ok(());
    }
    let report = Report::new(
        &fields,
        ALIASES,
        FMT_DEFAULTS,
        out.fmt.as_deref(),
        out.query.as_deref(),
        out.sort.as_deref(),
    )
    .map_err(usage)?;
    let hosts = host_globber(&args.record_filter_args.host).map_err(usage)?;
    let (from, to) = args.source_args.window().map_err(usage)?;

    let rf = &args.record_filter_args;
    let defaults = FilterDefaults {
        // --job implies a user, --exclude-user only makes sense with all users, and --zombie is
        // for hunting across all users.
        all_users: !rf.job.is_empty() || !rf.exclude_user.is_empty() || args.filter_args.zombie,
        skip_system_users: !rf.job.is_empty(),
        skip_system_commands: true,
    };
    let filter = rf
        .record_filter(from, to, hosts.clone(), defaults)
        .compile();
    let config = read_config(&args.input_args)?;
    let source = args.source_args.open(hosts)?;

    let entries = source.read_samples()?;
    let num_entries = entries.len();
    let (streams, bounds) =
        postprocess_samples(entries, |s: &Sample| filter(s), config.as_deref());
    tracing::debug!(
        "{num_entries} samples read, {} streams after filtering",
        streams.len()
    );
    let mode = if args.filter_args.batch {
        MergeMode::ByJob
    } else {
        MergeMode::Hybrid
    };
    let jobs = merge_jobs(streams, &bounds, mode, config.as_deref());
    let job_filter = job_filter(&args.filter_args, !rf.job.is_empty());
    let summaries = aggregate_and_filter(&jobs, config.as_deref(), &job_filter, false);

    let summaries = select_rows(&report, summaries, &args.print_args);
    report.print(&mut io::stdout(), &summaries);
    Ok(())
}

fn job_filter(args: &JobFilterAndAggregationArgs, have_jobs: bool) -> JobFilter {
    JobFilter {
        min_samples: args
            .min_samples
            .unwrap_or(if have_jobs { 1 } else { 2 }),
        thresholds: args.thresholds(),
        min_runtime: args.min_runtime.map(|d| d.num_seconds()),
        max_runtime: args.max_runtime.map(|d| d.num_seconds()),
        some_gpu: args.some_gpu,
        no_gpu: args.no_gpu,
        completed: args.completed,
        running: args.running,
        zombie: args.zombie,
    }
}

// Order least-recently-started first, apply the query, keep the `numjobs` most recent per user, and
// finally apply the requested sort.

fn select_rows(
    report: &Report<JobSummary>,
    mut summaries: Vec<JobSummary>,
    print_args: &JobPrintArgs,
) -> Vec<JobSummary> {
    summaries.sort_by(|a, b| a.first.cmp(&b.first).then(a.job_id.cmp(&b.job_id)));
    let mut summaries = report.select(summaries);
    if let Some(n) = print_args.numjobs {
        let mut counts: HashMap<_, usize> = HashMap::new();
        let mut keep = vec![false; summaries.len()];
        for (i, s) in summaries.iter().enumerate().rev() {
            let c = counts.entry(s.user).or_default();
            if *c < n {
                *c += 1;
                keep[i] = true;
            }
        }
        let mut i = 0;
        summaries.retain(|_| {
            i += 1;
            keep[i - 1]
        });
    }
    tracing::debug!("{} jobs after output filtering", summaries.len());
    report.sort(&mut summaries);
    summaries
}

const FMT_DEFAULTS: &str = "std,cpu,mem,gpu,gpumem,cmd";

const ALIASES: &[(&str, &str)] = &[
    ("default", FMT_DEFAULTS),
    ("std", "jobm,user,duration,host"),
    ("cpu", "cpu-avg,cpu-peak"),
    ("rcpu", "rcpu-avg,rcpu-peak"),
    ("mem", "mem-avg,mem-peak"),
    ("rmem", "rmem-avg,rmem-peak"),
    ("res", "res-avg,res-peak"),
    ("rres", "rres-avg,rres-peak"),
    ("gpu", "gpu-avg,gpu-peak"),
    ("rgpu", "rgpu-avg,rgpu-peak"),
    ("gpumem", "gpumem-avg,gpumem-peak"),
    ("rgpumem", "rgpumem-avg,rgpumem-peak"),
];

// Utilization figures are printed as integers, rounded up so that a little use is not shown as
// none.

fn up(x: f64) -> Value {
    Value::UInt(x.ceil() as u64)
}

// The job number with a mark for whether it was live at the start "<", at the end ">", or both "!"
// of the window.

fn jobm(s: &JobSummary) -> String {
    let both = LIVE_AT_START | LIVE_AT_END;
    let mark = if s.classification & both == both {
        "!"
    } else if s.classification & LIVE_AT_START != 0 {
        "<"
    } else if s.classification & LIVE_AT_END != 0 {
        ">"
    } else {
        ""
    };
    format!("{}{mark}", s.job_id)
}

fn job_fields() -> Vec<Field<JobSummary>> {
    vec![
        Field {
            name: "job",
            help: "Job ID",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| Value::UInt(s.job_id as u64),
        },
        Field {
            name: "jobm",
            help: "Job ID, marked '<' if running at the start of the window, '>' at the end, '!' both",
            kind: FieldKind::Str,
            get: |s: &JobSummary| Value::Str(jobm(s)),
        },
        Field {
            name: "user",
            help: "Name of the job's user",
            kind: FieldKind::Str,
            get: |s: &JobSummary| Value::Str(s.user.to_string()),
        },
        Field {
            name: "duration",
            help: "Time between the first and last sample",
            kind: FieldKind::Duration,
            get: |s: &JobSummary| Value::Duration(s.duration),
        },
        Field {
            name: "start",
            help: "Time of the first sample",
            kind: FieldKind::Timestamp,
            get: |s: &JobSummary| Value::Timestamp(s.first),
        },
        Field {
            name: "end",
            help: "Time of the last sample",
            kind: FieldKind::Timestamp,
            get: |s: &JobSummary| Value::Timestamp(s.last),
        },
        Field {
            name: "samples",
            help: "Number of samples",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| Value::UInt(s.samples as u64),
        },
        Field {
            name: "cpu-avg",
            help: "Average CPU utilization, 100=1 core",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.cpu_avg),
        },
        Field {
            name: "cpu-peak",
            help: "Peak CPU utilization, 100=1 core",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.cpu_peak),
        },
        Field {
            name: "rcpu-avg",
            help: "Average CPU utilization, 100=all cores of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rcpu_avg),
        },
        Field {
            name: "rcpu-peak",
            help: "Peak CPU utilization, 100=all cores of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rcpu_peak),
        },
        Field {
            name: "mem-avg",
            help: "Average virtual memory, GiB",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.mem_avg),
        },
        Field {
            name: "mem-peak",
            help: "Peak virtual memory, GiB",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.mem_peak),
        },
        Field {
            name: "rmem-avg",
            help: "Average virtual memory, 100=all memory of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rmem_avg),
        },
        Field {
            name: "rmem-peak",
            help: "Peak virtual memory, 100=all memory of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rmem_peak),
        },
        Field {
            name: "res-avg",
            help: "Average resident memory, GiB",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.res_avg),
        },
        Field {
            name: "res-peak",
            help: "Peak resident memory, GiB",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.res_peak),
        },
        Field {
            name: "rres-avg",
            help: "Average resident memory, 100=all memory of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rres_avg),
        },
        Field {
            name: "rres-peak",
            help: "Peak resident memory, 100=all memory of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rres_peak),
        },
        Field {
            name: "gpu-avg",
            help: "Average GPU utilization, 100=1 card",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.gpu_avg),
        },
        Field {
            name: "gpu-peak",
            help: "Peak GPU utilization, 100=1 card",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.gpu_peak),
        },
        Field {
            name: "rgpu-avg",
            help: "Average GPU utilization, 100=all cards of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rgpu_avg),
        },
        Field {
            name: "rgpu-peak",
            help: "Peak GPU utilization, 100=all cards of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rgpu_peak),
        },
        Field {
            name: "gpumem-avg",
            help: "Average GPU memory, GiB",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.gpumem_avg),
        },
        Field {
            name: "gpumem-peak",
            help: "Peak GPU memory, GiB",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.gpumem_peak),
        },
        Field {
            name: "rgpumem-avg",
            help: "Average GPU memory, 100=all GPU memory of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rgpumem_avg),
        },
        Field {
            name: "rgpumem-peak",
            help: "Peak GPU memory, 100=all GPU memory of the job's hosts",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| up(s.rgpumem_peak),
        },
        Field {
            name: "gpus",
            help: "GPU cards used by the job",
            kind: FieldKind::GpuSet,
            get: |s: &JobSummary| Value::Gpus(s.gpus),
        },
        Field {
            name: "gpufail",
            help: "1 if a GPU failure was reported for the job",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| Value::UInt(s.gpu_status as u64),
        },
        Field {
            name: "cmd",
            help: "The job's commands",
            kind: FieldKind::Str,
            get: |s: &JobSummary| {
                Value::Str(
                    s.commands
                        .iter()
                        .map(|c| c.as_str())
                        .collect::<Vec<&str>>()
                        .join(", "),
                )
            },
        },
        Field {
            name: "host",
            help: "The job's hosts, as a compressed host list",
            kind: FieldKind::Str,
            get: |s: &JobSummary| Value::Str(s.hostname.to_string()),
        },
        Field {
            name: "cputime",
            help: "CPU time at the last sample",
            kind: FieldKind::Duration,
            get: |s: &JobSummary| Value::Duration(s.cputime_sec.round() as i64),
        },
        Field {
            name: "zombie",
            help: "True if the job has zombie processes",
            kind: FieldKind::Bool,
            get: |s: &JobSummary| Value::Bool(s.zombie),
        },
        Field {
            name: "relative",
            help: "True if the relative (r*) figures are available",
            kind: FieldKind::Bool,
            get: |s: &JobSummary| Value::Bool(s.relative),
        },
        Field {
            name: "classification",
            help: "Bit 0 set if live at the end of the window, bit 1 if live at the start",
            kind: FieldKind::UInt,
            get: |s: &JobSummary| Value::UInt(s.classification as u64),
        },
    ]
}

#[cfg(test)]
use rustutils::{empty_gpuset, timestamp_from_ymdhms};

#[cfg(test)]
use sonardb::{intern, GpuStatus};

#[cfg(test)]
fn summary(job_id: u32, user: &str, first_hour: u32, classification: u32) -> JobSummary {
    let first = timestamp_from_ymdhms(2024, 5, 1, first_hour, 0, 0);
    JobSummary {
        job_id,
        user: intern(user),
        hosts: vec![intern("c1-1")],
        hostname: intern("c1-1"),
        commands: vec![intern("python"), intern("srun")],
        first,
        last: first + chrono::Duration::minutes(90),
        duration: 90 * 60,
        samples: 10,
        uses_gpu: false,
        gpus: empty_gpuset(),
        gpu_status: GpuStatus::Ok,
        zombie: false,
        cpu_avg: 150.2,
        cpu_peak: 390.0,
        rcpu_avg: 0.0,
        rcpu_peak: 0.0,
        mem_avg: 1.5,
        mem_peak: 3.0,
        rmem_avg: 0.0,
        rmem_peak: 0.0,
        res_avg: 1.0,
        res_peak: 2.0,
        rres_avg: 0.0,
        rres_peak: 0.0,
        gpu_avg: 0.0,
        gpu_peak: 0.0,
        rgpu_avg: 0.0,
        rgpu_peak: 0.0,
        gpumem_avg: 0.0,
        gpumem_peak: 0.0,
        rgpumem_avg: 0.0,
        rgpumem_peak: 0.0,
        cputime_sec: 8100.0,
        relative: false,
        classification,
        stream: None,
    }
}

#[test]
fn test_job_fields() {
    let fields = job_fields();
    let report = Report::new(&fields, ALIASES, FMT_DEFAULTS, Some("std,cpu,cmd,csv"), None, None)
        .unwrap();
    let mut out = vec![];
    report.print(
        &mut out,
        &[
            summary(7, "ann", 1, LIVE_AT_START),
            summary(8, "bob", 2, LIVE_AT_START | LIVE_AT_END),
            summary(9, "bob", 3, 0),
        ],
    );
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "7<,ann,0d1h30m,c1-1,151,390,\"python, srun\"\n\
         8!,bob,0d1h30m,c1-1,151,390,\"python, srun\"\n\
         9,bob,0d1h30m,c1-1,151,390,\"python, srun\"\n"
    );
}

#[test]
fn test_select_rows() {
    let fields = job_fields();
    let ids = |fmt_query: Option<&str>, sort: Option<&str>, numjobs: Option<usize>| {
        let report = Report::new(&fields, ALIASES, FMT_DEFAULTS, None, fmt_query, sort).unwrap();
        let rows = vec![
            summary(4, "bob", 4, 0),
            summary(1, "ann", 1, 0),
            summary(3, "bob", 3, LIVE_AT_END),
            summary(2, "ann", 2, 0),
            summary(5, "ann", 5, 0),
        ];
        select_rows(&report, rows, &JobPrintArgs { numjobs })
            .iter()
            .map(|s| s.job_id)
            .collect::<Vec<u32>>()
    };
    assert!(ids(None, None, None) == vec![1, 2, 3, 4, 5]);
    // The most recent per user.
    assert!(ids(None, None, Some(1)) == vec![4, 5]);
    assert!(ids(None, Some("user:desc,job:desc"), Some(2)) == vec![4, 3, 5, 2]);
    assert!(ids(Some("user=ann and job > 1"), None, None) == vec![2, 5]);
    assert!(ids(Some("classification = 1"), None, None) == vec![3]);
    assert!(ids(Some("jobm =~ />$/"), None, None) == vec![3]);
}

#[test]
fn test_job_filter_defaults() {
    let args = JobFilterAndAggregationArgs {
        min_cpu_peak: Some(100.0),
        max_rmem_avg: Some(50.0),
        min_runtime: Some(chrono::Duration::minutes(30)),
        ..Default::default()
    };
    let f = job_filter(&args, false);
    assert!(f.min_samples == 2 && f.thresholds.len() == 2);
    assert!(f.min_runtime == Some(1800) && f.max_runtime.is_none());
    let f = job_filter(&args, true);
    assert!(f.min_samples == 1);
    let args = JobFilterAndAggregationArgs {
        min_samples: Some(5),
        ..Default::default()
    };
    assert!(job_filter(&args, true).min_samples == 5);
}
