/// The `profile` view: one job broken down into its processes, with the resource use of each
/// process at every time step at which the job was observed.
///
/// The time steps are those of the job's merged stream, which is also the source of the optional
/// total rows.  With --bucket, runs of consecutive time steps are averaged per process, counting
/// only the steps where the process was present, and the row gets the time of the middle step.
/// --max clamps every value before bucketing: a value above the clamp becomes the clamp, and a
/// value above twice the clamp is taken to be noise and becomes zero.
use crate::format::{self, Report};
use crate::{host_globber, read_config, usage, FilterDefaults};
use crate::{ProfileCmdArgs, ProfileFilterAndAggregationArgs};

use anyhow::{anyhow, bail, Result};
use rustutils::{ClusterConfig, Timestamp};
use sonardb::{aggregate_job, intern, merge_jobs, postprocess_samples};
use sonardb::{Field, FieldKind, InputStreamSet, MergeMode, Sample, Sym, Timebounds, Value};
use std::collections::HashMap;
use std::io;

/// The command name of the rows for the whole job.
pub const TOTAL_COMMAND: &str = "_total_";

struct ProfileRow {
    time: Timestamp,
    host: Sym,
    pid: u32,
    command: Sym,
    cpu: f64,
    mem: f64,
    res: f64,
    gpu: f64,
    gpumem: f64,
    nproc: u32,
}

pub fn run(args: &ProfileCmdArgs) -> Result<()> {
    let fields = profile_fields();
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
    let rf = &args.record_filter_args;
    if rf.job.len() != 1 {
        return Err(usage(anyhow!("Exactly one --job is required")));
    }
    if args.filter_args.bucket == Some(0) {
        return Err(usage(anyhow!("The --bucket value must be positive")));
    }
    let hosts = host_globber(&rf.host).map_err(usage)?;
    let (from, to) = args.source_args.window().map_err(usage)?;

    // The job implies the user.
    let defaults = FilterDefaults {
        all_users: true,
        skip_system_users: false,
        skip_system_commands: true,
    };
    let filter = rf.record_filter(from, to, hosts.clone(), defaults).compile();
    let config = read_config(&args.input_args)?;
    let source = args.source_args.open(hosts)?;

    let entries = source.read_samples()?;
    let (streams, bounds) =
        postprocess_samples(entries, |s: &Sample| filter(s), config.as_deref());
    let rows = profile_rows(
        rf.job[0],
        streams,
        &bounds,
        &args.filter_args,
        config.as_deref(),
    )?;

    let mut rows = report.select(rows);
    report.sort(&mut rows);
    report.print(&mut io::stdout(), &rows);
    Ok(())
}

fn profile_rows(
    job_id: u32,
    streams: InputStreamSet,
    bounds: &Timebounds,
    args: &ProfileFilterAndAggregationArgs,
    config: Option<&ClusterConfig>,
) -> Result<Vec<ProfileRow>> {
    let mut processes = streams
        .values()
        .filter(|s| s[0].job_id == job_id)
        .cloned()
        .collect::<Vec<Vec<Box<Sample>>>>();
    processes.sort_by(|a, b| {
        a[0].timestamp
            .cmp(&b[0].timestamp)
            .then(a[0].hostname.cmp(&b[0].hostname))
            .then(a[0].pid.cmp(&b[0].pid))
    });

    let jobs = merge_jobs(streams, bounds, MergeMode::ByJob, config);
    let Some(job) = jobs.iter().find(|j| j.job_id == job_id) else {
        bail!("No samples for job {job_id}")
    };
    let stream = aggregate_job(job, config, true).stream.unwrap_or_default();
    tracing::debug!(
        "Job {job_id}: {} processes, {} time steps",
        processes.len(),
        stream.len()
    );

    let by_time = processes
        .iter()
        .map(|p| {
            p.iter()
                .map(|s| (s.timestamp, &**s))
                .collect::<HashMap<Timestamp, &Sample>>()
        })
        .collect::<Vec<HashMap<Timestamp, &Sample>>>();

    let total = intern(TOTAL_COMMAND);
    let mut rows = vec![];
    for chunk in stream.chunks(args.bucket.unwrap_or(1).max(1)) {
        let time = chunk[chunk.len() / 2].timestamp;
        if args.total {
            let xs = chunk.iter().map(|s| &**s).collect::<Vec<&Sample>>();
            let mut row = average(time, &xs, args.max);
            row.pid = 0;
            row.command = total;
            rows.push(row);
        }
        for samples in &by_time {
            let xs = chunk
                .iter()
                .filter_map(|s| samples.get(&s.timestamp).copied())
                .collect::<Vec<&Sample>>();
            if !xs.is_empty() {
                rows.push(average(time, &xs, args.max));
            }
        }
    }
    Ok(rows)
}

fn clamp(x: f64, max: Option<f64>) -> f64 {
    match max {
        Some(c) if x > 2.0 * c => 0.0,
        Some(c) if x > c => c,
        _ => x,
    }
}

// `xs` is nonempty and all from one stream.

fn average(time: Timestamp, xs: &[&Sample], max: Option<f64>) -> ProfileRow {
    let n = xs.len() as f64;
    let avg = |f: fn(&Sample) -> f64| xs.iter().map(|s| clamp(f(s), max)).sum::<f64>() / n;
    ProfileRow {
        time,
        host: xs[0].hostname,
        pid: xs[0].pid,
        command: xs[0].command,
        cpu: avg(|s| s.cpu_util_pct as f64),
        mem: avg(|s| s.mem_gb()),
        res: avg(|s| s.rssanon_gb()),
        gpu: avg(|s| s.gpu_pct as f64),
        gpumem: avg(|s| s.gpumem_gb()),
        nproc: xs.iter().map(|s| s.rolledup).max().unwrap_or(0) + 1,
    }
}

const FMT_DEFAULTS: &str = "time,pid,cmd,cpu,mem,gpu,gpumem,nproc";

const ALIASES: &[(&str, &str)] = &[
    ("default", FMT_DEFAULTS),
    ("resources", "cpu,mem,res,gpu,gpumem"),
];

fn rounded(x: f64) -> Value {
    Value::UInt(x.round() as u64)
}

fn profile_fields() -> Vec<Field<ProfileRow>> {
    vec![
        Field {
            name: "time",
            help: "Time step, the middle one of a bucket",
            kind: FieldKind::Timestamp,
            get: |r: &ProfileRow| Value::Timestamp(r.time),
        },
        Field {
            name: "host",
            help: "Host of the process, or compressed host list for the total",
            kind: FieldKind::Str,
            get: |r: &ProfileRow| Value::Str(r.host.to_string()),
        },
        Field {
            name: "pid",
            help: "Process ID, 0 for the total and for some rolled-up processes",
            kind: FieldKind::UInt,
            get: |r: &ProfileRow| Value::UInt(r.pid as u64),
        },
        Field {
            name: "cmd",
            help: "Command name, _total_ for the whole job",
            kind: FieldKind::Str,
            get: |r: &ProfileRow| Value::Str(r.command.to_string()),
        },
        Field {
            name: "cpu",
            help: "CPU utilization, 100=1 core",
            kind: FieldKind::UInt,
            get: |r: &ProfileRow| rounded(r.cpu),
        },
        Field {
            name: "mem",
            help: "Virtual memory, GiB",
            kind: FieldKind::UInt,
            get: |r: &ProfileRow| rounded(r.mem),
        },
        Field {
            name: "res",
            help: "Resident memory, GiB",
            kind: FieldKind::UInt,
            get: |r: &ProfileRow| rounded(r.res),
        },
        Field {
            name: "gpu",
            help: "GPU utilization, 100=1 card",
            kind: FieldKind::UInt,
            get: |r: &ProfileRow| rounded(r.gpu),
        },
        Field {
            name: "gpumem",
            help: "GPU memory, GiB",
            kind: FieldKind::UInt,
            get: |r: &ProfileRow| rounded(r.gpumem),
        },
        Field {
            name: "nproc",
            help: "Number of processes behind the row",
            kind: FieldKind::UInt,
            get: |r: &ProfileRow| Value::UInt(r.nproc as u64),
        },
    ]
}

#[cfg(test)]
use rustutils::timestamp_from_seconds;

#[cfg(test)]
fn job_streams() -> (InputStreamSet, Timebounds) {
    let mk = |t: i64, pid: u32, job: u32, cmd: &str, cpu_pct: f32, cputime: f64| {
        let mut s = sonardb::empty_sample(timestamp_from_seconds(t).unwrap(), intern("h1"));
        s.pid = pid;
        s.job_id = job;
        s.command = intern(cmd);
        s.user = intern("ann");
        s.cpu_pct = cpu_pct;
        s.cputime_sec = cputime;
        s
    };
    let xs = vec![
        mk(1000, 10, 5, "python", 50.0, 0.0),
        mk(1060, 10, 5, "python", 0.0, 60.0),
        mk(1120, 10, 5, "python", 0.0, 180.0),
        mk(1060, 11, 5, "helper", 30.0, 0.0),
        mk(1120, 11, 5, "helper", 0.0, 30.0),
        mk(1060, 12, 6, "other", 100.0, 0.0),
    ];
    postprocess_samples(xs, |_| true, None)
}

#[cfg(test)]
fn print_profile(fmt: &str, args: &ProfileFilterAndAggregationArgs) -> String {
    let fields = profile_fields();
    let report = Report::new(&fields, ALIASES, FMT_DEFAULTS, Some(fmt), None, None).unwrap();
    let (streams, bounds) = job_streams();
    let rows = profile_rows(5, streams, &bounds, args, None).unwrap();
    let mut out = vec![];
    report.print(&mut out, &rows);
    String::from_utf8(out).unwrap()
}

#[test]
fn test_profile_rows() {
    let args = ProfileFilterAndAggregationArgs {
        total: true,
        ..Default::default()
    };
    assert_eq!(
        print_profile("time,pid,cmd,cpu,nproc,csv", &args),
        "1970-01-01T00:16:40Z,0,_total_,50,1
1970-01-01T00:16:40Z,10,python,50,1
1970-01-01T00:17:40Z,0,_total_,130,2
1970-01-01T00:17:40Z,10,python,100,1
1970-01-01T00:17:40Z,11,helper,30,1
1970-01-01T00:18:40Z,0,_total_,250,2
1970-01-01T00:18:40Z,10,python,200,1
1970-01-01T00:18:40Z,11,helper,50,1
"
    );

    let (streams, bounds) = job_streams();
    assert!(profile_rows(77, streams, &bounds, &args, None).is_err());
}

#[test]
fn test_profile_bucket_and_clamp() {
    let args = ProfileFilterAndAggregationArgs {
        bucket: Some(2),
        ..Default::default()
    };
    assert_eq!(
        print_profile("time,cmd,cpu,csv", &args),
        "1970-01-01T00:17:40Z,python,75
1970-01-01T00:17:40Z,helper,30
1970-01-01T00:18:40Z,python,200
1970-01-01T00:18:40Z,helper,50
"
    );

    let args = ProfileFilterAndAggregationArgs {
        max: Some(90.0),
        ..Default::default()
    };
    assert_eq!(
        print_profile("cmd,cpu,csv", &args),
        "python,50\npython,90\nhelper,30\npython,0\nhelper,50\n"
    );
}
