/// The `parse` view: print sample records, either as read (deduplicated and filtered) or as the
/// cleaned-up or merged streams the other views work from.
use crate::format::{self, Report};
use crate::{host_globber, read_config, usage, FilterDefaults, ParseCmdArgs, ParsePrintArgs};

use anyhow::Result;
use sonardb::{merge_jobs, postprocess_samples, Field, FieldKind, MergeMode, Sample, Value};
use std::io;

pub fn run(args: &ParseCmdArgs) -> Result<()> {
    let fields = sample_fields();
    let out = &args.output_args;
    if format::maybe_help(&out.fmt, &fields, ALIASES, FMT_DEFAULTS) {
        return Ok(());
    }
    let mut report = Report::new(
        &fields,
        ALIASES,
        FMT_DEFAULTS,
        out.fmt.as_deref(),
        out.query.as_deref(),
        out.sort.as_deref(),
    )
    .map_err(usage)?;
    report.default_to_csv();
    let hosts = host_globber(&args.record_filter_args.host).map_err(usage)?;
    let (from, to) = args.source_args.window().map_err(usage)?;

    // `parse` is about raw data, so all users and commands by default.
    let defaults = FilterDefaults {
        all_users: true,
        ..Default::default()
    };
    let filter = args
        .record_filter_args
        .record_filter(from, to, hosts.clone(), defaults)
        .compile();
    let config = read_config(&args.input_args)?;
    let source = args.source_args.open(hosts)?;
    let entries = source.read_samples()?;

    let output = &mut io::stdout();
    match stream_mode(&args.print_args) {
        None => {
            let rows = entries
                .into_iter()
                .filter(|s| filter(s))
                .map(|s| *s)
                .collect::<Vec<Sample>>();
            print_rows(output, &report, rows);
        }
        Some(mode) => {
            let (streams, bounds) =
                postprocess_samples(entries, |s: &Sample| filter(s), config.as_deref());
            let streams = match mode {
                Some(mode) => merge_jobs(streams, &bounds, mode, None)
                    .into_iter()
                    .map(|s| s.samples)
                    .collect::<Vec<Vec<Box<Sample>>>>(),
                None => streams.into_values().collect::<Vec<Vec<Box<Sample>>>>(),
            };
            for samples in sorted_streams(streams) {
                // Ignore errors here, they are common for broken pipelines
                let _ = output.write_all(b"*\n");
                print_rows(output, &report, samples.into_iter().map(|s| *s).collect());
            }
        }
    }
    Ok(())
}

use std::io::Write;

// None for raw records, Some(None) for clean streams, Some(Some(mode)) for merged streams.

fn stream_mode(args: &ParsePrintArgs) -> Option<Option<MergeMode>> {
    if args.merge_by_job {
        Some(Some(MergeMode::ByJob))
    } else if args.merge_by_host_and_job {
        Some(Some(MergeMode::ByHostAndJob))
    } else if args.clean {
        Some(None)
    } else {
        None
    }
}

// By host, then time of the first sample, then job.

fn sorted_streams(mut streams: Vec<Vec<Box<Sample>>>) -> Vec<Vec<Box<Sample>>> {
    streams.sort_by(|a, b| {
        a[0].hostname
            .cmp(&b[0].hostname)
            .then(a[0].timestamp.cmp(&b[0].timestamp))
            .then(a[0].job_id.cmp(&b[0].job_id))
            .then(a[0].command.cmp(&b[0].command))
    });
    streams
}

fn print_rows(output: &mut dyn io::Write, report: &Report<Sample>, rows: Vec<Sample>) {
    let mut rows = report.select(rows);
    report.sort(&mut rows);
    report.print(output, &rows);
}

const FMT_DEFAULTS: &str = "job,user,cmd";

const ALIASES: &[(&str, &str)] = &[
    ("default", FMT_DEFAULTS),
    ("v", "version"),
    ("cpu%", "cpu_pct"),
    ("gpu%", "gpu_pct"),
    ("gpumem%", "gpumem_pct"),
    ("roundtrip", "version,time,host,user,pid,job,cmd,cpu_pct,cpukib,gpus,gpu_pct,gpumem_pct,gpukib,gpufail,cputime_sec,rolledup"),
];

// The f32 readings print as they were written, not with the noise of widening to f64.

fn reading(x: f32) -> Value {
    Value::Float(x.to_string().parse::<f64>().unwrap_or(x as f64))
}

fn gib(x: f64) -> Value {
    Value::Float((x * 100.0).round() / 100.0)
}

pub fn sample_fields() -> Vec<Field<Sample>> {
    vec![
        Field {
            name: "version",
            help: "Version of the collector",
            kind: FieldKind::Str,
            get: |s: &Sample| Value::Str(s.version.to_string()),
        },
        Field {
            name: "time",
            help: "Time of the sample",
            kind: FieldKind::Timestamp,
            get: |s: &Sample| Value::Timestamp(s.timestamp),
        },
        Field {
            name: "host",
            help: "Host name",
            kind: FieldKind::Str,
            get: |s: &Sample| Value::Str(s.hostname.to_string()),
        },
        Field {
            name: "cores",
            help: "Number of cores on the node",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.num_cores as u64),
        },
        Field {
            name: "memtotal",
            help: "Memory installed on the node, GiB",
            kind: FieldKind::Float,
            get: |s: &Sample| gib(s.memtotal_gb()),
        },
        Field {
            name: "user",
            help: "User name",
            kind: FieldKind::Str,
            get: |s: &Sample| Value::Str(s.user.to_string()),
        },
        Field {
            name: "pid",
            help: "Process ID",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.pid as u64),
        },
        Field {
            name: "ppid",
            help: "Parent process ID",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.ppid as u64),
        },
        Field {
            name: "job",
            help: "Job ID",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.job_id as u64),
        },
        Field {
            name: "cmd",
            help: "Command name",
            kind: FieldKind::Str,
            get: |s: &Sample| Value::Str(s.command.to_string()),
        },
        Field {
            name: "cpu_pct",
            help: "Running average CPU utilization over the life of the process, 100=1 core",
            kind: FieldKind::Float,
            get: |s: &Sample| reading(s.cpu_pct),
        },
        Field {
            name: "mem_gb",
            help: "Virtual memory, GiB",
            kind: FieldKind::Float,
            get: |s: &Sample| gib(s.mem_gb()),
        },
        Field {
            name: "res_gb",
            help: "Resident anonymous memory, GiB",
            kind: FieldKind::Float,
            get: |s: &Sample| gib(s.rssanon_gb()),
        },
        Field {
            name: "cpukib",
            help: "Virtual memory, KiB",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.cpu_kib),
        },
        Field {
            name: "rssanonkib",
            help: "Resident anonymous memory, KiB",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.rssanon_kib),
        },
        Field {
            name: "gpus",
            help: "GPU cards used",
            kind: FieldKind::GpuSet,
            get: |s: &Sample| Value::Gpus(s.gpus),
        },
        Field {
            name: "gpu_pct",
            help: "GPU utilization, 100=1 card",
            kind: FieldKind::Float,
            get: |s: &Sample| reading(s.gpu_pct),
        },
        Field {
            name: "gpumem_pct",
            help: "GPU memory, 100=one card's memory",
            kind: FieldKind::Float,
            get: |s: &Sample| reading(s.gpumem_pct),
        },
        Field {
            name: "gpumem_gb",
            help: "GPU memory, GiB",
            kind: FieldKind::Float,
            get: |s: &Sample| gib(s.gpumem_gb()),
        },
        Field {
            name: "gpukib",
            help: "GPU memory, KiB",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.gpumem_kib),
        },
        Field {
            name: "gpufail",
            help: "1 if a GPU failure was reported",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.gpu_status as u64),
        },
        Field {
            name: "cputime_sec",
            help: "CPU time since the process started, seconds",
            kind: FieldKind::Float,
            get: |s: &Sample| Value::Float(s.cputime_sec),
        },
        Field {
            name: "rolledup",
            help: "Number of other processes rolled up into this record",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.rolledup as u64),
        },
        Field {
            name: "flags",
            help: "Collector flags",
            kind: FieldKind::UInt,
            get: |s: &Sample| Value::UInt(s.flags as u64),
        },
        Field {
            name: "cpu_util_pct",
            help: "CPU utilization since the previous sample, 100=1 core (clean and merged streams only)",
            kind: FieldKind::Float,
            get: |s: &Sample| reading(s.cpu_util_pct),
        },
    ]
}

#[cfg(test)]
use sonardb::parse_samples;

#[test]
fn test_sample_fields() {
    let text = "\
v=0.11.0,time=2024-05-01T09:50:00+00:00,host=c1,user=ann,cmd=python,job=7,pid=70,cpu%=12.3,cpukib=1572864,gpus=0;2,gpu%=51.7,cputime_sec=99
v=0.11.0,time=2024-05-01T09:55:00+00:00,host=c1,user=bob,cmd=bash,pid=80,cpu%=0.1,cpukib=1024
";
    let mut entries = vec![];
    parse_samples(text.as_bytes(), &mut entries).unwrap();
    let fields = sample_fields();
    let mut report = Report::new(
        &fields,
        ALIASES,
        FMT_DEFAULTS,
        Some("time,user,cpu%,mem_gb,gpus,gpu%,cputime_sec"),
        Some("mem_gb > 1"),
        None,
    )
    .unwrap();
    report.default_to_csv();
    let mut out = vec![];
    print_rows(
        &mut out,
        &report,
        entries.into_iter().map(|s| *s).collect::<Vec<Sample>>(),
    );
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "2024-05-01T09:50:00Z,ann,12.3,1.5,\"0,2\",51.7,99\n"
    );
}

#[test]
fn test_stream_mode() {
    let mode = |merge_by_host_and_job, merge_by_job, clean| {
        stream_mode(&ParsePrintArgs {
            merge_by_host_and_job,
            merge_by_job,
            clean,
        })
    };
    assert!(mode(false, false, false).is_none());
    assert!(mode(false, false, true) == Some(None));
    assert!(mode(true, false, false) == Some(Some(MergeMode::ByHostAndJob)));
    assert!(mode(true, true, true) == Some(Some(MergeMode::ByJob)));
}
