/// The `load` view: merge the sample streams by host across jobs, optionally sum the hosts into one
/// cluster-wide series, bucket the series in time and print the load per host and time.
use crate::format::{self, Report};
use crate::{host_globber, read_config, usage, FilterDefaults, LoadCmdArgs};
use crate::{LoadFilterAndAggregationArgs, LoadPrintArgs};

use anyhow::Result;
use rustutils::ClusterConfig;
use sonardb::{fold_samples_daily, fold_samples_hourly, merge_across_hosts, merge_by_host};
use sonardb::{postprocess_samples, Field, FieldKind, MergedStream, Sample, Sym, Value};
use std::boxed::Box;
use std::io;

#[derive(Debug, PartialEq, Clone, Copy)]
enum BucketOpt {
    None,
    Hourly,
    Daily,
}

impl LoadFilterAndAggregationArgs {
    fn bucket(&self) -> BucketOpt {
        if self.daily {
            BucketOpt::Daily
        } else if self.none {
            BucketOpt::None
        } else {
            BucketOpt::Hourly // Default
        }
    }
}

// The capacity of the hosts behind a series, for the relative figures.

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Capacity {
    cores: f64,
    mem_gb: f64,
    cards: f64,
    gpumem_gb: f64,
}

fn capacity(hosts: &[Sym], config: Option<&ClusterConfig>) -> Option<Capacity> {
    let config = config?;
    let mut c = Capacity::default();
    for h in hosts {
        let node = config.lookup(h.as_str())?;
        c.cores += node.cpu_cores as f64;
        c.mem_gb += node.mem_gb as f64;
        c.cards += node.gpu_cards as f64;
        c.gpumem_gb += node.gpumem_gb as f64;
    }
    Some(c)
}

struct LoadRow {
    sample: Box<Sample>,
    capacity: Option<Capacity>,
}

pub fn run(args: &LoadCmdArgs) -> Result<()> {
    let fields = load_fields();
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

    // `load` is about system effects, so all users by default.
    let defaults = FilterDefaults {
        all_users: true,
        skip_system_users: false,
        skip_system_commands: true,
    };
    let filter = args
        .record_filter_args
        .record_filter(from, to, hosts.clone(), defaults)
        .compile();
    let config = read_config(&args.input_args)?;
    let source = args.source_args.open(hosts)?;

    let entries = source.read_samples()?;
    let (streams, bounds) =
        postprocess_samples(entries, |s: &Sample| filter(s), config.as_deref());
    let series = merge_by_host(streams, &bounds);
    let rows = load_rows(series, &args.filter_args, &args.print_args, config.as_deref());

    let mut rows = report.select(rows);
    report.sort(&mut rows);
    report.print(&mut io::stdout(), &rows);
    Ok(())
}

fn load_rows(
    series: Vec<MergedStream>,
    filter_args: &LoadFilterAndAggregationArgs,
    print_args: &LoadPrintArgs,
    config: Option<&ClusterConfig>,
) -> Vec<LoadRow> {
    let series = if filter_args.group {
        merge_across_hosts(series).into_iter().collect::<Vec<MergedStream>>()
    } else {
        series
    };
    tracing::debug!("{} load series", series.len());

    let mut rows = vec![];
    for s in series {
        let capacity = capacity(&s.hosts, config);
        let mut samples = match filter_args.bucket() {
            BucketOpt::Hourly => fold_samples_hourly(&s.samples),
            BucketOpt::Daily => fold_samples_daily(&s.samples),
            BucketOpt::None => s.samples,
        };
        if print_args.last {
            samples = samples.pop().into_iter().collect();
        }
        rows.extend(samples.into_iter().map(|sample| LoadRow { sample, capacity }));
    }
    rows
}

const FMT_DEFAULTS: &str = "date,time,host,cpu,mem,gpu,gpumem,gpus";

const ALIASES: &[(&str, &str)] = &[
    ("default", FMT_DEFAULTS),
    ("relative", "date,time,host,rcpu,rmem,rres,rgpu,rgpumem"),
];

fn up(x: f64) -> Value {
    Value::UInt(x.ceil() as u64)
}

// Percent of `total`, zero if the capacity is unknown or the hosts have none of the resource.

fn relative(r: &LoadRow, x: f64, total: fn(&Capacity) -> f64) -> Value {
    match r.capacity {
        Some(ref c) if total(c) > 0.0 => up(x * 100.0 / total(c)),
        _ => Value::UInt(0),
    }
}

fn load_fields() -> Vec<Field<LoadRow>> {
    vec![
        Field {
            name: "datetime",
            help: "Start of the time bucket, or the time of the sample",
            kind: FieldKind::Timestamp,
            get: |r: &LoadRow| Value::Timestamp(r.sample.timestamp),
        },
        Field {
            name: "date",
            help: "Date part of datetime, YYYY-MM-DD",
            kind: FieldKind::Str,
            get: |r: &LoadRow| Value::Str(r.sample.timestamp.format("%Y-%m-%d").to_string()),
        },
        Field {
            name: "time",
            help: "Time part of datetime, HH:MM",
            kind: FieldKind::Str,
            get: |r: &LoadRow| Value::Str(r.sample.timestamp.format("%H:%M").to_string()),
        },
        Field {
            name: "host",
            help: "Host, or compressed host list for --group",
            kind: FieldKind::Str,
            get: |r: &LoadRow| Value::Str(r.sample.hostname.to_string()),
        },
        Field {
            name: "cpu",
            help: "CPU utilization, 100=1 core",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| up(r.sample.cpu_util_pct as f64),
        },
        Field {
            name: "rcpu",
            help: "CPU utilization, 100=all cores",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| relative(r, r.sample.cpu_util_pct as f64 / 100.0, |c| c.cores),
        },
        Field {
            name: "mem",
            help: "Virtual memory, GiB",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| up(r.sample.mem_gb()),
        },
        Field {
            name: "rmem",
            help: "Virtual memory, 100=all memory",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| relative(r, r.sample.mem_gb(), |c| c.mem_gb),
        },
        Field {
            name: "res",
            help: "Resident memory, GiB",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| up(r.sample.rssanon_gb()),
        },
        Field {
            name: "rres",
            help: "Resident memory, 100=all memory",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| relative(r, r.sample.rssanon_gb(), |c| c.mem_gb),
        },
        Field {
            name: "gpu",
            help: "GPU utilization, 100=1 card",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| up(r.sample.gpu_pct as f64),
        },
        Field {
            name: "rgpu",
            help: "GPU utilization, 100=all cards",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| relative(r, r.sample.gpu_pct as f64 / 100.0, |c| c.cards),
        },
        Field {
            name: "gpumem",
            help: "GPU memory, GiB",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| up(r.sample.gpumem_gb()),
        },
        Field {
            name: "rgpumem",
            help: "GPU memory, 100=all GPU memory",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| relative(r, r.sample.gpumem_gb(), |c| c.gpumem_gb),
        },
        Field {
            name: "gpus",
            help: "GPU cards in use",
            kind: FieldKind::GpuSet,
            get: |r: &LoadRow| Value::Gpus(r.sample.gpus),
        },
        Field {
            name: "processes",
            help: "Number of processes",
            kind: FieldKind::UInt,
            get: |r: &LoadRow| Value::UInt(r.sample.rolledup as u64 + 1),
        },
    ]
}

#[cfg(test)]
use rustutils::{parse_cluster_config, timestamp_from_ymdhms};

#[cfg(test)]
use sonardb::{parse_samples, Timebounds};

#[cfg(test)]
fn test_series() -> Vec<MergedStream> {
    // Two hosts, two jobs on c1, samples five minutes apart across an hour boundary.
    let mut text = String::new();
    for (host, job, pid) in [("c1", 10, 100), ("c1", 11, 110), ("c2", 20, 200)] {
        for i in 0..4 {
            let t = timestamp_from_ymdhms(2024, 5, 1, 9, 50, 0) + chrono::Duration::minutes(5 * i);
            text += &format!(
                "v=1.0.0,time={},host={host},user=u,cmd=c,job={job},pid={pid},cpu%=100,cpukib={},cputime_sec={}\n",
                t.to_rfc3339(),
                2 * 1024 * 1024,
                300 * i
            );
        }
    }
    let mut entries = vec![];
    parse_samples(text.as_bytes(), &mut entries).unwrap();
    let (streams, bounds): (_, Timebounds) = postprocess_samples(entries, |_: &Sample| true, None);
    merge_by_host(streams, &bounds)
}

#[test]
fn test_load_rows() {
    let config = parse_cluster_config(
        r#"[{"hostname":"c[1-2]","cpu_cores":4,"mem_gb":16,"gpu_cards":0,"gpumem_gb":0}]"#,
        "test",
    )
    .unwrap();
    let fields = load_fields();
    let report = Report::new(
        &fields,
        ALIASES,
        FMT_DEFAULTS,
        Some("date,time,host,cpu,rcpu,mem,rmem,rgpu,csv"),
        None,
        None,
    )
    .unwrap();
    let run = |filter_args: &LoadFilterAndAggregationArgs, print_args: &LoadPrintArgs| {
        let rows = load_rows(test_series(), filter_args, print_args, Some(&config));
        let mut out = vec![];
        report.print(&mut out, &rows);
        String::from_utf8(out).unwrap()
    };

    // Hourly buckets: 09:50 and 09:55 go in 09:00, 10:00 and 10:05 in 10:00.  Two jobs on c1 give
    // 200% and 4GiB there.
    let hourly = run(&Default::default(), &Default::default());
    assert_eq!(
        hourly,
        "2024-05-01,09:00,c1,200,50,4,25,0\n\
         2024-05-01,10:00,c1,200,50,4,25,0\n\
         2024-05-01,09:00,c2,100,25,2,13,0\n\
         2024-05-01,10:00,c2,100,25,2,13,0\n"
    );

    let last = run(
        &LoadFilterAndAggregationArgs {
            none: true,
            ..Default::default()
        },
        &LoadPrintArgs {
            all: false,
            last: true,
        },
    );
    assert_eq!(
        last,
        "2024-05-01,10:05,c1,200,50,4,25,0\n\
         2024-05-01,10:05,c2,100,25,2,13,0\n"
    );

    // Grouped, the capacity is that of both hosts.
    let grouped = run(
        &LoadFilterAndAggregationArgs {
            daily: true,
            group: true,
            ..Default::default()
        },
        &Default::default(),
    );
    assert_eq!(grouped, "2024-05-01,00:00,c[1-2],300,38,6,19,0\n");
}
