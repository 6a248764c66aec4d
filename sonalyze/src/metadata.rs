/// The `metadata` view: the time bounds of the data per host, or per merged job with
/// --merge-by-job.
use crate::format::{self, Report};
use crate::{host_globber, read_config, usage, FilterDefaults, ParseCmdArgs};

use anyhow::Result;
use rustutils::Timestamp;
use sonardb::{merge_jobs, postprocess_samples, Field, FieldKind, MergeMode, Sample, Timebounds, Value};
use std::io;

struct Item {
    host: String,
    earliest: Timestamp,
    latest: Timestamp,
}

pub fn run(args: &ParseCmdArgs) -> Result<()> {
    let fields = metadata_fields();
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
    let (streams, bounds) =
        postprocess_samples(entries, |s: &Sample| filter(s), config.as_deref());

    let items = if args.print_args.merge_by_job {
        merge_jobs(streams, &bounds, MergeMode::ByJob, None)
            .into_iter()
            .map(|s| Item {
                host: s.samples[0].hostname.to_string(),
                earliest: s.bound.earliest,
                latest: s.bound.latest,
            })
            .collect::<Vec<Item>>()
    } else {
        host_items(bounds)
    };
    tracing::debug!("{} metadata items", items.len());

    let mut items = report.select(sorted(items));
    report.sort(&mut items);
    report.print(&mut io::stdout(), &items);
    Ok(())
}

fn host_items(bounds: Timebounds) -> Vec<Item> {
    bounds
        .into_iter()
        .map(|(host, b)| Item {
            host: host.to_string(),
            earliest: b.earliest,
            latest: b.latest,
        })
        .collect()
}

fn sorted(mut items: Vec<Item>) -> Vec<Item> {
    items.sort_by(|a, b| a.host.cmp(&b.host).then(a.earliest.cmp(&b.earliest)));
    items
}

const FMT_DEFAULTS: &str = "host,earliest,latest";

const ALIASES: &[(&str, &str)] = &[("default", FMT_DEFAULTS)];

fn metadata_fields() -> Vec<Field<Item>> {
    vec![
        Field {
            name: "host",
            help: "Host name, or compressed host list for merged jobs",
            kind: FieldKind::Str,
            get: |i: &Item| Value::Str(i.host.clone()),
        },
        Field {
            name: "earliest",
            help: "Time of the earliest record",
            kind: FieldKind::Timestamp,
            get: |i: &Item| Value::Timestamp(i.earliest),
        },
        Field {
            name: "latest",
            help: "Time of the latest record",
            kind: FieldKind::Timestamp,
            get: |i: &Item| Value::Timestamp(i.latest),
        },
    ]
}

#[cfg(test)]
use sonardb::parse_samples;

#[test]
fn test_host_items() {
    let text = "\
v=1.0.0,time=2024-05-01T10:00:00Z,host=c2,user=u,cmd=c,job=1,pid=1,cpu%=1
v=1.0.0,time=2024-05-01T10:05:00Z,host=c1,user=u,cmd=c,job=2,pid=2,cpu%=1
v=1.0.0,time=2024-05-01T09:00:00Z,host=c2,user=u,cmd=c,job=3,pid=3,cpu%=1
v=1.0.0,time=2024-05-01T11:00:00Z,host=c1,user=u,cmd=c,job=2,pid=2,cpu%=1
";
    let mut entries = vec![];
    parse_samples(text.as_bytes(), &mut entries).unwrap();
    let (_, bounds) = postprocess_samples(entries, |_: &Sample| true, None);
    let fields = metadata_fields();
    let mut report = Report::new(&fields, ALIASES, FMT_DEFAULTS, None, None, None).unwrap();
    report.default_to_csv();
    let mut out = vec![];
    report.print(&mut out, &sorted(host_items(bounds)));
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "c1,2024-05-01T10:05:00Z,2024-05-01T11:00:00Z\n\
         c2,2024-05-01T09:00:00Z,2024-05-01T10:00:00Z\n"
    );
}
