/// The `node` and `card` views: the configuration of the nodes and their GPU cards as reported by
/// the sysinfo records.  By default only the newest record per host in the window is shown.
use crate::format::{self, Report};
use crate::{host_globber, usage, NodeCmdArgs};

use anyhow::Result;
use sonardb::{Field, FieldKind, GpuCard, Sym, SysinfoRecord, Value};
use std::collections::HashMap;
use std::io;

fn newest_per_host(records: Vec<Box<SysinfoRecord>>, all: bool) -> Vec<Box<SysinfoRecord>> {
    let mut records = if all {
        records
    } else {
        let mut newest = HashMap::<Sym, Box<SysinfoRecord>>::new();
        for r in records {
            match newest.get(&r.hostname) {
                Some(n) if n.timestamp >= r.timestamp => {}
                _ => {
                    newest.insert(r.hostname, r);
                }
            }
        }
        newest.into_values().collect::<Vec<Box<SysinfoRecord>>>()
    };
    records.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.timestamp.cmp(&b.timestamp)));
    records
}

fn read_records(args: &NodeCmdArgs) -> Result<Vec<Box<SysinfoRecord>>> {
    let hosts = host_globber(&args.host).map_err(usage)?;
    args.source_args.window().map_err(usage)?;
    let source = args.source_args.open(hosts)?;
    Ok(newest_per_host(source.read_sysinfo()?, args.all))
}

// None if help was printed.

fn report<'a, T: 'static>(
    args: &NodeCmdArgs,
    fields: &'a [Field<T>],
    aliases: &[(&str, &str)],
    defaults: &str,
) -> Result<Option<Report<'a, T>>> {
    let out = &args.output_args;
    if format::maybe_help(&out.fmt, fields, aliases, defaults) {
        return Ok(None);
    }
    let report = Report::new(
        fields,
        aliases,
        defaults,
        out.fmt.as_deref(),
        out.query.as_deref(),
        out.sort.as_deref(),
    )
    .map_err(usage)?;
    Ok(Some(report))
}

fn print<T: 'static>(report: &Report<T>, rows: Vec<T>) {
    let mut rows = report.select(rows);
    report.sort(&mut rows);
    report.print(&mut io::stdout(), &rows);
}

pub fn run_nodes(args: &NodeCmdArgs) -> Result<()> {
    let fields = node_fields();
    let Some(report) = report(args, &fields, NODE_ALIASES, NODE_DEFAULTS)? else {
        return Ok(());
    };
    let records = read_records(args)?;
    tracing::debug!("{} node records", records.len());
    print(&report, records);
    Ok(())
}

// One row per card, carrying the node's time and host.

struct CardRow {
    record: Box<SysinfoRecord>,
    card: GpuCard,
}

fn card_rows(records: Vec<Box<SysinfoRecord>>) -> Vec<CardRow> {
    let mut rows = vec![];
    for r in records {
        for card in r.cards.clone() {
            rows.push(CardRow {
                record: r.clone(),
                card,
            });
        }
    }
    rows
}

pub fn run_cards(args: &NodeCmdArgs) -> Result<()> {
    let fields = card_fields();
    let Some(report) = report(args, &fields, CARD_ALIASES, CARD_DEFAULTS)? else {
        return Ok(());
    };
    let rows = card_rows(read_records(args)?);
    tracing::debug!("{} card records", rows.len());
    print(&report, rows);
    Ok(())
}

const NODE_DEFAULTS: &str = "host,cores,mem,gpus,gpumem,desc";

const NODE_ALIASES: &[(&str, &str)] = &[
    ("default", NODE_DEFAULTS),
    ("gpuinfo", "gpus,gpumem,gpumem_pct"),
];

fn node_fields() -> Vec<Field<Box<SysinfoRecord>>> {
    vec![
        Field {
            name: "time",
            help: "Time of the record",
            kind: FieldKind::Timestamp,
            get: |r: &Box<SysinfoRecord>| Value::Timestamp(r.timestamp),
        },
        Field {
            name: "host",
            help: "Host name",
            kind: FieldKind::Str,
            get: |r: &Box<SysinfoRecord>| Value::Str(r.hostname.to_string()),
        },
        Field {
            name: "desc",
            help: "Free-text description of the node",
            kind: FieldKind::Str,
            get: |r: &Box<SysinfoRecord>| Value::Str(r.node.description.clone()),
        },
        Field {
            name: "xnode",
            help: "True if jobs on this node can span nodes",
            kind: FieldKind::Bool,
            get: |r: &Box<SysinfoRecord>| Value::Bool(r.node.cross_node_jobs),
        },
        Field {
            name: "cores",
            help: "Number of cores",
            kind: FieldKind::UInt,
            get: |r: &Box<SysinfoRecord>| Value::UInt(r.node.cpu_cores as u64),
        },
        Field {
            name: "mem",
            help: "Main memory, GiB",
            kind: FieldKind::UInt,
            get: |r: &Box<SysinfoRecord>| Value::UInt(r.node.mem_gb as u64),
        },
        Field {
            name: "gpus",
            help: "Number of GPU cards",
            kind: FieldKind::UInt,
            get: |r: &Box<SysinfoRecord>| Value::UInt(r.node.gpu_cards as u64),
        },
        Field {
            name: "gpumem",
            help: "GPU memory across all cards, GiB",
            kind: FieldKind::UInt,
            get: |r: &Box<SysinfoRecord>| Value::UInt(r.node.gpumem_gb as u64),
        },
        Field {
            name: "gpumem_pct",
            help: "True if GPU memory is reported as a percentage",
            kind: FieldKind::Bool,
            get: |r: &Box<SysinfoRecord>| Value::Bool(r.node.gpumem_pct),
        },
    ]
}

const CARD_DEFAULTS: &str = "host,index,model,memory,power";

const CARD_ALIASES: &[(&str, &str)] = &[
    ("default", CARD_DEFAULTS),
    ("power", "powerlimit,maxpowerlimit,minpowerlimit"),
    ("clocks", "maxceclock,maxmemclock"),
];

fn card_fields() -> Vec<Field<CardRow>> {
    vec![
        Field {
            name: "time",
            help: "Time of the record",
            kind: FieldKind::Timestamp,
            get: |r: &CardRow| Value::Timestamp(r.record.timestamp),
        },
        Field {
            name: "host",
            help: "Host name",
            kind: FieldKind::Str,
            get: |r: &CardRow| Value::Str(r.record.hostname.to_string()),
        },
        Field {
            name: "index",
            help: "Card index on the node",
            kind: FieldKind::UInt,
            get: |r: &CardRow| Value::UInt(r.card.index as u64),
        },
        Field {
            name: "uuid",
            help: "Card UUID",
            kind: FieldKind::Str,
            get: |r: &CardRow| Value::Str(r.card.uuid.clone()),
        },
        Field {
            name: "model",
            help: "Card model",
            kind: FieldKind::Str,
            get: |r: &CardRow| Value::Str(r.card.model.clone()),
        },
        Field {
            name: "manufacturer",
            help: "Card manufacturer",
            kind: FieldKind::Str,
            get: |r: &CardRow| Value::Str(r.card.manufacturer.clone()),
        },
        Field {
            name: "memory",
            help: "Card memory, KiB",
            kind: FieldKind::UInt,
            get: |r: &CardRow| Value::UInt(r.card.memory),
        },
        Field {
            name: "powerlimit",
            help: "Current power limit, W",
            kind: FieldKind::UInt,
            get: |r: &CardRow| Value::UInt(r.card.power_limit as u64),
        },
        Field {
            name: "maxpowerlimit",
            help: "Maximum power limit, W",
            kind: FieldKind::UInt,
            get: |r: &CardRow| Value::UInt(r.card.max_power_limit as u64),
        },
        Field {
            name: "minpowerlimit",
            help: "Minimum power limit, W",
            kind: FieldKind::UInt,
            get: |r: &CardRow| Value::UInt(r.card.min_power_limit as u64),
        },
        Field {
            name: "maxceclock",
            help: "Maximum compute element clock, MHz",
            kind: FieldKind::UInt,
            get: |r: &CardRow| Value::UInt(r.card.max_ce_clock as u64),
        },
        Field {
            name: "maxmemclock",
            help: "Maximum memory clock, MHz",
            kind: FieldKind::UInt,
            get: |r: &CardRow| Value::UInt(r.card.max_memory_clock as u64),
        },
        Field {
            name: "driver",
            help: "Driver version",
            kind: FieldKind::Str,
            get: |r: &CardRow| Value::Str(r.card.driver.clone()),
        },
        Field {
            name: "firmware",
            help: "Firmware version",
            kind: FieldKind::Str,
            get: |r: &CardRow| Value::Str(r.card.firmware.clone()),
        },
    ]
}

#[cfg(test)]
use sonardb::parse_sysinfo;

#[cfg(test)]
fn test_records() -> Vec<Box<SysinfoRecord>> {
    let text = r#"{"timestamp":"2024-10-31T10:00:00Z","hostname":"n2","description":"old","cpu_cores":8,"mem_gb":32}
{"timestamp":"2024-10-31T12:00:00Z","hostname":"n2","description":"new","cpu_cores":16,"mem_gb":64,"gpu_cards":2,"gpumem_gb":32,"gpu_info":[{"index":0,"model":"A100","mem_size_kib":16777216,"power_limit_watt":300},{"index":1,"model":"A100","mem_size_kib":16777216,"power_limit_watt":250}]}
{"timestamp":"2024-10-31T11:00:00Z","hostname":"n1","description":"plain","cpu_cores":4,"mem_gb":16}
"#;
    let mut entries = vec![];
    parse_sysinfo(text.as_bytes(), &mut entries).unwrap();
    entries
}

#[test]
fn test_node_view() {
    let fields = node_fields();
    let report = Report::new(
        &fields,
        NODE_ALIASES,
        NODE_DEFAULTS,
        Some("host,desc,cores,mem,gpus,csv"),
        None,
        None,
    )
    .unwrap();
    let mut out = vec![];
    report.print(&mut out, &newest_per_host(test_records(), false));
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "n1,plain,4,16,0\nn2,new,16,64,2\n"
    );
    assert_eq!(newest_per_host(test_records(), true).len(), 3);
}

#[test]
fn test_card_view() {
    let fields = card_fields();
    let report = Report::new(
        &fields,
        CARD_ALIASES,
        CARD_DEFAULTS,
        Some("host,index,model,memory,powerlimit,csv"),
        Some("powerlimit > 260"),
        None,
    )
    .unwrap();
    let rows = report.select(card_rows(newest_per_host(test_records(), false)));
    let mut out = vec![];
    report.print(&mut out, &rows);
    assert_eq!(String::from_utf8(out).unwrap(), "n2,0,A100,16777216,300\n");
}
