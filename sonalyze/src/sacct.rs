/// The `sacct` view: Slurm job records joined with their steps, filtered on the job's main record.
use crate::format::{self, Report};
use crate::{host_globber, usage, SacctCmdArgs, SacctFilterArgs};

use anyhow::Result;
use rustutils::{HostGlobber, Timestamp};
use sonardb::{select_jobs, Field, FieldKind, SlurmFilter, SlurmJob, SlurmJobKind, Value};
use std::collections::HashSet;
use std::io;

pub fn run(args: &SacctCmdArgs) -> Result<()> {
    let fields = sacct_fields();
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
    let filter = slurm_filter(&args.filter_args).map_err(usage)?;
    args.source_args.window().map_err(usage)?;

    // Sacct data are cluster-wide, the host filter applies to the node list.
    let source = args.source_args.open(HostGlobber::new(true))?;
    let records = source.read_sacct()?;
    let num_records = records.len();
    let jobs = select_jobs(records, &filter);
    tracing::debug!("{num_records} sacct records, {} jobs selected", jobs.len());

    let mut jobs = report.select(jobs);
    report.sort(&mut jobs);
    report.print(&mut io::stdout(), &jobs);
    Ok(())
}

fn slurm_filter(args: &SacctFilterArgs) -> Result<SlurmFilter> {
    let set = |xs: &[String]| xs.iter().cloned().collect::<HashSet<String>>();
    let seconds = |d: &Option<chrono::Duration>| d.map(|d| d.num_seconds().max(0) as u64);
    Ok(SlurmFilter {
        hosts: if args.host.is_empty() {
            None
        } else {
            Some(host_globber(&args.host)?)
        },
        gpu_types: args.gpu_type.clone(),
        states: set(&args.state),
        users: set(&args.user),
        accounts: set(&args.account),
        partitions: set(&args.partition),
        reservations: set(&args.reservation),
        job_ids: args.job.iter().copied().collect::<HashSet<u32>>(),
        min_runtime: seconds(&args.min_runtime),
        max_runtime: seconds(&args.max_runtime),
        some_gpu: args.some_gpu,
        no_gpu: args.no_gpu,
    })
}

const FMT_DEFAULTS: &str = "job,user,account,state,elapsed,reqcpus,usedcpu,maxrss,nodes";

const ALIASES: &[(&str, &str)] = &[
    ("default", FMT_DEFAULTS),
    ("times", "submit,start,end,elapsed,timelimit"),
    ("request", "reqcpus,reqnodes,reqmem,reqgpus"),
];

// Missing times are printed as empty strings.

fn time_value(t: Option<Timestamp>) -> Value {
    match t {
        Some(t) => Value::Timestamp(t),
        None => Value::Str("".to_string()),
    }
}

fn sacct_fields() -> Vec<Field<SlurmJob>> {
    vec![
        Field {
            name: "job",
            help: "Job ID",
            kind: FieldKind::UInt,
            get: |j: &SlurmJob| Value::UInt(j.job_id() as u64),
        },
        Field {
            name: "kind",
            help: "regular, array or het",
            kind: FieldKind::Str,
            get: |j: &SlurmJob| {
                Value::Str(
                    match j.kind() {
                        SlurmJobKind::Regular => "regular",
                        SlurmJobKind::Array => "array",
                        SlurmJobKind::Het => "het",
                    }
                    .to_string(),
                )
            },
        },
        Field {
            name: "name",
            help: "Job name",
            kind: FieldKind::Str,
            get: |j: &SlurmJob| Value::Str(j.main.job_name.to_string()),
        },
        Field {
            name: "user",
            help: "User name",
            kind: FieldKind::Str,
            get: |j: &SlurmJob| Value::Str(j.main.user.to_string()),
        },
        Field {
            name: "account",
            help: "Account name",
            kind: FieldKind::Str,
            get: |j: &SlurmJob| Value::Str(j.main.account.to_string()),
        },
        Field {
            name: "partition",
            help: "Partition",
            kind: FieldKind::Str,
            get: |j: &SlurmJob| Value::Str(j.main.partition.to_string()),
        },
        Field {
            name: "reservation",
            help: "Reservation",
            kind: FieldKind::Str,
            get: |j: &SlurmJob| Value::Str(j.main.reservation.to_string()),
        },
        Field {
            name: "state",
            help: "Final state, eg COMPLETED, TIMEOUT",
            kind: FieldKind::Str,
            get: |j: &SlurmJob| Value::Str(j.main.state.to_string()),
        },
        Field {
            name: "exitcode",
            help: "Exit code",
            kind: FieldKind::UInt,
            get: |j: &SlurmJob| Value::UInt(j.main.exit_code as u64),
        },
        Field {
            name: "submit",
            help: "Submit time",
            kind: FieldKind::Timestamp,
            get: |j: &SlurmJob| time_value(j.main.submit),
        },
        Field {
            name: "start",
            help: "Start time",
            kind: FieldKind::Timestamp,
            get: |j: &SlurmJob| time_value(j.main.start),
        },
        Field {
            name: "end",
            help: "End time",
            kind: FieldKind::Timestamp,
            get: |j: &SlurmJob| time_value(j.main.end),
        },
        Field {
            name: "elapsed",
            help: "Elapsed time",
            kind: FieldKind::Duration,
            get: |j: &SlurmJob| Value::Duration(j.main.elapsed_raw as i64),
        },
        Field {
            name: "timelimit",
            help: "Time limit",
            kind: FieldKind::Duration,
            get: |j: &SlurmJob| Value::Duration(j.main.timelimit_raw as i64),
        },
        Field {
            name: "nodes",
            help: "Node list",
            kind: FieldKind::Str,
            get: |j: &SlurmJob| Value::Str(j.main.node_list.to_string()),
        },
        Field {
            name: "reqcpus",
            help: "Requested cores per node",
            kind: FieldKind::UInt,
            get: |j: &SlurmJob| Value::UInt(j.main.req_cpus as u64),
        },
        Field {
            name: "reqnodes",
            help: "Requested nodes",
            kind: FieldKind::UInt,
            get: |j: &SlurmJob| Value::UInt(j.main.req_nodes as u64),
        },
        Field {
            name: "reqmem",
            help: "Requested memory, GiB",
            kind: FieldKind::UInt,
            get: |j: &SlurmJob| Value::UInt(j.main.req_mem as u64),
        },
        Field {
            name: "reqgpus",
            help: "Requested GPUs, type=count",
            kind: FieldKind::Str,
            get: |j: &SlurmJob| Value::Str(j.main.req_gpus.to_string()),
        },
        Field {
            name: "maxrss",
            help: "Max resident memory across the job and its steps, GiB",
            kind: FieldKind::UInt,
            get: |j: &SlurmJob| Value::UInt(j.max_rss() as u64),
        },
        Field {
            name: "reqcpu",
            help: "Core time reserved, seconds",
            kind: FieldKind::UInt,
            get: |j: &SlurmJob| Value::UInt(j.requested_cpu()),
        },
        Field {
            name: "usedcpu",
            help: "Core time used, user + system, seconds",
            kind: FieldKind::UInt,
            get: |j: &SlurmJob| Value::UInt(j.used_cpu()),
        },
        Field {
            name: "steps",
            help: "Number of job steps",
            kind: FieldKind::UInt,
            get: |j: &SlurmJob| Value::UInt(j.steps.len() as u64),
        },
    ]
}

#[cfg(test)]
use sonardb::parse_sacct;

#[cfg(test)]
fn test_records() -> Vec<Box<sonardb::SacctRecord>> {
    let text = "\
v=0.1.0,JobID=10,JobIDRaw=10,User=ann,Account=a1,State=COMPLETED,Start=2024-11-04T10:00:00Z,End=2024-11-04T11:00:00Z,ElapsedRaw=3600,ReqCPUS=4,NodeList=c1-[1-2],TimelimitRaw=120
v=0.1.0,JobID=10.batch,JobIDRaw=10.batch,End=2024-11-04T11:00:00Z,MaxRSS=2G
v=0.1.0,JobID=11,JobIDRaw=11,User=bob,Account=a2,State=TIMEOUT,Start=2024-11-04T10:59:00Z,End=2024-11-04T11:00:00Z,ElapsedRaw=60,ReqCPUS=1,NodeList=c2-1,TimelimitRaw=1
";
    let mut entries = vec![];
    parse_sacct(text.as_bytes(), &mut entries).unwrap();
    entries
}

#[test]
fn test_sacct_view() {
    let fields = sacct_fields();
    let report = Report::new(
        &fields,
        ALIASES,
        FMT_DEFAULTS,
        Some("job,user,state,elapsed,timelimit,reqcpus,maxrss,steps,nodes,csv"),
        None,
        None,
    )
    .unwrap();
    let run = |args: SacctFilterArgs| {
        let jobs = select_jobs(test_records(), &slurm_filter(&args).unwrap());
        let mut out = vec![];
        report.print(&mut out, &jobs);
        String::from_utf8(out).unwrap()
    };

    assert_eq!(
        run(SacctFilterArgs {
            host: vec!["c1-2".to_string()],
            ..Default::default()
        }),
        "10,ann,COMPLETED,0d1h0m,0d2h0m,4,2,1,c1-[1-2]\n"
    );
    assert_eq!(
        run(SacctFilterArgs {
            state: vec!["TIMEOUT".to_string()],
            ..Default::default()
        }),
        "11,bob,TIMEOUT,0d0h1m,0d0h1m,1,0,0,c2-1\n"
    );
    assert_eq!(
        run(SacctFilterArgs {
            min_runtime: Some(chrono::Duration::minutes(30)),
            ..Default::default()
        })
        .lines()
        .count(),
        1
    );
    assert_eq!(run(Default::default()).lines().count(), 2);
}

#[test]
fn test_slurm_filter_bad_host() {
    assert!(slurm_filter(&SacctFilterArgs {
        host: vec!["c[1-".to_string()],
        ..Default::default()
    })
    .is_err());
}
