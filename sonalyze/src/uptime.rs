/// The `uptime` view: when hosts, and the GPUs on them, were up and down.
///
/// Every record of a host, heartbeats included, is an observation of the host being up.  A gap
/// between consecutive observations longer than twice the sampling interval is a time the host was
/// down, and so is the time between the window's start and a first observation that far away, or
/// between a last observation and the window's end.  Within each time a host was up its GPUs are
/// up while the records at each instant all report the GPUs as ok.
///
/// Up and down windows for the same device meet at their endpoints: the end of one is the start of
/// the next.  Rows are ordered by host and then start time.
use crate::format::{self, Report};
use crate::{host_globber, usage, UptimeCmdArgs, UptimePrintArgs};

use anyhow::{anyhow, Result};
use rustutils::{HostGlobber, Timestamp};
use sonardb::{merge_gpu_status, Field, FieldKind, GpuStatus, Sample, Sym, Value};
use std::cmp::min;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Device {
    Host,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Up,
    Down,
}

struct UptimeRow {
    device: Device,
    host: Sym,
    state: State,
    start: Timestamp,
    end: Timestamp,
}

pub fn run(args: &UptimeCmdArgs) -> Result<()> {
    let fields = uptime_fields();
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
    if args.print_args.interval == 0 {
        return Err(usage(anyhow!("The --interval value must be positive")));
    }
    let hosts = host_globber(&args.host).map_err(usage)?;
    args.source_args.window().map_err(usage)?;
    let source = args.source_args.open(hosts)?;

    let samples = source.read_samples()?;
    let rows = uptime_rows(
        samples,
        &source.hosts,
        source.from,
        source.to,
        &args.print_args,
    );

    let mut rows = report.select(rows);
    report.sort(&mut rows);
    report.print(&mut io::stdout(), &rows);
    Ok(())
}

fn uptime_rows(
    samples: Vec<Box<Sample>>,
    hosts: &HostGlobber,
    from: Timestamp,
    to: Timestamp,
    args: &UptimePrintArgs,
) -> Vec<UptimeRow> {
    let cutoff = chrono::Duration::minutes(2 * args.interval as i64);
    let mut samples = samples
        .into_iter()
        .filter(|s| s.timestamp >= from && s.timestamp < to)
        .filter(|s| hosts.is_empty() || hosts.match_hostname(s.hostname.as_str()))
        .collect::<Vec<Box<Sample>>>();
    samples.sort_by(|a, b| {
        a.hostname
            .cmp(&b.hostname)
            .then(a.timestamp.cmp(&b.timestamp))
    });

    // One observation per host and instant.
    samples.dedup_by(|later, kept| {
        if later.hostname == kept.hostname && later.timestamp == kept.timestamp {
            kept.gpu_status = merge_gpu_status(kept.gpu_status, later.gpu_status);
            true
        } else {
            false
        }
    });

    let mut rows = vec![];
    let mut push = |device: Device, host: Sym, state: State, start: Timestamp, end: Timestamp| {
        rows.push(UptimeRow {
            device,
            host,
            state,
            start,
            end,
        })
    };
    let mut i = 0;
    while i < samples.len() {
        let host = samples[i].hostname;
        let host_start = i;
        while i < samples.len() && samples[i].hostname == host {
            i += 1;
        }
        let xs = &samples[host_start..i];
        let first = xs[0].timestamp;
        let last = xs[xs.len() - 1].timestamp;

        if first - from > cutoff {
            push(Device::Host, host, State::Down, from, first);
        }
        let mut up_start = 0;
        for j in 1..=xs.len() {
            if j < xs.len() && xs[j].timestamp - xs[j - 1].timestamp <= cutoff {
                continue;
            }
            push(
                Device::Host,
                host,
                State::Up,
                xs[up_start].timestamp,
                xs[j - 1].timestamp,
            );
            gpu_windows(&xs[up_start..j], &mut push);
            if j < xs.len() {
                push(
                    Device::Host,
                    host,
                    State::Down,
                    xs[j - 1].timestamp,
                    xs[j].timestamp,
                );
            }
            up_start = j;
        }
        if to - last > cutoff {
            push(Device::Host, host, State::Down, last, to);
        }
    }

    rows.retain(|r| {
        !(args.only_up && r.state == State::Down) && !(args.only_down && r.state == State::Up)
    });
    rows.sort_by(|a, b| a.host.cmp(&b.host).then(a.start.cmp(&b.start)));
    rows
}

// Runs of equal GPU state within one up window of a host.  A run ends where the next one starts,
// or at the end of the window.

fn gpu_windows(
    xs: &[Box<Sample>],
    push: &mut impl FnMut(Device, Sym, State, Timestamp, Timestamp),
) {
    let mut i = 0;
    while i < xs.len() {
        let up = xs[i].gpu_status == GpuStatus::Ok;
        let start = i;
        while i < xs.len() && (xs[i].gpu_status == GpuStatus::Ok) == up {
            i += 1;
        }
        push(
            Device::Gpu,
            xs[start].hostname,
            if up { State::Up } else { State::Down },
            xs[start].timestamp,
            xs[min(i, xs.len() - 1)].timestamp,
        );
    }
}

const FMT_DEFAULTS: &str = "device,host,state,start,end";

const ALIASES: &[(&str, &str)] = &[("default", FMT_DEFAULTS)];

fn uptime_fields() -> Vec<Field<UptimeRow>> {
    vec![
        Field {
            name: "device",
            help: "host or gpu",
            kind: FieldKind::Str,
            get: |r: &UptimeRow| {
                Value::Str(
                    match r.device {
                        Device::Host => "host",
                        Device::Gpu => "gpu",
                    }
                    .to_string(),
                )
            },
        },
        Field {
            name: "host",
            help: "Host name",
            kind: FieldKind::Str,
            get: |r: &UptimeRow| Value::Str(r.host.to_string()),
        },
        Field {
            name: "state",
            help: "up or down",
            kind: FieldKind::Str,
            get: |r: &UptimeRow| {
                Value::Str(
                    match r.state {
                        State::Up => "up",
                        State::Down => "down",
                    }
                    .to_string(),
                )
            },
        },
        Field {
            name: "start",
            help: "Start of the window, inclusive",
            kind: FieldKind::Timestamp,
            get: |r: &UptimeRow| Value::Timestamp(r.start),
        },
        Field {
            name: "end",
            help: "End of the window, exclusive",
            kind: FieldKind::Timestamp,
            get: |r: &UptimeRow| Value::Timestamp(r.end),
        },
    ]
}

#[cfg(test)]
use rustutils::timestamp_from_seconds;

#[cfg(test)]
use sonardb::{empty_sample, intern};

#[cfg(test)]
fn observations() -> Vec<Box<Sample>> {
    let mk = |host: &str, t: i64, ok: bool| {
        let mut s = empty_sample(timestamp_from_seconds(t).unwrap(), intern(host));
        s.command = intern("_heartbeat_");
        if !ok {
            s.gpu_status = GpuStatus::UnknownFailure;
        }
        s
    };
    vec![
        mk("a", 0, true),
        mk("a", 300, true),
        mk("a", 600, true),
        mk("a", 900, false),
        // A second record at the same instant, with a failure, makes the instant a failure.
        mk("a", 1200, true),
        mk("a", 1200, false),
        mk("a", 4300, true),
        mk("a", 4000, true),
        mk("b", 3000, true),
        // Outside the window.
        mk("b", 7300, true),
    ]
}

#[cfg(test)]
fn print_uptime(hosts: &HostGlobber, args: &UptimePrintArgs) -> String {
    let fields = uptime_fields();
    let report = Report::new(
        &fields,
        ALIASES,
        FMT_DEFAULTS,
        Some("device,host,state,start,end,csv"),
        None,
        None,
    )
    .unwrap();
    let rows = uptime_rows(
        observations(),
        hosts,
        timestamp_from_seconds(0).unwrap(),
        timestamp_from_seconds(7200).unwrap(),
        args,
    );
    let mut out = vec![];
    report.print(&mut out, &rows);
    String::from_utf8(out).unwrap()
}

#[test]
fn test_uptime_rows() {
    let args = UptimePrintArgs {
        interval: 5,
        ..Default::default()
    };
    assert_eq!(
        print_uptime(&HostGlobber::new(true), &args),
        "host,a,up,1970-01-01T00:00:00Z,1970-01-01T00:20:00Z
gpu,a,up,1970-01-01T00:00:00Z,1970-01-01T00:15:00Z
gpu,a,down,1970-01-01T00:15:00Z,1970-01-01T00:20:00Z
host,a,down,1970-01-01T00:20:00Z,1970-01-01T01:06:40Z
host,a,up,1970-01-01T01:06:40Z,1970-01-01T01:11:40Z
gpu,a,up,1970-01-01T01:06:40Z,1970-01-01T01:11:40Z
host,a,down,1970-01-01T01:11:40Z,1970-01-01T02:00:00Z
host,b,down,1970-01-01T00:00:00Z,1970-01-01T00:50:00Z
host,b,up,1970-01-01T00:50:00Z,1970-01-01T00:50:00Z
gpu,b,up,1970-01-01T00:50:00Z,1970-01-01T00:50:00Z
host,b,down,1970-01-01T00:50:00Z,1970-01-01T02:00:00Z
"
    );
}

#[test]
fn test_uptime_only_down() {
    let args = UptimePrintArgs {
        interval: 5,
        only_down: true,
        ..Default::default()
    };
    let hosts = HostGlobber::from_multi_pattern(true, "a").unwrap();
    assert_eq!(
        print_uptime(&hosts, &args),
        "gpu,a,down,1970-01-01T00:15:00Z,1970-01-01T00:20:00Z
host,a,down,1970-01-01T00:20:00Z,1970-01-01T01:06:40Z
host,a,down,1970-01-01T01:11:40Z,1970-01-01T02:00:00Z
"
    );
}
