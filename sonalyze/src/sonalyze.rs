/// `sonalyze` -- Ingest and query `sonar` telemetry stores
///
/// Run with --help for brief help, and with --fmt=help on any view for its fields.
///
/// Quirks
///
/// Having the absence of --user mean "only $LOGNAME" for `jobs` can be confusing -- though it's the
/// right thing for a use case where somebody is looking only at their own jobs.
///
/// The --from and --to values are used *both* for selecting files in the data store (where they
/// are rounded out to whole days) *and* for filtering individual records.  Records whose
/// timestamps do not match the day directory they are in are therefore seen only if the window
/// reaches their own day as well.
///
/// Some filtering options select *records* (from, to, host, user, exclude) and some select *jobs*
/// (the rest of them).  A job that ran partly outside the window or partly on other hosts than
/// the ones selected is summarized from the records that were selected only.
mod command;
mod format;
mod ingest;
mod jobs;
mod load;
mod metadata;
mod nodes;
mod parse;
mod profile;
mod sacct;
mod uptime;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate};
use clap::{ArgGroup, Args, Parser, Subcommand};
use rustutils::{
    now, parse_duration, read_cluster_config, split_multi_pattern, timestamp_from_ymdhms,
    ClusterConfig, HostGlobber, Timestamp,
};
use sonardb::{
    dedup_sacct, dedup_samples, dedup_sysinfo, ClusterStore, Metric, RecordFilter, ReadResult,
    SacctRecord, Sample, StoreOptions, SysinfoRecord, Threshold,
};
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log per-phase statistics and other details to stderr (RUST_LOG overrides)
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print information about the program
    Version,

    /// Print information about jobs
    Jobs(JobCmdArgs),

    /// Print information about system load
    Load(LoadCmdArgs),

    /// Read the sample records, apply source/host filtering, and print their fields
    Parse(ParseCmdArgs),

    /// Read the sample records, apply source/host filtering, and print the time bounds per host
    Metadata(ParseCmdArgs),

    /// Print node hardware information from sysinfo records
    Node(NodeCmdArgs),

    /// Print GPU card information from sysinfo records
    Card(NodeCmdArgs),

    /// Print information about jobs from scheduler accounting records
    Sacct(SacctCmdArgs),

    /// Print the resource use of the processes of one job over time
    Profile(ProfileCmdArgs),

    /// Print when hosts and their GPUs were up and down
    Uptime(UptimeCmdArgs),

    /// Add records from stdin (or a command) to the data store
    Add(AddCmdArgs),
}

#[derive(Args, Debug)]
pub struct JobCmdArgs {
    #[command(flatten)]
    source_args: SourceArgs,

    #[command(flatten)]
    record_filter_args: RecordFilterArgs,

    #[command(flatten)]
    input_args: ConfigArgs,

    #[command(flatten)]
    filter_args: JobFilterAndAggregationArgs,

    #[command(flatten)]
    print_args: JobPrintArgs,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
pub struct LoadCmdArgs {
    #[command(flatten)]
    source_args: SourceArgs,

    #[command(flatten)]
    record_filter_args: RecordFilterArgs,

    #[command(flatten)]
    input_args: ConfigArgs,

    #[command(flatten)]
    filter_args: LoadFilterAndAggregationArgs,

    #[command(flatten)]
    print_args: LoadPrintArgs,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
pub struct ParseCmdArgs {
    #[command(flatten)]
    source_args: SourceArgs,

    #[command(flatten)]
    record_filter_args: RecordFilterArgs,

    #[command(flatten)]
    input_args: ConfigArgs,

    #[command(flatten)]
    print_args: ParsePrintArgs,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
pub struct NodeCmdArgs {
    #[command(flatten)]
    source_args: SourceArgs,

    /// Select records for this host name pattern (repeatable) [default: all]
    #[arg(long)]
    host: Vec<String>,

    /// Print every record in the window, not just the newest per host
    #[arg(long, default_value_t = false)]
    all: bool,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
pub struct ProfileCmdArgs {
    #[command(flatten)]
    source_args: SourceArgs,

    #[command(flatten)]
    record_filter_args: RecordFilterArgs,

    #[command(flatten)]
    input_args: ConfigArgs,

    #[command(flatten)]
    filter_args: ProfileFilterAndAggregationArgs,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
pub struct UptimeCmdArgs {
    #[command(flatten)]
    source_args: SourceArgs,

    /// Select records for this host name pattern (repeatable) [default: all]
    #[arg(long)]
    host: Vec<String>,

    #[command(flatten)]
    print_args: UptimePrintArgs,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
pub struct SacctCmdArgs {
    #[command(flatten)]
    source_args: SourceArgs,

    #[command(flatten)]
    filter_args: SacctFilterArgs,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("data-kind").required(true).args(["sample", "sysinfo", "sacct"])))]
pub struct AddCmdArgs {
    /// Root directory of the data store [default: $SONAR_ROOT]
    #[arg(long)]
    data_path: Option<String>,

    /// Cluster name, a subdirectory of the data path
    #[arg(long)]
    cluster: Option<String>,

    /// Add sample records, one per line
    #[arg(long)]
    sample: bool,

    /// Add one sysinfo record (JSON)
    #[arg(long)]
    sysinfo: bool,

    /// Add sacct records, one per line
    #[arg(long)]
    sacct: bool,

    /// Run this shell command and add its output instead of reading stdin (with --sysinfo only)
    #[arg(long, requires = "sysinfo")]
    command: Option<String>,

    /// Wall-clock limit for --command, in seconds
    #[arg(long, default_value_t = command::DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
}

#[derive(Args, Debug)]
pub struct SourceArgs {
    /// Root directory of the data store [default: $SONAR_ROOT]
    #[arg(long)]
    data_path: Option<String>,

    /// Cluster name, a subdirectory of the data path
    #[arg(long)]
    cluster: Option<String>,

    /// Select records by this time and later.  Format can be YYYY-MM-DD, or Nd or Nw
    /// signifying N days or weeks ago [default: 1d, ie 1 day ago]
    #[arg(long, short, value_parser = parse_time_start_of_day)]
    from: Option<Timestamp>,

    /// Select records by this time and earlier.  Format can be YYYY-MM-DD, or Nd or Nw
    /// signifying N days or weeks ago [default: now]
    #[arg(long, short, value_parser = parse_time_end_of_day)]
    to: Option<Timestamp>,

    /// Data file names (overrides --data-path)
    #[arg(last = true)]
    logfiles: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RecordFilterArgs {
    /// Select records for this host name pattern (repeatable) [default: all]
    #[arg(long)]
    host: Vec<String>,

    /// Select records with this user, "-" for all (repeatable) [default: command dependent]
    #[arg(long, short)]
    user: Vec<String>,

    /// Exclude records where the user name equals this string (repeatable) [default: none]
    #[arg(long)]
    exclude_user: Vec<String>,

    /// Select records with this command name (repeatable) [default: all]
    #[arg(long)]
    command: Vec<String>,

    /// Exclude records where the command name equals this string (repeatable) [default: none]
    #[arg(long)]
    exclude_command: Vec<String>,

    /// Select records for this job (repeatable) [default: all]
    #[arg(long, short)]
    job: Vec<u32>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// File containing JSON data with system information, for when we want to print or use
    /// system-relative values [default: none]
    #[arg(long)]
    config_file: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct OutputArgs {
    /// Select fields and format for the output, "help" for a list [default: view dependent]
    #[arg(long)]
    fmt: Option<String>,

    /// Select only rows for which this predicate over output fields is true, eg 'user=ann and
    /// cpu-peak > 100'
    #[arg(long, short)]
    query: Option<String>,

    /// Sort rows by these fields, each optionally followed by :asc or :desc, eg 'user,cpu-avg:desc'
    #[arg(long)]
    sort: Option<String>,
}

#[derive(Args, Debug, Default)]
#[command(group(ArgGroup::new("bucket").args(["hourly", "daily", "none"])))]
pub struct LoadFilterAndAggregationArgs {
    /// Bucket and average records hourly, cf --daily and --none [default]
    #[arg(long)]
    hourly: bool,

    /// Bucket and average records daily
    #[arg(long)]
    daily: bool,

    /// Do not bucket and average records
    #[arg(long)]
    none: bool,

    /// Sum the load of the selected hosts into one cluster-wide series
    #[arg(long)]
    group: bool,
}

#[derive(Args, Debug, Default)]
pub struct JobFilterAndAggregationArgs {
    /// Select only jobs with at least this many samples [default: 2, or 1 with --job]
    #[arg(long)]
    min_samples: Option<usize>,

    /// Select only jobs with at least this much average CPU use (100=1 full CPU)
    #[arg(long)]
    min_cpu_avg: Option<f64>,

    /// Select only jobs with at most this much average CPU use (100=1 full CPU)
    #[arg(long)]
    max_cpu_avg: Option<f64>,

    /// Select only jobs with at least this much peak CPU use (100=1 full CPU)
    #[arg(long)]
    min_cpu_peak: Option<f64>,

    /// Select only jobs with at most this much peak CPU use (100=1 full CPU)
    #[arg(long)]
    max_cpu_peak: Option<f64>,

    /// Select only jobs with at least this much average relative CPU use (100=all cpus)
    #[arg(long)]
    min_rcpu_avg: Option<f64>,

    /// Select only jobs with at most this much average relative CPU use (100=all cpus)
    #[arg(long)]
    max_rcpu_avg: Option<f64>,

    /// Select only jobs with at least this much peak relative CPU use (100=all cpus)
    #[arg(long)]
    min_rcpu_peak: Option<f64>,

    /// Select only jobs with at most this much peak relative CPU use (100=all cpus)
    #[arg(long)]
    max_rcpu_peak: Option<f64>,

    /// Select only jobs with at least this much average virtual memory use (GB)
    #[arg(long)]
    min_mem_avg: Option<f64>,

    /// Select only jobs with at most this much average virtual memory use (GB)
    #[arg(long)]
    max_mem_avg: Option<f64>,

    /// Select only jobs with at least this much peak virtual memory use (GB)
    #[arg(long)]
    min_mem_peak: Option<f64>,

    /// Select only jobs with at most this much peak virtual memory use (GB)
    #[arg(long)]
    max_mem_peak: Option<f64>,

    /// Select only jobs with at least this much average relative virtual memory use (100=all memory)
    #[arg(long)]
    min_rmem_avg: Option<f64>,

    /// Select only jobs with at most this much average relative virtual memory use (100=all memory)
    #[arg(long)]
    max_rmem_avg: Option<f64>,

    /// Select only jobs with at least this much peak relative virtual memory use (100=all memory)
    #[arg(long)]
    min_rmem_peak: Option<f64>,

    /// Select only jobs with at most this much peak relative virtual memory use (100=all memory)
    #[arg(long)]
    max_rmem_peak: Option<f64>,

    /// Select only jobs with at least this much average resident memory use (GB)
    #[arg(long)]
    min_res_avg: Option<f64>,

    /// Select only jobs with at most this much average resident memory use (GB)
    #[arg(long)]
    max_res_avg: Option<f64>,

    /// Select only jobs with at least this much peak resident memory use (GB)
    #[arg(long)]
    min_res_peak: Option<f64>,

    /// Select only jobs with at most this much peak resident memory use (GB)
    #[arg(long)]
    max_res_peak: Option<f64>,

    /// Select only jobs with at least this much average relative resident memory use (100=all memory)
    #[arg(long)]
    min_rres_avg: Option<f64>,

    /// Select only jobs with at most this much average relative resident memory use (100=all memory)
    #[arg(long)]
    max_rres_avg: Option<f64>,

    /// Select only jobs with at least this much peak relative resident memory use (100=all memory)
    #[arg(long)]
    min_rres_peak: Option<f64>,

    /// Select only jobs with at most this much peak relative resident memory use (100=all memory)
    #[arg(long)]
    max_rres_peak: Option<f64>,

    /// Select only jobs with at least this much average GPU use (100=1 full GPU card)
    #[arg(long)]
    min_gpu_avg: Option<f64>,

    /// Select only jobs with at most this much average GPU use (100=1 full GPU card)
    #[arg(long)]
    max_gpu_avg: Option<f64>,

    /// Select only jobs with at least this much peak GPU use (100=1 full GPU card)
    #[arg(long)]
    min_gpu_peak: Option<f64>,

    /// Select only jobs with at most this much peak GPU use (100=1 full GPU card)
    #[arg(long)]
    max_gpu_peak: Option<f64>,

    /// Select only jobs with at least this much average relative GPU use (100=all cards)
    #[arg(long)]
    min_rgpu_avg: Option<f64>,

    /// Select only jobs with at most this much average relative GPU use (100=all cards)
    #[arg(long)]
    max_rgpu_avg: Option<f64>,

    /// Select only jobs with at least this much peak relative GPU use (100=all cards)
    #[arg(long)]
    min_rgpu_peak: Option<f64>,

    /// Select only jobs with at most this much peak relative GPU use (100=all cards)
    #[arg(long)]
    max_rgpu_peak: Option<f64>,

    /// Select only jobs with at least this much average GPU memory use (GB)
    #[arg(long)]
    min_gpumem_avg: Option<f64>,

    /// Select only jobs with at most this much average GPU memory use (GB)
    #[arg(long)]
    max_gpumem_avg: Option<f64>,

    /// Select only jobs with at least this much peak GPU memory use (GB)
    #[arg(long)]
    min_gpumem_peak: Option<f64>,

    /// Select only jobs with at most this much peak GPU memory use (GB)
    #[arg(long)]
    max_gpumem_peak: Option<f64>,

    /// Select only jobs with at least this much average relative GPU memory use (100=all GPU memory)
    #[arg(long)]
    min_rgpumem_avg: Option<f64>,

    /// Select only jobs with at most this much average relative GPU memory use (100=all GPU memory)
    #[arg(long)]
    max_rgpumem_avg: Option<f64>,

    /// Select only jobs with at least this much peak relative GPU memory use (100=all GPU memory)
    #[arg(long)]
    min_rgpumem_peak: Option<f64>,

    /// Select only jobs with at most this much peak relative GPU memory use (100=all GPU memory)
    #[arg(long)]
    max_rgpumem_peak: Option<f64>,

    /// Select only jobs with at least this much runtime, format `WwDdHhMm`, all parts optional
    #[arg(long, value_parser = parse_duration)]
    min_runtime: Option<chrono::Duration>,

    /// Select only jobs with at most this much runtime, format `WwDdHhMm`, all parts optional
    #[arg(long, value_parser = parse_duration)]
    max_runtime: Option<chrono::Duration>,

    /// Select only jobs with no GPU use
    #[arg(long, default_value_t = false)]
    no_gpu: bool,

    /// Select only jobs with some GPU use
    #[arg(long, default_value_t = false)]
    some_gpu: bool,

    /// Select only jobs that have run to completion
    #[arg(long, default_value_t = false)]
    completed: bool,

    /// Select only jobs that are still running
    #[arg(long, default_value_t = false)]
    running: bool,

    /// Select only zombie jobs (usually these are still running)
    #[arg(long, default_value_t = false)]
    zombie: bool,

    /// Aggregate data across hosts (appropriate for batch systems)
    #[arg(long, short, default_value_t = false)]
    batch: bool,
}

impl JobFilterAndAggregationArgs {
    fn thresholds(&self) -> Vec<Threshold> {
        [
            (Metric::CpuAvg, self.min_cpu_avg, self.max_cpu_avg),
            (Metric::CpuPeak, self.min_cpu_peak, self.max_cpu_peak),
            (Metric::RcpuAvg, self.min_rcpu_avg, self.max_rcpu_avg),
            (Metric::RcpuPeak, self.min_rcpu_peak, self.max_rcpu_peak),
            (Metric::MemAvg, self.min_mem_avg, self.max_mem_avg),
            (Metric::MemPeak, self.min_mem_peak, self.max_mem_peak),
            (Metric::RmemAvg, self.min_rmem_avg, self.max_rmem_avg),
            (Metric::RmemPeak, self.min_rmem_peak, self.max_rmem_peak),
            (Metric::ResAvg, self.min_res_avg, self.max_res_avg),
            (Metric::ResPeak, self.min_res_peak, self.max_res_peak),
            (Metric::RresAvg, self.min_rres_avg, self.max_rres_avg),
            (Metric::RresPeak, self.min_rres_peak, self.max_rres_peak),
            (Metric::GpuAvg, self.min_gpu_avg, self.max_gpu_avg),
            (Metric::GpuPeak, self.min_gpu_peak, self.max_gpu_peak),
            (Metric::RgpuAvg, self.min_rgpu_avg, self.max_rgpu_avg),
            (Metric::RgpuPeak, self.min_rgpu_peak, self.max_rgpu_peak),
            (Metric::GpumemAvg, self.min_gpumem_avg, self.max_gpumem_avg),
            (Metric::GpumemPeak, self.min_gpumem_peak, self.max_gpumem_peak),
            (Metric::RgpumemAvg, self.min_rgpumem_avg, self.max_rgpumem_avg),
            (Metric::RgpumemPeak, self.min_rgpumem_peak, self.max_rgpumem_peak),
        ]
        .into_iter()
        .filter(|(_, min, max)| min.is_some() || max.is_some())
        .map(|(metric, min, max)| Threshold { metric, min, max })
        .collect::<Vec<Threshold>>()
    }
}

#[derive(Args, Debug, Default)]
#[command(group(ArgGroup::new("times").args(["all", "last"])))]
pub struct LoadPrintArgs {
    /// Print records for all times (after bucketing), cf --last [default]
    #[arg(long)]
    all: bool,

    /// Print records for the last time instant (after bucketing)
    #[arg(long)]
    last: bool,
}

#[derive(Args, Debug, Default)]
pub struct ProfileFilterAndAggregationArgs {
    /// Clamp values to this maximum; values above twice the maximum are taken to be noise and
    /// zeroed [default: no clamping]
    #[arg(long)]
    max: Option<f64>,

    /// Average consecutive time steps in buckets of this size [default: 1]
    #[arg(long)]
    bucket: Option<usize>,

    /// Also print a row for the whole job at each time step
    #[arg(long)]
    total: bool,
}

#[derive(Args, Debug, Default)]
#[command(group(ArgGroup::new("updown").args(["only_up", "only_down"])))]
pub struct UptimePrintArgs {
    /// The sampling interval in minutes; a gap of more than twice this is downtime
    #[arg(long)]
    interval: u64,

    /// Print only the times a device was up
    #[arg(long)]
    only_up: bool,

    /// Print only the times a device was down
    #[arg(long)]
    only_down: bool,
}

#[derive(Args, Debug, Default)]
pub struct JobPrintArgs {
    /// Print at most these many most recent jobs per user [default: all]
    #[arg(long, short)]
    numjobs: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct ParsePrintArgs {
    /// Merge streams that have the same host and job ID (experts only)
    #[arg(long, default_value_t = false)]
    merge_by_host_and_job: bool,

    /// Merge streams that have the same job ID, across hosts (experts only)
    #[arg(long, default_value_t = false)]
    merge_by_job: bool,

    /// Clean the streams but perform no merging
    #[arg(long, default_value_t = false)]
    clean: bool,
}

#[derive(Args, Debug, Default)]
pub struct SacctFilterArgs {
    /// Select jobs that ran on a node matching this host name pattern (repeatable) [default: all]
    #[arg(long)]
    host: Vec<String>,

    /// Select jobs with this user (repeatable) [default: all]
    #[arg(long, short)]
    user: Vec<String>,

    /// Select jobs with this account (repeatable) [default: all]
    #[arg(long)]
    account: Vec<String>,

    /// Select jobs in this partition (repeatable) [default: all]
    #[arg(long)]
    partition: Vec<String>,

    /// Select jobs in this reservation (repeatable) [default: all]
    #[arg(long)]
    reservation: Vec<String>,

    /// Select jobs in this state, eg COMPLETED, TIMEOUT (repeatable) [default: all]
    #[arg(long)]
    state: Vec<String>,

    /// Select this job, or the array or heterogeneous job it is part of (repeatable) [default: all]
    #[arg(long, short)]
    job: Vec<u32>,

    /// Select jobs requesting a GPU whose model starts with this (repeatable) [default: all]
    #[arg(long)]
    gpu_type: Vec<String>,

    /// Select only jobs with at least this much elapsed time, format `WwDdHhMm`
    #[arg(long, value_parser = parse_duration)]
    min_runtime: Option<chrono::Duration>,

    /// Select only jobs with at most this much elapsed time, format `WwDdHhMm`
    #[arg(long, value_parser = parse_duration)]
    max_runtime: Option<chrono::Duration>,

    /// Select only jobs requesting some GPU
    #[arg(long, default_value_t = false)]
    some_gpu: bool,

    /// Select only jobs requesting no GPU
    #[arg(long, default_value_t = false)]
    no_gpu: bool,
}

// A usage error is reported like any other error but exits with a different code.  Errors in
// the flags that clap can't see are wrapped as usage errors before any I/O is done.

#[derive(Debug)]
pub struct UsageError(String);

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UsageError {}

pub fn usage(e: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(UsageError(format!("{e:#}")))
}

// The command arg parsers don't need to include the string being parsed because the error generated
// by clap includes that.

// YYYY-MM-DD, or Nd, Nw.
fn parse_time(s: &str, end_of_day: bool) -> Result<Timestamp> {
    if let Some(n) = s.strip_suffix('d') {
        let Ok(k) = u32::from_str(n) else {
            bail!("Invalid date")
        };
        Ok(now() - chrono::Duration::days(k as i64))
    } else if let Some(n) = s.strip_suffix('w') {
        let Ok(k) = u32::from_str(n) else {
            bail!("Invalid date")
        };
        Ok(now() - chrono::Duration::weeks(k as i64))
    } else {
        let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") else {
            bail!("Invalid date syntax")
        };
        let (h, m, sec) = if end_of_day { (23, 59, 59) } else { (0, 0, 0) };
        Ok(timestamp_from_ymdhms(d.year(), d.month(), d.day(), h, m, sec))
    }
}

fn parse_time_start_of_day(s: &str) -> Result<Timestamp> {
    parse_time(s, false)
}

fn parse_time_end_of_day(s: &str) -> Result<Timestamp> {
    parse_time(s, true)
}

/// Host name patterns from repeatable --host options, each of which may be a multi-pattern.

pub fn host_globber(hosts: &[String]) -> Result<HostGlobber> {
    let mut globber = HostGlobber::new(true);
    for h in hosts {
        for p in split_multi_pattern(h)? {
            globber.insert(&p)?;
        }
    }
    Ok(globber)
}

/// The store and the time window for one query.

pub struct Source {
    pub store: ClusterStore,
    pub hosts: HostGlobber,
    pub from: Timestamp,
    pub to: Timestamp,
}

impl SourceArgs {
    /// The time window.  `from` after `to` is a usage error.
    pub fn window(&self) -> Result<(Timestamp, Timestamp)> {
        let from = self.from.unwrap_or_else(|| now() - chrono::Duration::days(1));
        let to = self.to.unwrap_or_else(now);
        if from > to {
            bail!("The --from time is greater than the --to time");
        }
        Ok((from, to))
    }

    /// Open the store: the files named on the command line if there are any, otherwise the
    /// cluster directory read-only.  If the files are named then they are not filtered by time.

    pub fn open(&self, hosts: HostGlobber) -> Result<Source> {
        let (from, to) = self.window()?;
        let options = StoreOptions::default();
        let store = if !self.logfiles.is_empty() {
            tracing::debug!("Data files: {:?}", self.logfiles);
            let files = self.logfiles.iter().map(PathBuf::from).collect::<Vec<PathBuf>>();
            ClusterStore::open_read_only(files, options)
        } else {
            let dir = cluster_dir(&self.data_path, &self.cluster)?;
            tracing::debug!("Data directory: {:?}", dir);
            ClusterStore::open_tree_read_only(&dir, options)?
        };
        Ok(Source {
            store,
            hosts,
            from,
            to,
        })
    }
}

pub fn cluster_dir(data_path: &Option<String>, cluster: &Option<String>) -> Result<PathBuf> {
    let root = match data_path {
        Some(p) => p.clone(),
        None => match env::var("SONAR_ROOT") {
            Ok(p) => p,
            Err(_) => bail!("No data path"),
        },
    };
    let mut dir = PathBuf::from(root);
    if let Some(c) = cluster {
        dir.push(c);
    }
    Ok(dir)
}

fn report<T>(what: &str, r: &ReadResult<T>) -> Result<()> {
    if r.files_failed > 0 {
        tracing::warn!("{} {what} files could not be read", r.files_failed);
    }
    tracing::debug!(
        "{what}: {} records read, {} dropped at decode, {} with bad timestamps",
        r.num_records(),
        r.records_dropped,
        r.bad_timestamps
    );
    r.status()
}

impl Source {
    pub fn read_samples(&self) -> Result<Vec<Box<Sample>>> {
        let r = self.store.read_samples(&self.hosts, self.from, self.to)?;
        report("Sample", &r)?;
        Ok(dedup_samples(r.records))
    }

    pub fn read_sysinfo(&self) -> Result<Vec<Box<SysinfoRecord>>> {
        let r = self.store.read_sysinfo(&self.hosts, self.from, self.to)?;
        report("Sysinfo", &r)?;
        Ok(dedup_sysinfo(r.records))
    }

    pub fn read_sacct(&self) -> Result<Vec<Box<SacctRecord>>> {
        let r = self.store.read_sacct(self.from, self.to)?;
        report("Sacct", &r)?;
        Ok(dedup_sacct(r.records))
    }
}

pub fn read_config(args: &ConfigArgs) -> Result<Option<Arc<ClusterConfig>>> {
    match args.config_file {
        Some(ref filename) => Ok(Some(Arc::new(
            read_cluster_config(filename).with_context(|| format!("Config file {filename}"))?,
        ))),
        None => Ok(None),
    }
}

/// How the record filter fills in what the user did not say.

#[derive(Debug, Default, Clone, Copy)]
pub struct FilterDefaults {
    /// With no --user, select all users rather than just $LOGNAME.
    pub all_users: bool,
    /// Exclude root and zabbix.
    pub skip_system_users: bool,
    /// Exclude shells, sshd and similar, and heartbeat records.
    pub skip_system_commands: bool,
}

impl RecordFilterArgs {
    pub fn record_filter(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: HostGlobber,
        defaults: FilterDefaults,
    ) -> RecordFilter {
        let mut users = HashSet::<String>::new();
        if !self.user.is_empty() {
            if !self.user.iter().any(|user| user == "-") {
                users.extend(self.user.iter().cloned());
            }
        } else if !defaults.all_users {
            if let Ok(u) = env::var("LOGNAME") {
                users.insert(u);
            }
        }

        let mut exclude_users = self.exclude_user.iter().cloned().collect::<HashSet<String>>();
        if defaults.skip_system_users {
            exclude_users.insert("root".to_string());
            exclude_users.insert("zabbix".to_string());
        }

        let mut exclude_commands = self
            .exclude_command
            .iter()
            .cloned()
            .collect::<HashSet<String>>();
        if defaults.skip_system_commands {
            for c in ["bash", "zsh", "sshd", "tmux", "systemd", "_heartbeat_"] {
                exclude_commands.insert(c.to_string());
            }
        }

        RecordFilter {
            from: Some(from),
            to: Some(to),
            hosts: Some(hosts),
            users,
            exclude_users,
            commands: self.command.iter().cloned().collect::<HashSet<String>>(),
            exclude_commands,
            job_ids: self.job.iter().copied().collect::<HashSet<u32>>(),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match sonalyze(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            let code = if e.downcast_ref::<UsageError>().is_some() {
                2
            } else {
                1
            };
            process::exit(code);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn sonalyze(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            // Syntax:
            //  - components of the version string are space-separated but there are spaces nowhere else
            //  - the keyword "sonalyze" is always the first component
            //  - every component is keyword(value)
            //  - "version" carries a semver
            //  - "features" carries a comma-separated list of enabled features
            println!(
                "sonalyze version({}) features()",
                env!("CARGO_PKG_VERSION")
            );
            Ok(())
        }
        Commands::Jobs(ref args) => jobs::run(args),
        Commands::Load(ref args) => load::run(args),
        Commands::Parse(ref args) => parse::run(args),
        Commands::Metadata(ref args) => metadata::run(args),
        Commands::Node(ref args) => nodes::run_nodes(args),
        Commands::Card(ref args) => nodes::run_cards(args),
        Commands::Sacct(ref args) => sacct::run(args),
        Commands::Profile(ref args) => profile::run(args),
        Commands::Uptime(ref args) => uptime::run(args),
        Commands::Add(ref args) => ingest::run(args),
    }
}

#[cfg(test)]
use rustutils::timestamp_from_ymd;

#[test]
fn test_parse_time() {
    assert!(parse_time("2024-02-29", false).unwrap() == timestamp_from_ymd(2024, 2, 29));
    assert!(
        parse_time("2024-02-29", true).unwrap() == timestamp_from_ymdhms(2024, 2, 29, 23, 59, 59)
    );
    assert!(parse_time("2023-02-29", false).is_err());
    assert!(parse_time("2023-2", false).is_err());
    assert!(parse_time("xd", false).is_err());

    let t = now();
    let d = parse_time("3d", false).unwrap();
    assert!((t - d).num_days() == 3 || (t - d).num_days() == 2);
    let w = parse_time("2w", true).unwrap();
    assert!((t - w).num_days() <= 14 && (t - w).num_days() >= 13);
}

#[test]
fn test_cli_usage() {
    use clap::CommandFactory;
    Cli::command().debug_assert();

    let cli = Cli::try_parse_from(["sonalyze", "jobs", "--min-cpu-avg", "50", "-b", "--", "a.csv"])
        .unwrap();
    let Commands::Jobs(args) = cli.command else {
        panic!("Expected jobs")
    };
    assert!(args.filter_args.batch);
    assert!(args.source_args.logfiles == vec!["a.csv".to_string()]);
    let ts = args.filter_args.thresholds();
    assert!(ts.len() == 1 && ts[0].metric == Metric::CpuAvg && ts[0].min == Some(50.0));

    // Exactly one kind for `add`, and --command goes with --sysinfo only.
    assert!(Cli::try_parse_from(["sonalyze", "add"]).is_err());
    assert!(Cli::try_parse_from(["sonalyze", "add", "--sample", "--sacct"]).is_err());
    assert!(Cli::try_parse_from(["sonalyze", "add", "--sample", "--command", "x"]).is_err());
    assert!(Cli::try_parse_from(["sonalyze", "add", "--sysinfo", "--command", "x"]).is_ok());

    let cli = Cli::try_parse_from(["sonalyze", "profile", "-j", "5", "--bucket", "3", "--total"])
        .unwrap();
    let Commands::Profile(args) = cli.command else {
        panic!("Expected profile")
    };
    assert!(args.record_filter_args.job == vec![5]);
    assert!(args.filter_args.bucket == Some(3) && args.filter_args.total);

    // --interval is required, and up and down exclude each other.
    assert!(Cli::try_parse_from(["sonalyze", "uptime"]).is_err());
    assert!(Cli::try_parse_from(["sonalyze", "uptime", "--interval", "5"]).is_ok());
    assert!(Cli::try_parse_from([
        "sonalyze",
        "uptime",
        "--interval",
        "5",
        "--only-up",
        "--only-down"
    ])
    .is_err());
}

#[test]
fn test_window() {
    let args = SourceArgs {
        data_path: None,
        cluster: None,
        from: Some(timestamp_from_ymd(2024, 3, 2)),
        to: Some(timestamp_from_ymd(2024, 3, 1)),
        logfiles: vec![],
    };
    assert!(args.window().is_err());
    let e = usage(args.window().err().unwrap());
    assert!(e.downcast_ref::<UsageError>().is_some());
}

#[test]
fn test_record_filter_defaults() {
    let args = RecordFilterArgs {
        host: vec![],
        user: vec!["-".to_string()],
        exclude_user: vec![],
        command: vec![],
        exclude_command: vec!["vim".to_string()],
        job: vec![7],
    };
    let f = args.record_filter(
        timestamp_from_ymd(2024, 3, 1),
        timestamp_from_ymd(2024, 3, 2),
        HostGlobber::new(true),
        FilterDefaults {
            all_users: false,
            skip_system_users: true,
            skip_system_commands: true,
        },
    );
    assert!(f.users.is_empty());
    assert!(f.exclude_users.contains("root") && f.exclude_users.contains("zabbix"));
    assert!(f.exclude_commands.contains("vim") && f.exclude_commands.contains("_heartbeat_"));
    assert!(f.job_ids.contains(&7));

    let hosts = host_globber(&["c1-[1-2],login".to_string()]).unwrap();
    assert!(hosts.match_hostname("c1-2") && hosts.match_hostname("login"));
    assert!(!hosts.match_hostname("c1-3"));
}
