/// A telemetry store for HPC clusters, and the machinery to turn what it holds into per-job and
/// per-host views.
///
/// The store holds three kinds of records, all written by collectors running on the nodes: process
/// *samples*, node *sysinfo* (hardware inventory) and scheduler *accounting* records from slurm's
/// sacct.  Records are appended to a directory tree partitioned by cluster and UTC day, with one
/// file per host and kind per day.  A file's name and location say where its records came from, but
/// that is used only to pick the files to read for a query; once read, records are processed
/// without knowledge of their origin and may be in any order and contain duplicates.
///
/// Samples form *sample streams*.  A stream is identified by (hostname, stream-id, command), where
/// the stream-id is the job id if nonzero and otherwise the pid.  The fundamental task of the
/// library is to reconstruct the set of streams from the raw records and to provide the operations
/// the views need on that set:
///
/// - Find the files within a time window and read them in parallel, deduplicating records on their
///   natural key.
///
/// - Postprocess: deduct CPU time that processes inherited from children in other jobs, bucket
///   samples by stream, derive per-interval CPU utilization, and tidy up GPU memory data using the
///   cluster configuration.
///
/// - Merge streams by host and job, by job across hosts, or by host across jobs, and aggregate
///   merged jobs into summaries.
///
/// - Join accounting records into jobs, and filter them.
///
/// - Select, compile and apply record filters and query predicates over typed fields.
mod aggregate;
mod appender;
mod cluster;
mod cputime;
mod error;
mod intern;
mod logtree;
mod postprocess;
mod query;
mod reader;
mod sacct;
mod sample;
mod samplefile;
mod slurm;
mod synthesize;
mod sysinfo;

// Process-wide table of interned strings.  A `Sym` compares by id and orders by text.

pub use intern::intern;
pub use intern::lookup;
pub use intern::Interner;
pub use intern::Sym;

// Named error conditions, carried in anyhow::Error.

pub use error::is_store_error;
pub use error::StoreError;

// The sample record, and the GPU status value it carries.

pub use sample::empty_sample;
pub use sample::gib_to_kib;
pub use sample::merge_gpu_status;
pub use sample::GpuStatus;
pub use sample::Sample;

// Codecs for the three record kinds.  The parsers push decoded records onto a vector and return
// counts of what was read and dropped.

pub use samplefile::decode_sample;
pub use samplefile::encode_sample;
pub use samplefile::parse_sample_file;
pub use samplefile::parse_samples;
pub use samplefile::DecodeStats;

pub use sysinfo::decode_sysinfo;
pub use sysinfo::encode_sysinfo;
pub use sysinfo::parse_sysinfo;
pub use sysinfo::parse_sysinfo_file;
pub use sysinfo::GpuCard;
pub use sysinfo::SysinfoRecord;

pub use sacct::parse_alloc_tres;
pub use sacct::parse_sacct;
pub use sacct::parse_sacct_file;
pub use sacct::parse_slurm_bytes;
pub use sacct::parse_slurm_elapsed;
pub use sacct::SacctRecord;

// Layout of the directory tree: day directories and the files within them.

pub use logtree::data_file;
pub use logtree::day_dir;
pub use logtree::find_files;
pub use logtree::FileKind;

// The append coordinator owning the writable files of one cluster directory.

pub use appender::Appender;
pub use appender::MAX_RECORD_BYTES;

// Parallel reading of a set of files, and deduplication of the result.

pub use reader::dedup_by_key;
pub use reader::dedup_sacct;
pub use reader::dedup_samples;
pub use reader::dedup_sysinfo;
pub use reader::default_workers;
pub use reader::read_files;
pub use reader::CancelToken;
pub use reader::ReadOptions;
pub use reader::ReadResult;

// A cluster store, read-only over a list of files or persistent over a directory, and its
// lifecycle.

pub use cluster::ClusterStore;
pub use cluster::OpenMode;
pub use cluster::StoreOptions;
pub use cluster::StoreState;

// Deduct from a process the CPU time of children that ran in another job.

pub use cputime::deduct_foreign_children;

// Postprocess a vector of samples into a set of streams, keyed by (hostname, stream-id, command),
// and compute the per-host time bounds of the input.

pub use postprocess::compute_timebounds;
pub use postprocess::postprocess_samples;
pub use postprocess::InputStreamKey;
pub use postprocess::InputStreamSet;
pub use postprocess::Timebound;
pub use postprocess::Timebounds;

// Merge streams into jobs or per-host streams, and bucket samples in time.

pub use synthesize::fold_samples_daily;
pub use synthesize::fold_samples_hourly;
pub use synthesize::merge_across_hosts;
pub use synthesize::merge_by_host;
pub use synthesize::merge_jobs;
pub use synthesize::MergeMode;
pub use synthesize::MergedStream;
pub use synthesize::MERGED;

// Summaries of merged jobs, and filtering on them.

pub use aggregate::aggregate_and_filter;
pub use aggregate::aggregate_job;
pub use aggregate::JobFilter;
pub use aggregate::JobSummary;
pub use aggregate::Metric;
pub use aggregate::Threshold;
pub use aggregate::LIVE_AT_END;
pub use aggregate::LIVE_AT_START;

// Scheduler jobs joined from accounting records.

pub use slurm::group_jobs;
pub use slurm::select_jobs;
pub use slurm::SlurmFilter;
pub use slurm::SlurmJob;
pub use slurm::SlurmJobKind;

// Record filters, and the typed-field layer for predicates, projection and sorting.

pub use query::compare_values;
pub use query::compile_query;
pub use query::convert_literal;
pub use query::find_field;
pub use query::parse_query;
pub use query::parse_sort_keys;
pub use query::parse_time_literal;
pub use query::select_fields;
pub use query::sort_rows;
pub use query::Expr;
pub use query::Field;
pub use query::FieldKind;
pub use query::Predicate;
pub use query::Projection;
pub use query::RecordFilter;
pub use query::RelOp;
pub use query::SampleFilter;
pub use query::SortKey;
pub use query::Value;
pub use query::CONTROL_WORDS;
