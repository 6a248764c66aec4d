// Misc utilities useful to both sonardb and sonalyze.

mod configs;
mod csv;
mod dates;
mod gpuset;
mod hostglob;
mod pattern;

// A structure representing the configuration of one node, and of a whole cluster.

pub use configs::ClusterConfig;
pub use configs::NodeConfig;

// Read a cluster configuration from a file or a string.

pub use configs::parse_cluster_config;
pub use configs::read_cluster_config;

// Decode node attributes from a JSON object (shared with the sysinfo format).

pub use configs::decode_node_config;

// Fast, non-allocating, flexible CSV tokenizer.

pub use csv::Token as CsvToken;
pub use csv::Tokenizer as CsvTokenizer;
pub use csv::EQ_SENTINEL as CSV_EQ_SENTINEL;

// Types and utilities for manipulating timestamps.

pub use dates::Timestamp;

// "A long long time ago".

pub use dates::epoch;

// The time right now, to the second.

pub use dates::now;

// A time that should not be in any sample record.

pub use dates::far_future;

// Parse an RFC 3339 &str into a Timestamp.

pub use dates::parse_timestamp;

// Seconds since the epoch.

pub use dates::timestamp_from_seconds;
pub use dates::timestamp_to_seconds;

// Given year, month, day, hour, minute, second (all UTC), return a Timestamp.

pub use dates::timestamp_from_ymdhms;

// Given year, month, day (all UTC), return a Timestamp.

pub use dates::timestamp_from_ymd;

// Return the timestamp with various parts cleared out, or rounded up.

pub use dates::round_up_to_day;
pub use dates::truncate_to_day;
pub use dates::truncate_to_hour;
pub use dates::truncate_to_second;

// Add various quantities to the timestamp

pub use dates::add_day;
pub use dates::add_hour;

// The UTC days covered by a time range, as (y, m, d).

pub use dates::date_range;

// WwDdHhMm durations.

pub use dates::format_duration;
pub use dates::parse_duration;

// A GpuSet is None, Some(0), or Some(bits), representing unknown, empty, or non-empty.

pub use gpuset::GpuSet;
pub use gpuset::MAX_GPUS;

pub use gpuset::empty_gpuset;
pub use gpuset::is_empty_gpuset;
pub use gpuset::is_unknown_gpuset;
pub use gpuset::unknown_gpuset;

// Create a GpuSet that is either None or Some({a}), depending on input.

pub use gpuset::singleton_gpuset;

// Union one GPU, or a set of GPUs, into a GpuSet (destructively).

pub use gpuset::adjoin_gpuset;
pub use gpuset::union_gpuset;

// Conversions to and from text, and to a list of indices.

pub use gpuset::gpuset_cards;
pub use gpuset::gpuset_from_list;
pub use gpuset::gpuset_to_string;
pub use gpuset::gpuset_to_string_with;

// Structure representing a host name filter: basically a restricted automaton matching host names
// in useful ways.

pub use hostglob::HostGlobber;

// Host name patterns: split multi-patterns, expand patterns, compress name sets into patterns.

pub use hostglob::compress_hostnames;
pub use hostglob::expand_multi_pattern;
pub use hostglob::expand_pattern;
pub use hostglob::split_multi_pattern;
