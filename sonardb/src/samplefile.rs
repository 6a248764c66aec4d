/// Decoder and encoder for the sample file format: one record per line, each record a
/// comma-separated list of `tag=value` fields.
///
/// NOTE:
///
/// - A corrupted record is dropped silently and counted.  Appending to a file is not atomic wrt
///   reading from it, so a reader will sometimes see a partly written last line.
///
/// - Unknown tags are ignored.  A repeated tag is ignored after its first occurrence.
///
/// - `v`, `time`, `host`, `user` and `cmd` are mandatory.  A record whose time is missing or
///   unparseable is counted as a bad timestamp in addition to being dropped.
use crate::error::StoreError;
use crate::intern::{intern, Sym};
use crate::sample::{GpuStatus, Sample};

use anyhow::{bail, Result};
use rustutils::{
    empty_gpuset, gpuset_from_list, gpuset_to_string_with, is_empty_gpuset, parse_timestamp,
    CsvToken, CsvTokenizer, GpuSet, Timestamp, CSV_EQ_SENTINEL,
};
use std::boxed::Box;
use std::fs::File;
use std::io;
use std::path::Path;
use std::str::FromStr;

/// Outcome of decoding a file or stream: how many records were dropped, and how many of those
/// had a missing or bad timestamp.

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DecodeStats {
    pub discarded: usize,
    pub bad_timestamps: usize,
}

pub fn parse_sample_file(path: &Path, entries: &mut Vec<Box<Sample>>) -> Result<DecodeStats> {
    parse_samples(File::open(path)?, entries)
}

/// Decode records from `reader` and append them to `entries` in the order encountered.  Returns
/// an error only for I/O errors.

pub fn parse_samples<R: io::Read>(reader: R, entries: &mut Vec<Box<Sample>>) -> Result<DecodeStats> {
    let mut tokenizer = CsvTokenizer::new(reader);
    let mut stats = DecodeStats::default();
    let mut end_of_input = false;

    'line_loop: while !end_of_input {
        let mut version: Option<Sym> = None;
        let mut timestamp: Option<Timestamp> = None;
        let mut hostname: Option<Sym> = None;
        let mut num_cores: Option<u32> = None;
        let mut memtotal_kib: Option<u64> = None;
        let mut user: Option<Sym> = None;
        let mut pid: Option<u32> = None;
        let mut ppid: Option<u32> = None;
        let mut job_id: Option<u32> = None;
        let mut command: Option<Sym> = None;
        let mut cpu_pct: Option<f32> = None;
        let mut cpu_kib: Option<u64> = None;
        let mut rssanon_kib: Option<u64> = None;
        let mut gpus: Option<GpuSet> = None;
        let mut gpu_pct: Option<f32> = None;
        let mut gpumem_pct: Option<f32> = None;
        let mut gpumem_kib: Option<u64> = None;
        let mut gpu_status: Option<GpuStatus> = None;
        let mut cputime_sec: Option<f64> = None;
        let mut rolledup: Option<u32> = None;
        let mut flags: Option<u32> = None;
        let mut any_fields = false;
        let mut time_failed = false;

        'field_loop: loop {
            let mut failed = false;
            let mut matched = false;
            match tokenizer.get() {
                Err(e) => {
                    if e.downcast_ref::<io::Error>().is_some() {
                        return Err(e);
                    }
                    stats.discarded += 1;
                    tokenizer.scan_eol()?;
                    continue 'line_loop;
                }
                Ok(CsvToken::EOL) => {
                    break 'field_loop;
                }
                Ok(CsvToken::EOF) => {
                    end_of_input = true;
                    break 'field_loop;
                }
                Ok(CsvToken::Field(start, lim, _)) if start == lim => {
                    // Empty field, eg from a trailing comma.
                }
                Ok(CsvToken::Field(_, _, CSV_EQ_SENTINEL)) => {
                    // Not a tagged field: the record is garbage.
                    any_fields = true;
                    failed = true;
                    matched = true;
                }
                Ok(CsvToken::Field(start, lim, eqloc)) => {
                    any_fields = true;
                    let field = tokenizer.get_str(eqloc, lim);

                    // The first two characters are present because eqloc >= start + 1 and the
                    // buffer always has a sentinel after the field.
                    match tokenizer.buf_at(start) {
                        b'c' => match tokenizer.buf_at(start + 1) {
                            b'm' => {
                                if tokenizer.match_tag(b"cmd", start, eqloc) && command.is_none() {
                                    command = Some(intern(field));
                                    matched = true;
                                }
                            }
                            b'o' => {
                                if tokenizer.match_tag(b"cores", start, eqloc)
                                    && num_cores.is_none()
                                {
                                    (num_cores, failed) = get_u32(field);
                                    matched = true;
                                }
                            }
                            b'p' => {
                                if tokenizer.match_tag(b"cpu%", start, eqloc) && cpu_pct.is_none() {
                                    (cpu_pct, failed) = get_f32(field);
                                    matched = true;
                                } else if tokenizer.match_tag(b"cpukib", start, eqloc)
                                    && cpu_kib.is_none()
                                {
                                    (cpu_kib, failed) = get_u64(field);
                                    matched = true;
                                } else if tokenizer.match_tag(b"cputime_sec", start, eqloc)
                                    && cputime_sec.is_none()
                                {
                                    (cputime_sec, failed) = get_f64(field);
                                    matched = true;
                                }
                            }
                            _ => {}
                        },
                        b'f' => {
                            if tokenizer.match_tag(b"flags", start, eqloc) && flags.is_none() {
                                (flags, failed) = get_u32(field);
                                matched = true;
                            }
                        }
                        b'g' => {
                            if tokenizer.match_tag(b"gpus", start, eqloc) && gpus.is_none() {
                                (gpus, failed) = gpuset_from_list(field);
                                matched = true;
                            } else if tokenizer.match_tag(b"gpu%", start, eqloc)
                                && gpu_pct.is_none()
                            {
                                (gpu_pct, failed) = get_f32(field);
                                matched = true;
                            } else if tokenizer.match_tag(b"gpumem%", start, eqloc)
                                && gpumem_pct.is_none()
                            {
                                (gpumem_pct, failed) = get_f32(field);
                                matched = true;
                            } else if tokenizer.match_tag(b"gpukib", start, eqloc)
                                && gpumem_kib.is_none()
                            {
                                (gpumem_kib, failed) = get_u64(field);
                                matched = true;
                            } else if tokenizer.match_tag(b"gpufail", start, eqloc)
                                && gpu_status.is_none()
                            {
                                let (val, f) = get_u32(field);
                                failed = f;
                                gpu_status = match val {
                                    Some(0) => Some(GpuStatus::Ok),
                                    _ => Some(GpuStatus::UnknownFailure),
                                };
                                matched = true;
                            }
                        }
                        b'h' => {
                            if tokenizer.match_tag(b"host", start, eqloc) && hostname.is_none() {
                                hostname = Some(intern(field));
                                matched = true;
                            }
                        }
                        b'j' => {
                            if tokenizer.match_tag(b"job", start, eqloc) && job_id.is_none() {
                                (job_id, failed) = get_u32(field);
                                matched = true;
                            }
                        }
                        b'm' => {
                            if (tokenizer.match_tag(b"memtotal", start, eqloc)
                                || tokenizer.match_tag(b"memtotalkib", start, eqloc))
                                && memtotal_kib.is_none()
                            {
                                (memtotal_kib, failed) = get_u64(field);
                                matched = true;
                            }
                        }
                        b'p' => {
                            if tokenizer.match_tag(b"pid", start, eqloc) && pid.is_none() {
                                (pid, failed) = get_u32(field);
                                matched = true;
                            } else if tokenizer.match_tag(b"ppid", start, eqloc) && ppid.is_none() {
                                (ppid, failed) = get_u32(field);
                                matched = true;
                            }
                        }
                        b'r' => match tokenizer.buf_at(start + 1) {
                            b's' => {
                                if tokenizer.match_tag(b"rssanonkib", start, eqloc)
                                    && rssanon_kib.is_none()
                                {
                                    (rssanon_kib, failed) = get_u64(field);
                                    matched = true;
                                }
                            }
                            b'o' => {
                                if tokenizer.match_tag(b"rolledup", start, eqloc)
                                    && rolledup.is_none()
                                {
                                    (rolledup, failed) = get_u32(field);
                                    matched = true;
                                }
                            }
                            _ => {}
                        },
                        b't' => {
                            if tokenizer.match_tag(b"time", start, eqloc) && timestamp.is_none() {
                                match parse_timestamp(field) {
                                    Ok(t) => timestamp = Some(t),
                                    Err(_) => {
                                        failed = true;
                                        time_failed = true;
                                    }
                                }
                                matched = true;
                            }
                        }
                        b'u' => {
                            if tokenizer.match_tag(b"user", start, eqloc) && user.is_none() {
                                user = Some(intern(field));
                                matched = true;
                            }
                        }
                        b'v' => {
                            if tokenizer.match_tag(b"v", start, eqloc) && version.is_none() {
                                version = Some(intern(field));
                                matched = true;
                            }
                        }
                        _ => {
                            // Unknown field, ignore it.
                        }
                    }
                }
            }
            // matched && failed means a known tag had a bad value: the record is garbage.
            if matched && failed {
                stats.discarded += 1;
                if time_failed {
                    stats.bad_timestamps += 1;
                }
                tokenizer.scan_eol()?;
                continue 'line_loop;
            }
        } // Field loop

        if !any_fields {
            // Blank line or end of input.
            continue 'line_loop;
        }

        if timestamp.is_none() {
            stats.discarded += 1;
            stats.bad_timestamps += 1;
            continue 'line_loop;
        }

        if version.is_none() || hostname.is_none() || user.is_none() || command.is_none() {
            stats.discarded += 1;
            continue 'line_loop;
        }

        let (Some(version), Some(timestamp), Some(hostname), Some(user), Some(command)) =
            (version, timestamp, hostname, user, command)
        else {
            continue 'line_loop;
        };

        entries.push(Box::new(Sample {
            version,
            timestamp,
            hostname,
            num_cores: num_cores.unwrap_or(0),
            memtotal_kib: memtotal_kib.unwrap_or(0),
            user,
            pid: pid.unwrap_or(0),
            ppid: ppid.unwrap_or(0),
            job_id: job_id.unwrap_or(0),
            command,
            cpu_pct: cpu_pct.unwrap_or(0.0),
            cpu_kib: cpu_kib.unwrap_or(0),
            rssanon_kib: rssanon_kib.unwrap_or(0),
            gpus: gpus.unwrap_or(empty_gpuset()),
            gpu_pct: gpu_pct.unwrap_or(0.0),
            gpumem_pct: gpumem_pct.unwrap_or(0.0),
            gpumem_kib: gpumem_kib.unwrap_or(0),
            gpu_status: gpu_status.unwrap_or(GpuStatus::Ok),
            cputime_sec: cputime_sec.unwrap_or(0.0),
            rolledup: rolledup.unwrap_or(0),
            flags: flags.unwrap_or(0),
            cpu_util_pct: 0.0,
        }));
    } // Line loop

    Ok(stats)
}

/// Decode exactly one record.  A missing or bad timestamp yields `StoreError::BadTimestamp`.

pub fn decode_sample(line: &str) -> Result<Box<Sample>> {
    let mut entries = vec![];
    let stats = parse_samples(line.as_bytes(), &mut entries)?;
    if stats.bad_timestamps > 0 {
        return Err(StoreError::BadTimestamp.into());
    }
    match (entries.pop(), entries.is_empty()) {
        (Some(s), true) if stats.discarded == 0 => Ok(s),
        _ => bail!("Not a single well-formed sample record"),
    }
}

/// Encode a record as one line (without the newline).  Zero and empty optional fields are
/// elided; the mandatory fields are always present.  The time is written in UTC.

pub fn encode_sample(s: &Sample) -> String {
    let mut fields = vec![
        format!("v={}", s.version),
        format!(
            "time={}",
            s.timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
        ),
        quote(format!("host={}", s.hostname)),
    ];
    if s.num_cores != 0 {
        fields.push(format!("cores={}", s.num_cores));
    }
    if s.memtotal_kib != 0 {
        fields.push(format!("memtotal={}", s.memtotal_kib));
    }
    fields.push(quote(format!("user={}", s.user)));
    if s.pid != 0 {
        fields.push(format!("pid={}", s.pid));
    }
    if s.ppid != 0 {
        fields.push(format!("ppid={}", s.ppid));
    }
    if s.job_id != 0 {
        fields.push(format!("job={}", s.job_id));
    }
    fields.push(quote(format!("cmd={}", s.command)));
    if s.cpu_pct != 0.0 {
        fields.push(format!("cpu%={}", s.cpu_pct));
    }
    if s.cpu_kib != 0 {
        fields.push(format!("cpukib={}", s.cpu_kib));
    }
    if s.rssanon_kib != 0 {
        fields.push(format!("rssanonkib={}", s.rssanon_kib));
    }
    if !is_empty_gpuset(&s.gpus) {
        fields.push(format!("gpus={}", gpuset_to_string_with(&s.gpus, ";")));
    }
    if s.gpu_pct != 0.0 {
        fields.push(format!("gpu%={}", s.gpu_pct));
    }
    if s.gpumem_pct != 0.0 {
        fields.push(format!("gpumem%={}", s.gpumem_pct));
    }
    if s.gpumem_kib != 0 {
        fields.push(format!("gpukib={}", s.gpumem_kib));
    }
    if s.gpu_status != GpuStatus::Ok {
        fields.push("gpufail=1".to_string());
    }
    if s.cputime_sec != 0.0 {
        fields.push(format!("cputime_sec={}", s.cputime_sec));
    }
    if s.rolledup != 0 {
        fields.push(format!("rolledup={}", s.rolledup));
    }
    if s.flags != 0 {
        fields.push(format!("flags={}", s.flags));
    }
    fields.join(",")
}

// Fields with commas or quotes get CSV quoting.  The tag goes inside the quotes.
fn quote(field: String) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field
    }
}

fn get_u32(s: &str) -> (Option<u32>, bool) {
    match u32::from_str(s) {
        Ok(n) => (Some(n), false),
        Err(_) => (None, true),
    }
}

fn get_u64(s: &str) -> (Option<u64>, bool) {
    match u64::from_str(s) {
        Ok(n) => (Some(n), false),
        Err(_) => (None, true),
    }
}

fn get_f64(s: &str) -> (Option<f64>, bool) {
    match f64::from_str(s) {
        Ok(n) if n.is_finite() => (Some(n), false),
        _ => (None, true),
    }
}

fn get_f32(s: &str) -> (Option<f32>, bool) {
    match f32::from_str(s) {
        Ok(n) if n.is_finite() => (Some(n), false),
        _ => (None, true),
    }
}

#[cfg(test)]
use rustutils::{singleton_gpuset, timestamp_from_ymdhms, unknown_gpuset};

#[test]
fn test_parse_samples() {
    let text = "\
v=0.11.1,time=2023-06-05T10:00:00+02:00,host=ml4.hpc.uio.no,cores=64,memtotal=263419104,user=larsbent,pid=1090,ppid=1,job=2712710,cmd=python,cpu%=1473.7,cpukib=2360312,rssanonkib=12345,gpus=0;2,gpu%=33.5,gpumem%=12,gpukib=1000,cputime_sec=300,rolledup=2,flags=1,newfield=17
v=0.11.1,time=2023-06-05T10:05:00+02:00,host=ml4.hpc.uio.no,user=root,cmd=zabbix_agentd,gpus=unknown,gpufail=1

v=0.11.1,time=2023-06-05T10:05:00+02:00,host=ml4.hpc.uio.no,user=root,\"cmd=a,b\"
";
    let mut entries = vec![];
    let stats = parse_samples(text.as_bytes(), &mut entries).unwrap();
    assert_eq!(stats, DecodeStats::default());
    assert_eq!(entries.len(), 3);

    let e = &entries[0];
    assert!(e.version == "0.11.1");
    assert!(e.timestamp == timestamp_from_ymdhms(2023, 6, 5, 8, 0, 0));
    assert!(e.hostname == "ml4.hpc.uio.no");
    assert!(e.num_cores == 64);
    assert!(e.memtotal_kib == 263419104);
    assert!(e.pid == 1090 && e.ppid == 1 && e.job_id == 2712710);
    assert!(e.cpu_pct == 1473.7);
    assert!(e.cpu_kib == 2360312);
    assert!(e.rssanon_kib == 12345);
    let mut g = singleton_gpuset(Some(0));
    rustutils::adjoin_gpuset(&mut g, 2);
    assert!(e.gpus == g);
    assert!(e.gpu_pct == 33.5 && e.gpumem_pct == 12.0 && e.gpumem_kib == 1000);
    assert!(e.cputime_sec == 300.0 && e.rolledup == 2 && e.flags == 1);
    assert!(e.gpu_status == GpuStatus::Ok);

    let e = &entries[1];
    assert!(e.gpus == unknown_gpuset());
    assert!(e.gpu_status == GpuStatus::UnknownFailure);
    assert!(e.pid == 0 && e.job_id == 0 && e.cpu_pct == 0.0);

    assert!(entries[2].command == "a,b");
}

#[test]
fn test_parse_samples_drops_bad_records() {
    let text = "\
v=0.11.1,time=2023-06-05T10:00:00+02:00,host=a,user=u,cmd=c,pid=x
v=0.11.1,time=yesterday,host=a,user=u,cmd=c
v=0.11.1,host=a,user=u,cmd=c
v=0.11.1,time=2023-06-05T10:00:00+02:00,user=u,cmd=c
v=0.11.1,time=2023-06-05T10:00:00+02:00,host=a,user=u,cmd=\"c
untagged,fields
v=0.11.1,time=2023-06-05T10:00:00+02:00,host=a,user=u,cmd=ok
v=0.11.1,time=2023-06-05T10:00:00+02:00,host=a,user=u,cmd=partial,cpu%=1";
    let mut entries = vec![];
    let stats = parse_samples(text.as_bytes(), &mut entries).unwrap();
    assert_eq!(stats.discarded, 6);
    assert_eq!(stats.bad_timestamps, 2);
    assert_eq!(entries.len(), 2);
    assert!(entries[0].command == "ok");
    assert!(entries[1].command == "partial");
}

#[test]
fn test_decode_sample() {
    assert!(decode_sample("v=1.0.0,time=2023-06-05T10:00:00Z,host=a,user=u,cmd=c").is_ok());
    let e = decode_sample("v=1.0.0,time=bad,host=a,user=u,cmd=c").err().unwrap();
    assert!(crate::error::is_store_error(&e, StoreError::BadTimestamp));
    let e = decode_sample("v=1.0.0,host=a,user=u,cmd=c").err().unwrap();
    assert!(crate::error::is_store_error(&e, StoreError::BadTimestamp));
    let e = decode_sample("v=1.0.0,time=2023-06-05T10:00:00Z,user=u,cmd=c").err().unwrap();
    assert!(!crate::error::is_store_error(&e, StoreError::BadTimestamp));
    assert!(decode_sample("").is_err());
}

#[test]
fn test_encode_decode_sample() {
    let text = "v=0.11.1,time=2023-06-05T10:00:00+02:00,host=ml4,cores=64,memtotal=100,user=u,pid=7,ppid=3,job=9,\"cmd=python x,y\",cpu%=12.25,cpukib=2000,rssanonkib=1500,gpus=1;3,gpu%=0.5,gpumem%=2.5,gpukib=77,gpufail=1,cputime_sec=1234.5,rolledup=4,flags=2";
    let s = decode_sample(text).unwrap();
    let encoded = encode_sample(&s);
    let t = decode_sample(&encoded).unwrap();
    assert!(*s == *t);

    // Elision of zero fields
    let s = decode_sample("v=1,time=2023-06-05T10:00:00Z,host=a,user=u,cmd=c,cpu%=0,gpus=none").unwrap();
    assert_eq!(
        encode_sample(&s),
        "v=1,time=2023-06-05T10:00:00+00:00,host=a,user=u,cmd=c"
    );
}

#[test]
fn test_decode_large_card_index() {
    let s = decode_sample("v=1,time=2023-06-05T10:00:00Z,host=a,user=u,cmd=c,pid=3,gpus=1;70").unwrap();
    assert!(s.pid == 3);
    assert!(rustutils::is_unknown_gpuset(&s.gpus));
    let s = decode_sample("v=1,time=2023-06-05T10:00:00Z,host=a,user=u,cmd=c,gpus=33").unwrap();
    assert!(rustutils::gpuset_cards(&s.gpus) == vec![33]);
}
