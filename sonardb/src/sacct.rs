/// Decoder for scheduler accounting (sacct) data.  The file format is the same `tag=value` CSV
/// dialect as for samples, with the tags named as the upstream accounting tool names its fields.
///
/// Durations use the slurm elapsed syntax `[D-][HH:]MM:SS[.frac]` and are stored as seconds.
/// Memory and I/O quantities use the slurm byte syntax `N[KMG]` and are stored as GiB, rounded up.
/// Time stamps are RFC 3339; the value `Unknown` means "not set".
///
/// A record with a bad value for a known field is dropped.  Unknown and untagged fields are
/// ignored.  `v`, `End` and a nonzero job id are mandatory.
use crate::intern::{intern, Sym};
use crate::samplefile::DecodeStats;

use anyhow::{bail, Result};
use rustutils::{parse_timestamp, CsvToken, CsvTokenizer, Timestamp, CSV_EQ_SENTINEL};
use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SacctRecord {
    pub version: Sym,

    /// The numeric job id, from JobIDRaw.
    pub job_id: u32,

    /// Step name, empty for the main record: "batch", "extern", "0", ...
    pub job_step: Sym,

    /// Set if JobID has the form `<array-job>_<index>[.step]`.
    pub array_job_id: u32,
    pub array_index: u32,
    pub array_step: Sym,

    /// Set if JobID has the form `<het-job>+<offset>[.step]`.
    pub het_job_id: u32,
    pub het_offset: u32,
    pub het_step: Sym,

    pub user: Sym,
    pub account: Sym,
    pub partition: Sym,
    pub reservation: Sym,

    /// First word of the state only.
    pub state: Sym,

    pub submit: Option<Timestamp>,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,

    /// Seconds.
    pub elapsed_raw: u32,
    pub timelimit_raw: u32,
    pub suspended: u32,
    pub system_cpu: u64,
    pub user_cpu: u64,
    pub ave_cpu: u64,
    pub min_cpu: u64,

    /// GiB, rounded up.
    pub ave_rss: u32,
    pub max_rss: u32,
    pub ave_vmsize: u32,
    pub max_vmsize: u32,
    pub req_mem: u32,
    pub ave_disk_read: u32,
    pub ave_disk_write: u32,

    pub req_cpus: u32,
    pub req_nodes: u32,
    pub node_list: Sym,
    pub job_name: Sym,
    pub layout: Sym,
    pub exit_code: u8,
    pub exit_signal: u8,

    /// The GPU part of AllocTRES as a comma-separated list of `model=n`, `*` for "any model".
    pub req_gpus: Sym,
}

pub fn parse_sacct_file(path: &Path, entries: &mut Vec<Box<SacctRecord>>) -> Result<DecodeStats> {
    parse_sacct(File::open(path)?, entries)
}

pub fn parse_sacct<R: io::Read>(reader: R, entries: &mut Vec<Box<SacctRecord>>) -> Result<DecodeStats> {
    let mut tokenizer = CsvTokenizer::new(reader);
    let mut stats = DecodeStats::default();
    let mut end_of_input = false;

    'line_loop: while !end_of_input {
        let mut r = SacctRecord::default();
        let mut any_fields = false;
        let mut have_end = false;
        let mut fallback_job_id = 0;

        'field_loop: loop {
            let mut matched = false;
            let mut result: Result<()> = Ok(());
            match tokenizer.get() {
                Err(e) => {
                    if e.downcast_ref::<io::Error>().is_some() {
                        return Err(e);
                    }
                    stats.discarded += 1;
                    tokenizer.scan_eol()?;
                    continue 'line_loop;
                }
                Ok(CsvToken::EOL) => break 'field_loop,
                Ok(CsvToken::EOF) => {
                    end_of_input = true;
                    break 'field_loop;
                }
                Ok(CsvToken::Field(start, lim, _)) if start == lim => {}
                Ok(CsvToken::Field(_, _, CSV_EQ_SENTINEL)) => {
                    // Bad form: drop the field, keep the record.
                    any_fields = true;
                }
                Ok(CsvToken::Field(start, lim, eqloc)) => {
                    any_fields = true;
                    let val = tokenizer.get_str(eqloc, lim);
                    let tag = tokenizer.get_str(start, eqloc - 1);
                    matched = true;
                    match tag {
                        "v" => r.version = intern(val),
                        "Account" => r.account = intern(val),
                        "AllocTRES" => r.req_gpus = intern(&parse_alloc_tres(val)),
                        "AveCPU" => result = parse_slurm_elapsed(val).map(|v| r.ave_cpu = v),
                        "AveDiskRead" => {
                            result = parse_slurm_bytes(val).map(|v| r.ave_disk_read = v)
                        }
                        "AveDiskWrite" => {
                            result = parse_slurm_bytes(val).map(|v| r.ave_disk_write = v)
                        }
                        "AveRSS" => result = parse_slurm_bytes(val).map(|v| r.ave_rss = v),
                        "AveVMSize" => result = parse_slurm_bytes(val).map(|v| r.ave_vmsize = v),
                        "ElapsedRaw" => result = parse_u32(val).map(|v| r.elapsed_raw = v),
                        "End" => {
                            have_end = true;
                            result = parse_slurm_time(val).map(|v| r.end = v);
                        }
                        "ExitCode" => {
                            result = match val.split_once(':') {
                                Some((c, s)) => parse_u8(c).and_then(|c| {
                                    r.exit_code = c;
                                    parse_u8(s).map(|s| r.exit_signal = s)
                                }),
                                None => parse_u8(val).map(|c| r.exit_code = c),
                            }
                        }
                        "JobID" => result = parse_job_id(val, &mut r, &mut fallback_job_id),
                        "JobIDRaw" => {
                            result = match val.split_once('.') {
                                Some((id, step)) => parse_u32(id).map(|id| {
                                    r.job_id = id;
                                    r.job_step = intern(step);
                                }),
                                None => parse_u32(val).map(|id| r.job_id = id),
                            }
                        }
                        "JobName" => r.job_name = intern(val),
                        "Layout" => r.layout = intern(val),
                        "MaxRSS" => result = parse_slurm_bytes(val).map(|v| r.max_rss = v),
                        "MaxVMSize" => result = parse_slurm_bytes(val).map(|v| r.max_vmsize = v),
                        "MinCPU" => result = parse_slurm_elapsed(val).map(|v| r.min_cpu = v),
                        "NodeList" => r.node_list = intern(val),
                        "Partition" => r.partition = intern(val),
                        "ReqCPUS" => result = parse_u32(val).map(|v| r.req_cpus = v),
                        "ReqMem" => result = parse_slurm_bytes(val).map(|v| r.req_mem = v),
                        "ReqNodes" => result = parse_u32(val).map(|v| r.req_nodes = v),
                        "Reservation" => r.reservation = intern(val),
                        "Start" => result = parse_slurm_time(val).map(|v| r.start = v),
                        "State" => {
                            r.state = intern(val.split(' ').next().unwrap_or(""));
                        }
                        "Submit" => result = parse_slurm_time(val).map(|v| r.submit = v),
                        "Suspended" => {
                            result = parse_slurm_elapsed(val).and_then(|v| match u32::try_from(v) {
                                Ok(v) => {
                                    r.suspended = v;
                                    Ok(())
                                }
                                Err(_) => bail!("Suspended time out of range"),
                            })
                        }
                        "SystemCPU" => result = parse_slurm_elapsed(val).map(|v| r.system_cpu = v),
                        "TimelimitRaw" => {
                            // Minutes on the wire.
                            result = parse_u32(val).map(|v| r.timelimit_raw = v.saturating_mul(60))
                        }
                        "User" => r.user = intern(val),
                        "UserCPU" => result = parse_slurm_elapsed(val).map(|v| r.user_cpu = v),
                        _ => matched = false,
                    }
                }
            }
            if matched && result.is_err() {
                stats.discarded += 1;
                tokenizer.scan_eol()?;
                continue 'line_loop;
            }
        } // Field loop

        if !any_fields {
            continue 'line_loop;
        }

        if r.job_id == 0 {
            r.job_id = fallback_job_id;
        }
        if r.version.is_empty() || !have_end || r.job_id == 0 {
            stats.discarded += 1;
            continue 'line_loop;
        }

        entries.push(Box::new(r));
    } // Line loop

    Ok(stats)
}

// JobID holds the array or het structure.  The plain numeric id is normally taken from JobIDRaw;
// JobID provides it only when JobIDRaw is absent.
fn parse_job_id(val: &str, r: &mut SacctRecord, fallback: &mut u32) -> Result<()> {
    let (id, step) = match val.split_once('.') {
        Some((id, step)) => (id, intern(step)),
        None => (val, Sym::empty()),
    };
    if let Some(ix) = id.find(|c: char| c == '_' || c == '+') {
        let job = parse_u32(&id[..ix])?;
        let n = parse_u32(&id[ix + 1..])?;
        if id.as_bytes()[ix] == b'_' {
            r.array_job_id = job;
            r.array_index = n;
            r.array_step = step;
        } else {
            r.het_job_id = job;
            r.het_offset = n;
            r.het_step = step;
        }
    } else {
        *fallback = parse_u32(id)?;
        if r.job_step.is_empty() {
            r.job_step = step;
        }
    }
    Ok(())
}

fn parse_u32(s: &str) -> Result<u32> {
    Ok(s.parse::<u32>()?)
}

fn parse_u8(s: &str) -> Result<u8> {
    Ok(s.parse::<u8>()?)
}

fn parse_slurm_time(s: &str) -> Result<Option<Timestamp>> {
    if s == "Unknown" || s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parse_timestamp(s)?))
    }
}

/// Parse `[D-][HH:]MM:SS[.frac]` into seconds.  The fraction is ignored.

pub fn parse_slurm_elapsed(s: &str) -> Result<u64> {
    let (days, rest) = match s.split_once('-') {
        Some((d, rest)) => (parse_digits(d)?, rest),
        None => (0, s),
    };
    let rest = match rest.split_once('.') {
        Some((r, frac)) => {
            parse_digits(frac)?;
            r
        }
        None => rest,
    };
    let parts = rest
        .split(':')
        .map(parse_digits)
        .collect::<Result<Vec<u64>>>()?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => bail!("Bad elapsed time format"),
    };
    Ok(((days * 24 + hours) * 60 + minutes) * 60 + seconds)
}

fn parse_digits(s: &str) -> Result<u64> {
    if s.is_empty() || !s.bytes().all(|c| c.is_ascii_digit()) {
        bail!("Bad elapsed time format")
    }
    Ok(s.parse::<u64>()?)
}

/// Parse `N[KMG]`, where N may be a float and the unit is bytes without a suffix, into GiB rounded
/// up.

pub fn parse_slurm_bytes(s: &str) -> Result<u32> {
    let (num, mpy) = match s.as_bytes().last() {
        Some(b'T') => (&s[..s.len() - 1], 1024.0 * 1024.0 * 1024.0 * 1024.0),
        Some(b'G') => (&s[..s.len() - 1], 1024.0 * 1024.0 * 1024.0),
        Some(b'M') => (&s[..s.len() - 1], 1024.0 * 1024.0),
        Some(b'K') => (&s[..s.len() - 1], 1024.0),
        Some(_) => (s, 1.0),
        None => bail!("Empty byte quantity"),
    };
    let n = num.parse::<f64>()?;
    if !n.is_finite() || n < 0.0 {
        bail!("Bad byte quantity")
    }
    Ok(((n * mpy) / (1024.0 * 1024.0 * 1024.0)).ceil() as u32)
}

/// Extract the GPU entries from AllocTRES: `gres/gpu=2` becomes `*=2`, `gres/gpu:a100=2` becomes
/// `a100=2`, everything else is dropped.

pub fn parse_alloc_tres(s: &str) -> String {
    s.split(',')
        .filter_map(|item| {
            let rest = item.strip_prefix("gres/gpu")?;
            if rest.starts_with('=') {
                Some(format!("*{rest}"))
            } else {
                rest.strip_prefix(':').map(|r| r.to_string())
            }
        })
        .collect::<Vec<String>>()
        .join(",")
}

#[cfg(test)]
use rustutils::timestamp_from_ymdhms;

#[test]
fn test_parse_sacct() {
    let text = "\
v=0.1.0,JobID=1234567,JobIDRaw=1234567,User=larsbent,Account=ec30,State=CANCELLED by 1234,Start=2024-11-04T10:00:00+01:00,End=2024-11-04T11:00:00+01:00,ElapsedRaw=3600,ReqCPUS=8,ReqMem=16G,\"AllocTRES=billing=8,cpu=8,gres/gpu:a100=2,gres/gpu=2,mem=16G\",NodeList=gpu-[1-2],TimelimitRaw=120,ExitCode=0:15,Priority=1
v=0.1.0,JobID=1234567.batch,JobIDRaw=1234567.batch,End=2024-11-04T11:00:00+01:00,AveCPU=1-02:03:04,MaxRSS=1536M,AveRSS=1024K,AveDiskRead=10
v=0.1.0,JobID=200_3.extern,JobIDRaw=205.extern,End=Unknown
v=0.1.0,JobID=300+1,JobIDRaw=301,End=2024-11-04T11:00:00Z
v=0.1.0,JobID=7,JobIDRaw=7,End=2024-11-04T11:00:00Z,ElapsedRaw=x
v=0.1.0,JobIDRaw=8
JobIDRaw=9,End=2024-11-04T11:00:00Z
v=0.1.0,JobID=10,End=2024-11-04T11:00:00Z,bogus
";
    let mut entries = vec![];
    let stats = parse_sacct(text.as_bytes(), &mut entries).unwrap();
    assert_eq!(stats.discarded, 3);
    assert_eq!(entries.len(), 5);

    let r = &entries[0];
    assert!(r.job_id == 1234567 && r.job_step.is_empty());
    assert!(r.user == "larsbent" && r.account == "ec30");
    assert!(r.state == "CANCELLED");
    assert!(r.start == Some(timestamp_from_ymdhms(2024, 11, 4, 9, 0, 0)));
    assert!(r.elapsed_raw == 3600 && r.req_cpus == 8 && r.req_mem == 16);
    assert!(r.req_gpus == "a100=2,*=2");
    assert!(r.node_list == "gpu-[1-2]");
    assert!(r.timelimit_raw == 7200);
    assert!(r.exit_code == 0 && r.exit_signal == 15);

    let r = &entries[1];
    assert!(r.job_step == "batch" && r.user.is_empty());
    assert!(r.ave_cpu == 26 * 3600 + 3 * 60 + 4);
    assert!(r.max_rss == 2 && r.ave_rss == 1 && r.ave_disk_read == 1);

    let r = &entries[2];
    assert!(r.job_id == 205 && r.job_step == "extern");
    assert!(r.array_job_id == 200 && r.array_index == 3 && r.array_step == "extern");
    assert!(r.end.is_none());

    let r = &entries[3];
    assert!(r.het_job_id == 300 && r.het_offset == 1 && r.job_id == 301);

    let r = &entries[4];
    assert!(r.job_id == 10);
}

#[test]
fn test_slurm_syntax() {
    assert!(parse_slurm_elapsed("05:10").unwrap() == 310);
    assert!(parse_slurm_elapsed("01:05:10").unwrap() == 3910);
    assert!(parse_slurm_elapsed("2-01:05:10.123").unwrap() == 2 * 86400 + 3910);
    assert!(parse_slurm_elapsed("10").is_err());
    assert!(parse_slurm_elapsed("1:2:3:4").is_err());
    assert!(parse_slurm_elapsed("a:10").is_err());
    assert!(parse_slurm_bytes("0").unwrap() == 0);
    assert!(parse_slurm_bytes("1").unwrap() == 1);
    assert!(parse_slurm_bytes("2.5G").unwrap() == 3);
    assert!(parse_slurm_bytes("1T").unwrap() == 1024);
    assert!(parse_slurm_bytes("").is_err());
    assert!(parse_slurm_bytes("xG").is_err());
    assert!(parse_alloc_tres("billing=20,cpu=20,mem=50G,node=1") == "");
    assert!(parse_alloc_tres("gres/gpu=1") == "*=1");
}
