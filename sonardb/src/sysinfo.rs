/// Decoder and encoder for sysinfo (node inventory) data: one JSON object per line.
///
/// The node attributes have the same names and meaning as in the cluster configuration, and are
/// decoded by the same code.  In addition there is a `timestamp`, which is mandatory, and an
/// optional array of per-card descriptors under `cards` (older data call it `gpu_info`).
use crate::error::StoreError;
use crate::intern::{intern, Sym};
use crate::samplefile::DecodeStats;

use anyhow::{bail, Result};
use rustutils::{decode_node_config, parse_timestamp, NodeConfig, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Static description of one GPU card.  Quantities not reported by the collector are zero.

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuCard {
    pub index: u32,
    pub uuid: String,
    pub model: String,
    pub manufacturer: String,
    /// KiB
    #[serde(alias = "mem_size_kib")]
    pub memory: u64,
    /// Watts
    #[serde(alias = "power_limit_watt")]
    pub power_limit: u32,
    #[serde(alias = "max_power_limit_watt")]
    pub max_power_limit: u32,
    #[serde(alias = "min_power_limit_watt")]
    pub min_power_limit: u32,
    /// MHz
    #[serde(alias = "max_ce_clock_mhz")]
    pub max_ce_clock: u32,
    #[serde(alias = "max_mem_clock_mhz")]
    pub max_memory_clock: u32,
    pub driver: String,
    pub firmware: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SysinfoRecord {
    pub timestamp: Timestamp,
    pub hostname: Sym,
    pub node: NodeConfig,
    pub cards: Vec<GpuCard>,
}

pub fn parse_sysinfo_file(path: &Path, entries: &mut Vec<Box<SysinfoRecord>>) -> Result<DecodeStats> {
    parse_sysinfo(BufReader::new(File::open(path)?), entries)
}

/// Decode records from `reader`, one per line, appending them to `entries`.  Blank lines are
/// skipped, undecodable lines are counted and skipped.  Only I/O errors are returned as errors.

pub fn parse_sysinfo<R: BufRead>(
    reader: R,
    entries: &mut Vec<Box<SysinfoRecord>>,
) -> Result<DecodeStats> {
    let mut stats = DecodeStats::default();
    for line in reader.split(b'\n') {
        let line = line?;
        let Ok(text) = std::str::from_utf8(&line) else {
            stats.discarded += 1;
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        match decode_sysinfo(text) {
            Ok(r) => entries.push(r),
            Err(e) => {
                stats.discarded += 1;
                if crate::error::is_store_error(&e, StoreError::BadTimestamp) {
                    stats.bad_timestamps += 1;
                }
            }
        }
    }
    Ok(stats)
}

/// Decode one record.  A missing or unparseable timestamp is `StoreError::BadTimestamp`.

pub fn decode_sysinfo(text: &str) -> Result<Box<SysinfoRecord>> {
    let v: Value = serde_json::from_str(text)?;
    let Value::Object(fields) = v else {
        bail!("Sysinfo record must be an object")
    };
    let timestamp = match fields.get("timestamp") {
        Some(Value::String(s)) => match parse_timestamp(s) {
            Ok(t) => t,
            Err(_) => return Err(StoreError::BadTimestamp.into()),
        },
        _ => return Err(StoreError::BadTimestamp.into()),
    };
    let mut node = decode_node_config(&fields)?;
    node.timestamp = timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, false);
    let cards = match fields.get("cards").or_else(|| fields.get("gpu_info")) {
        Some(v @ Value::Array(_)) => Vec::<GpuCard>::deserialize(v)?,
        Some(Value::Null) | None => vec![],
        Some(_) => bail!("Field 'cards' must be an array"),
    };
    Ok(Box::new(SysinfoRecord {
        timestamp,
        hostname: intern(&node.hostname),
        node,
        cards,
    }))
}

/// Encode a record as a single line of JSON (without the newline).  Zero-valued optional
/// attributes are elided.

pub fn encode_sysinfo(r: &SysinfoRecord) -> String {
    let n = &r.node;
    let mut obj = json!({
        "timestamp": r.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
        "hostname": r.hostname.as_str(),
        "cpu_cores": n.cpu_cores,
        "mem_gb": n.mem_gb,
    });
    if let Value::Object(m) = &mut obj {
        if !n.description.is_empty() {
            m.insert("description".to_string(), json!(n.description));
        }
        if n.cross_node_jobs {
            m.insert("cross_node_jobs".to_string(), json!(true));
        }
        if n.gpu_cards != 0 {
            m.insert("gpu_cards".to_string(), json!(n.gpu_cards));
            if n.gpumem_gb != 0 {
                m.insert("gpumem_gb".to_string(), json!(n.gpumem_gb));
            }
            if n.gpumem_pct {
                m.insert("gpumem_pct".to_string(), json!(true));
            }
        }
        if !n.metadata.is_empty() {
            let md = n
                .metadata
                .iter()
                .map(|(k, v)| json!({"k": k, "v": v}))
                .collect::<Vec<Value>>();
            m.insert("metadata".to_string(), Value::Array(md));
        }
        if !r.cards.is_empty() {
            m.insert("cards".to_string(), json!(r.cards));
        }
    }
    obj.to_string()
}

#[cfg(test)]
use rustutils::timestamp_from_ymdhms;

#[test]
fn test_parse_sysinfo() {
    let text = r#"{"timestamp":"2024-10-31T10:00:01+01:00","hostname":"ml6.hpc.uio.no","description":"2x14 Intel, 256 GiB, 8x RTX 2080 Ti","cpu_cores":56,"mem_gb":256,"gpu_cards":8,"gpumem_gb":88,"gpu_info":[{"index":0,"uuid":"GPU-1","model":"RTX 2080 Ti","manufacturer":"NVIDIA","mem_size_kib":11534336,"power_limit_watt":250,"max_ce_clock_mhz":2100}]}

{"hostname":"ml7.hpc.uio.no","cpu_cores":56,"mem_gb":256}
{"timestamp":"2024-10-31T10:00:01+01:00","hostname":"ml7.hpc.uio.no","cpu_cores":56,"mem_gb":256,"gpumem_gb":10}
{"timestamp":"2024-10-31T10:00:01+01:00","hostname":"ml8.hpc.uio.no","cpu_cores":192,"mem_gb":1024,"gpu_cards":4,"gpumem_pct":true,
{"timestamp":"2024-10-31T10:00:01+01:00","hostname":"ml8.hpc.uio.no","cpu_cores":192,"mem_gb":1024,"gpu_cards":4,"gpumem_pct":true,"cross_node_jobs":true}
"#;
    let mut entries = vec![];
    let stats = parse_sysinfo(text.as_bytes(), &mut entries).unwrap();
    assert_eq!(stats.discarded, 3);
    assert_eq!(stats.bad_timestamps, 1);
    assert_eq!(entries.len(), 2);

    let r = &entries[0];
    assert!(r.timestamp == timestamp_from_ymdhms(2024, 10, 31, 9, 0, 1));
    assert!(r.hostname == "ml6.hpc.uio.no");
    assert!(r.node.cpu_cores == 56 && r.node.mem_gb == 256 && r.node.gpu_cards == 8);
    assert!(r.cards.len() == 1);
    assert!(r.cards[0].memory == 11534336);
    assert!(r.cards[0].power_limit == 250);
    assert!(r.cards[0].max_ce_clock == 2100);
    assert!(r.cards[0].model == "RTX 2080 Ti");

    let r = &entries[1];
    assert!(r.node.gpumem_pct && r.node.cross_node_jobs);
    assert!(r.cards.is_empty());
}

#[test]
fn test_encode_decode_sysinfo() {
    let text = r#"{"timestamp":"2024-10-31T10:00:01Z","hostname":"ml6","description":"big","cpu_cores":56,"mem_gb":256,"gpu_cards":2,"gpumem_gb":22,"metadata":[{"k":"rack","v":"3"}],"cards":[{"index":1,"uuid":"u","memory":5}]}"#;
    let r = decode_sysinfo(text).unwrap();
    let s = encode_sysinfo(&r);
    let q = decode_sysinfo(&s).unwrap();
    assert!(*r == *q);
    assert!(q.node.metadata == vec![("rack".to_string(), "3".to_string())]);

    let e = decode_sysinfo(r#"{"timestamp":"now","hostname":"a","cpu_cores":1,"mem_gb":1}"#)
        .err()
        .unwrap();
    assert!(crate::error::is_store_error(&e, StoreError::BadTimestamp));
}
