/// Read the node configuration of a cluster from a JSON file.
///
/// Two file formats are accepted.
///
/// The array format is an array [...] of node objects.
///
/// The object format is an object { ... } with these fields:
///
///   name - string, the canonical name of the cluster
///   description - string, optional, arbitrary text describing the cluster
///   aliases - array of strings, optional, aliases / short names for the cluster
///   exclude-user - array of strings, optional, user names whose records are always excluded
///   nodes - array of node objects
///
/// A node object has these fields:
///
///   timestamp - string, optional, RFC3339 time for when the data were obtained
///   hostname - string, a host name or a host pattern without '*', which is expanded
///   description - string, optional
///   cross_node_jobs - bool, optional, jobs on this node can be merged with jobs on other nodes
///                     where the flag is also set, because job numbers come from a cluster-wide
///                     source (typically slurm)
///   cpu_cores - integer, the number of hyperthreads
///   mem_gb - integer, main memory in gigabytes
///   gpu_cards - integer, optional, the number of gpu cards
///   gpumem_gb - integer, optional, gpu memory in gigabytes across all cards
///   gpumem_pct - bool, optional, the GPU memory reading in percent is the reliable one
///   metadata - array of {"k": string, "v": string}, optional
///
/// Any field name starting with '#' is reserved for comments.  A host may be defined only once.
use crate::hostglob::expand_pattern;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NodeConfig {
    pub timestamp: String,
    pub hostname: String,
    pub description: String,
    pub cross_node_jobs: bool,
    pub cpu_cores: usize,
    pub mem_gb: usize,
    pub gpu_cards: usize,
    pub gpumem_gb: usize,
    pub gpumem_pct: bool,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct ClusterConfig {
    pub name: String,
    pub description: String,
    pub aliases: Vec<String>,
    pub exclude_user: Vec<String>,
    nodes: HashMap<String, Arc<NodeConfig>>,
}

impl ClusterConfig {
    /// A config with just the given nodes; later definitions replace earlier ones.
    pub fn from_nodes(name: &str, nodes: Vec<NodeConfig>) -> ClusterConfig {
        let mut cfg = ClusterConfig {
            name: name.to_string(),
            ..Default::default()
        };
        for n in nodes {
            cfg.nodes.insert(n.hostname.clone(), Arc::new(n));
        }
        cfg
    }

    pub fn lookup(&self, hostname: &str) -> Option<Arc<NodeConfig>> {
        self.nodes.get(hostname).cloned()
    }

    /// Host names in sorted order.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts = self.nodes.keys().cloned().collect::<Vec<String>>();
        hosts.sort();
        hosts
    }

    pub fn cross_node_jobs(&self, hostname: &str) -> bool {
        self.nodes
            .get(hostname)
            .map(|n| n.cross_node_jobs)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The input is human-generated and has many optional fields, so it is read with the generic JSON
/// parser and decoded field by field rather than through a derived parser.

pub fn read_cluster_config(filename: &str) -> Result<ClusterConfig> {
    let file = File::open(Path::new(filename))
        .with_context(|| format!("Opening config file {filename}"))?;
    let v = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Parsing config file {filename}"))?;
    decode_cluster_config(v, filename)
}

pub fn parse_cluster_config(text: &str, name: &str) -> Result<ClusterConfig> {
    decode_cluster_config(serde_json::from_str(text)?, name)
}

fn decode_cluster_config(v: Value, default_name: &str) -> Result<ClusterConfig> {
    let mut cfg: ClusterConfig = Default::default();
    match v {
        Value::Array(objs) => {
            cfg.name = default_name.to_string();
            cfg.description = default_name.to_string();
            cfg.nodes = process_cluster_nodes(&objs)?;
        }
        Value::Object(fields) => {
            cfg.name = grab_string(&fields, "name")?;
            cfg.description = grab_string_opt(&fields, "description")?;
            cfg.aliases = grab_strings_opt(&fields, "aliases")?;
            cfg.exclude_user = grab_strings_opt(&fields, "exclude-user")?;
            match fields.get("nodes") {
                Some(Value::Array(objs)) => cfg.nodes = process_cluster_nodes(objs)?,
                _ => bail!("The field 'nodes' is required"),
            }
        }
        _ => bail!("Expected an array or object value"),
    }
    Ok(cfg)
}

fn process_cluster_nodes(objs: &[Value]) -> Result<HashMap<String, Arc<NodeConfig>>> {
    let mut nodes = HashMap::new();
    for obj in objs {
        let Value::Object(fields) = obj else {
            bail!("Expected an object value for node")
        };
        let node = decode_node_config(fields)?;
        for exp in expand_pattern(&node.hostname)? {
            if nodes.contains_key(&exp) {
                bail!("System info for host {exp} already defined");
            }
            nodes.insert(
                exp.clone(),
                Arc::new(NodeConfig {
                    hostname: exp,
                    ..node.clone()
                }),
            );
        }
    }
    Ok(nodes)
}

/// Decode the node attributes of a JSON object.  This is shared with the sysinfo decoder, which
/// uses the same field names.

pub fn decode_node_config(fields: &serde_json::Map<String, Value>) -> Result<NodeConfig> {
    let gpu_cards = grab_usize_opt(fields, "gpu_cards")?;
    let gpumem_gb = grab_usize_opt(fields, "gpumem_gb")?;
    let gpumem_pct = grab_bool_opt(fields, "gpumem_pct")?;
    if gpu_cards.is_none() && (gpumem_gb.is_some() || gpumem_pct.is_some()) {
        bail!("Without gpu_cards there should be no gpumem_gb or gpumem_pct")
    }
    Ok(NodeConfig {
        timestamp: grab_string_opt(fields, "timestamp")?,
        hostname: grab_string(fields, "hostname")?,
        description: grab_string_opt(fields, "description")?,
        cross_node_jobs: grab_bool_opt(fields, "cross_node_jobs")?.unwrap_or(false),
        cpu_cores: grab_usize(fields, "cpu_cores")?,
        mem_gb: grab_usize(fields, "mem_gb")?,
        gpu_cards: gpu_cards.unwrap_or(0),
        gpumem_gb: gpumem_gb.unwrap_or(0),
        gpumem_pct: gpumem_pct.unwrap_or(false),
        metadata: grab_metadata_opt(fields, "metadata")?,
    })
}

fn grab_string(fields: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
    match fields.get(name) {
        Some(Value::String(s)) => Ok(s.to_string()),
        _ => bail!("Field '{name}' must be present and have a string value"),
    }
}

fn grab_string_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
    match fields.get(name) {
        Some(Value::String(s)) => Ok(s.to_string()),
        Some(_) => bail!("Field '{name}' must have a string value"),
        None => Ok("".to_string()),
    }
}

fn grab_strings_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Vec<String>> {
    let mut result = vec![];
    if let Some(Value::Array(vals)) = fields.get(name) {
        for v in vals {
            if let Value::String(s) = v {
                result.push(s.to_string());
            } else {
                bail!("Field '{name}' must have string values");
            }
        }
    }
    Ok(result)
}

fn grab_usize(fields: &serde_json::Map<String, Value>, name: &str) -> Result<usize> {
    match grab_usize_opt(fields, name)? {
        Some(n) => Ok(n),
        None => bail!("Field '{name}' must be present and have an integer value"),
    }
}

fn grab_usize_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<usize>> {
    match fields.get(name) {
        Some(Value::Number(n)) => match n.as_u64().map(usize::try_from) {
            Some(Ok(n)) => Ok(Some(n)),
            _ => bail!("Field '{name}' must have unsigned integer value"),
        },
        Some(_) => bail!("Field '{name}' must have unsigned integer value"),
        None => Ok(None),
    }
}

fn grab_bool_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<bool>> {
    match fields.get(name) {
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => bail!("Field '{name}' must have a boolean value"),
        None => Ok(None),
    }
}

fn grab_metadata_opt(
    fields: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<Vec<(String, String)>> {
    let mut result = vec![];
    match fields.get(name) {
        Some(Value::Array(vals)) => {
            for v in vals {
                let Value::Object(kv) = v else {
                    bail!("Field '{name}' must hold objects")
                };
                result.push((grab_string(kv, "k")?, grab_string(kv, "v")?));
            }
        }
        Some(_) => bail!("Field '{name}' must be an array"),
        None => {}
    }
    Ok(result)
}

#[test]
fn test_config_array_form() {
    let text = r##"[
 {"hostname": "ml1.hpc.uio.no", "cpu_cores": 56, "mem_gb": 256, "gpu_cards": 4,
  "gpumem_pct": true, "metadata": [{"k": "rack", "v": "a3"}]},
 {"#comment": "two nodes", "hostname": "c1-[23-24]", "cpu_cores": 64, "mem_gb": 512,
  "cross_node_jobs": true}
]"##;
    let conf = parse_cluster_config(text, "mlx").unwrap();
    assert!(conf.name == "mlx");
    assert_eq!(conf.hosts(), vec!["c1-23", "c1-24", "ml1.hpc.uio.no"]);

    let c0 = conf.lookup("ml1.hpc.uio.no").unwrap();
    assert!(c0.cpu_cores == 56);
    assert!(c0.gpu_cards == 4);
    assert!(c0.gpumem_gb == 0);
    assert!(c0.gpumem_pct);
    assert!(c0.metadata == vec![("rack".to_string(), "a3".to_string())]);
    assert!(!conf.cross_node_jobs("ml1.hpc.uio.no"));

    let c2 = conf.lookup("c1-24").unwrap();
    assert!(c2.hostname == "c1-24");
    assert!(c2.mem_gb == 512);
    assert!(conf.cross_node_jobs("c1-23"));
    assert!(conf.lookup("ml2.hpc.uio.no").is_none());
}

#[test]
fn test_config_object_form() {
    let text = r#"{"name": "mlx.hpc.uio.no", "description": "UiO machine learning nodes",
 "aliases": ["ml", "mlx"], "exclude-user": ["root"],
 "nodes": [{"hostname": "ml8.hpc.uio.no", "cpu_cores": 64, "mem_gb": 1024, "gpu_cards": 3,
            "gpumem_gb": 128}]}"#;
    let conf = parse_cluster_config(text, "ignored").unwrap();
    assert!(conf.name == "mlx.hpc.uio.no");
    assert!(conf.aliases == vec!["ml", "mlx"]);
    assert!(conf.exclude_user == vec!["root"]);
    let c1 = conf.lookup("ml8.hpc.uio.no").unwrap();
    assert!(c1.gpumem_gb == 128);
    assert!(!c1.gpumem_pct);
}

#[test]
fn test_config_errors() {
    // Duplicate host via pattern
    assert!(parse_cluster_config(
        r#"[{"hostname": "a[1-2]", "cpu_cores": 1, "mem_gb": 1},
            {"hostname": "a2", "cpu_cores": 1, "mem_gb": 1}]"#,
        "x"
    )
    .is_err());
    // Missing cpu_cores
    assert!(parse_cluster_config(r#"[{"hostname": "a", "mem_gb": 1}]"#, "x").is_err());
    // gpumem without cards
    assert!(parse_cluster_config(
        r#"[{"hostname": "a", "cpu_cores": 1, "mem_gb": 1, "gpumem_gb": 10}]"#,
        "x"
    )
    .is_err());
    // Wildcards can't be expanded
    assert!(parse_cluster_config(r#"[{"hostname": "a*", "cpu_cores": 1, "mem_gb": 1}]"#, "x").is_err());
    assert!(parse_cluster_config(r#"{"name": "x"}"#, "x").is_err());
    assert!(parse_cluster_config("17", "x").is_err());
}
