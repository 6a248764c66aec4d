/// Layout of a cluster's data directory, and enumeration of the files in it.
///
/// The tree is partitioned by UTC day:
///
///    <root>/YYYY/MM/DD/<host>.csv             samples for one host
///    <root>/YYYY/MM/DD/sysinfo-<host>.json    inventory for one host
///    <root>/YYYY/MM/DD/sacct.csv              scheduler accounting for the cluster
///
/// where month and day have leading zeroes.  Files are only ever appended to.
use anyhow::{bail, Result};
use chrono::Datelike;
use rustutils::{date_range, HostGlobber, Timestamp};
use std::path::{Path, PathBuf};

#[cfg(test)]
use rustutils::timestamp_from_ymd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Sample,
    Sysinfo,
    Sacct,
}

const SYSINFO_PREFIX: &str = "sysinfo-";
const SACCT_NAME: &str = "sacct.csv";

impl FileKind {
    /// The name of the file of this kind for `host` within a day directory.  The host is ignored
    /// for sacct data.
    pub fn file_name(&self, host: &str) -> String {
        match self {
            FileKind::Sample => format!("{host}.csv"),
            FileKind::Sysinfo => format!("{SYSINFO_PREFIX}{host}.json"),
            FileKind::Sacct => SACCT_NAME.to_string(),
        }
    }

    /// If `name` is a file of this kind, return the host name part of it (empty for sacct).
    pub fn host_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        match self {
            FileKind::Sample => {
                if name == SACCT_NAME || name.starts_with(SYSINFO_PREFIX) {
                    return None;
                }
                name.strip_suffix(".csv").filter(|h| !h.is_empty())
            }
            FileKind::Sysinfo => name
                .strip_prefix(SYSINFO_PREFIX)?
                .strip_suffix(".json")
                .filter(|h| !h.is_empty()),
            FileKind::Sacct => {
                if name == SACCT_NAME {
                    Some("")
                } else {
                    None
                }
            }
        }
    }
}

/// The directory holding the files for the UTC day of `t`.

pub fn day_dir(root: &Path, t: Timestamp) -> PathBuf {
    root.join(format!("{}", t.year()))
        .join(format!("{:02}", t.month()))
        .join(format!("{:02}", t.day()))
}

/// The path of the file of `kind` for `host` on the UTC day of `t`.

pub fn data_file(root: &Path, kind: FileKind, host: &str, t: Timestamp) -> PathBuf {
    day_dir(root, t).join(kind.file_name(host))
}

/// Find the files of `kind` under `root` for the days covering `[from, to)` and the hosts matched
/// by `hosts` (all hosts if it is empty).  The returned paths are sorted.
///
/// The range is widened to whole UTC days: the day containing `from` is included, and the day
/// containing `to` is included unless `to` is exactly midnight.  Finer filtering by time is the
/// caller's business.
///
/// Missing day directories are skipped.  It is an error for `root` not to be a directory, or for a
/// day directory that exists not to be readable.  Names that are not UTF-8 are ignored.

pub fn find_files(
    root: &Path,
    kind: FileKind,
    hosts: &HostGlobber,
    from: Timestamp,
    to: Timestamp,
) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        // Path redacted so as not to reveal secrets
        bail!("Not a viable data directory");
    }

    let mut filenames = vec![];
    for (year, month, day) in date_range(from, to) {
        let dir = root
            .join(format!("{year}"))
            .join(format!("{month:02}"))
            .join(format!("{day:02}"));
        if !dir.is_dir() {
            continue;
        }
        for entry in dir.read_dir()? {
            // Bad directory entries are ignored, the iterator makes progress past them.
            let Ok(entry) = entry else {
                continue;
            };
            let p = entry.path();
            let Some(name) = p.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(host) = kind.host_of(name) else {
                continue;
            };
            if kind == FileKind::Sacct || hosts.is_empty() || hosts.match_hostname(host) {
                filenames.push(p);
            }
        }
    }
    filenames.sort();
    Ok(filenames)
}

#[cfg(test)]
fn make_tree(root: &Path, files: &[&str]) {
    for f in files {
        let p = root.join(f);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, "").unwrap();
    }
}

#[cfg(test)]
fn relative(root: &Path, xs: Vec<PathBuf>) -> Vec<String> {
    xs.iter()
        .map(|p| p.strip_prefix(root).unwrap().to_str().unwrap().to_string())
        .collect::<Vec<String>>()
}

#[test]
fn test_file_names() {
    assert!(FileKind::Sample.file_name("a.b") == "a.b.csv");
    assert!(FileKind::Sysinfo.file_name("a.b") == "sysinfo-a.b.json");
    assert!(FileKind::Sacct.file_name("a.b") == "sacct.csv");
    assert!(FileKind::Sample.host_of("a.b.csv") == Some("a.b"));
    assert!(FileKind::Sample.host_of("sacct.csv").is_none());
    assert!(FileKind::Sample.host_of("sysinfo-a.json").is_none());
    assert!(FileKind::Sample.host_of("a.json").is_none());
    assert!(FileKind::Sample.host_of(".csv").is_none());
    assert!(FileKind::Sysinfo.host_of("sysinfo-a.json") == Some("a"));
    assert!(FileKind::Sysinfo.host_of("a.csv").is_none());
    assert!(FileKind::Sacct.host_of("sacct.csv") == Some(""));
    let p = data_file(
        Path::new("/x"),
        FileKind::Sample,
        "h",
        rustutils::timestamp_from_ymdhms(2023, 6, 4, 23, 59, 59),
    );
    assert!(p == Path::new("/x/2023/06/04/h.csv"));
}

#[test]
fn test_find_files() {
    let td = tempfile::TempDir::new().unwrap();
    let root = td.path();
    make_tree(
        root,
        &[
            "2023/05/30/a.csv",
            "2023/05/30/b.csv",
            "2023/05/30/sysinfo-a.json",
            "2023/05/30/sacct.csv",
            "2023/05/30/README",
            "2023/05/31/a.csv",
            "2023/06/01/b.csv",
            "2023/06/02/a.csv",
            "2023/06/02/sacct.csv",
        ],
    );
    // A file where a directory should be is ignored.
    std::fs::write(root.join("2023/05/29"), "").unwrap();

    let all = HostGlobber::new(true);
    let xs = find_files(
        root,
        FileKind::Sample,
        &all,
        timestamp_from_ymd(2023, 5, 29),
        timestamp_from_ymd(2023, 6, 2),
    )
    .unwrap();
    assert_eq!(
        relative(root, xs),
        vec![
            "2023/05/30/a.csv",
            "2023/05/30/b.csv",
            "2023/05/31/a.csv",
            "2023/06/01/b.csv"
        ]
    );

    // Mid-day end includes that day.
    let xs = find_files(
        root,
        FileKind::Sacct,
        &all,
        timestamp_from_ymd(2023, 5, 30),
        rustutils::timestamp_from_ymdhms(2023, 6, 2, 1, 0, 0),
    )
    .unwrap();
    assert_eq!(
        relative(root, xs),
        vec!["2023/05/30/sacct.csv", "2023/06/02/sacct.csv"]
    );

    let a = HostGlobber::from_multi_pattern(true, "a").unwrap();
    let xs = find_files(
        root,
        FileKind::Sample,
        &a,
        timestamp_from_ymd(2023, 5, 1),
        timestamp_from_ymd(2023, 7, 1),
    )
    .unwrap();
    assert_eq!(
        relative(root, xs),
        vec!["2023/05/30/a.csv", "2023/05/31/a.csv", "2023/06/02/a.csv"]
    );

    let xs = find_files(
        root,
        FileKind::Sysinfo,
        &all,
        timestamp_from_ymd(2023, 5, 1),
        timestamp_from_ymd(2023, 7, 1),
    )
    .unwrap();
    assert_eq!(relative(root, xs), vec!["2023/05/30/sysinfo-a.json"]);

    // Empty window
    let xs = find_files(
        root,
        FileKind::Sample,
        &all,
        timestamp_from_ymd(2024, 1, 1),
        timestamp_from_ymd(2024, 1, 5),
    )
    .unwrap();
    assert!(xs.is_empty());

    assert!(find_files(
        &root.join("nonexistent"),
        FileKind::Sample,
        &all,
        timestamp_from_ymd(2024, 1, 1),
        timestamp_from_ymd(2024, 1, 5),
    )
    .is_err());
}
