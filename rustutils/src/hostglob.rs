/// Matcher, splitter, expander and compressor for host names.
///
/// The grammar:
///
///   <multi-pattern> ::= <pattern> ("," <pattern>)*
///   <pattern> ::= <elem> ("." <elem>)*
///   <elem> ::= (literal | "[" <range-list> "]" | "*")+
///   <range-list> ::= <n>("-"<n>)? ("," <n>("-"<n>)?)*
///
/// Commas inside brackets do not separate patterns.  `*` matches any run of characters other than
/// `.`.  Patterns containing `*` can be matched but not expanded.
use crate::pattern;

use anyhow::{bail, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// A `HostGlobber` is a matcher of patterns against hostnames.  It holds any number of patterns
/// and a name matches if any one of them matches.
///
/// A prefix matcher matches whole leading elements, so `ml8` and `ml8.hpc` both match
/// `ml8.hpc.uio.no`, but `ml` does not.

#[derive(Debug, Clone)]
pub struct HostGlobber {
    is_prefix_matcher: bool,

    // Matcher + source pattern, for diagnostics.
    matchers: Vec<(Regex, String)>,
}

impl HostGlobber {
    pub fn new(is_prefix_matcher: bool) -> HostGlobber {
        HostGlobber {
            is_prefix_matcher,
            matchers: vec![],
        }
    }

    /// Build a matcher from a multi-pattern, the form used by `--host` and by slurm node lists.

    pub fn from_multi_pattern(is_prefix_matcher: bool, s: &str) -> Result<HostGlobber> {
        let mut globber = HostGlobber::new(is_prefix_matcher);
        for p in split_multi_pattern(s)? {
            globber.insert(&p)?;
        }
        Ok(globber)
    }

    /// Add a single <pattern> to the matcher.

    pub fn insert(&mut self, pattern: &str) -> Result<()> {
        let re = compile_globber(pattern, self.is_prefix_matcher)?;
        self.matchers.push((re, pattern.to_string()));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn patterns(&self) -> Vec<&str> {
        self.matchers.iter().map(|(_, p)| p.as_str()).collect()
    }

    pub fn match_hostname(&self, s: &str) -> bool {
        self.matchers.iter().any(|(re, _)| re.is_match(s))
    }
}

fn compile_globber(p: &str, prefix: bool) -> Result<Regex> {
    if p.is_empty() {
        bail!("Empty host pattern")
    }
    let cs = p.chars().collect::<Vec<char>>();
    let mut i = 0usize;
    let mut r = "^".to_string();
    while i < cs.len() {
        if r.len() > 50000 {
            bail!("Host pattern too large, use more '*'")
        }
        match cs[i] {
            '*' => {
                i += 1;
                r += "[^.]*";
            }
            '[' => {
                let close = match cs[i..].iter().position(|c| *c == ']') {
                    Some(k) => i + k,
                    None => bail!("Missing ']' in host pattern {p}"),
                };
                // Reuse the element expander on the bracket alone to get its numbers.
                let bracket = cs[i..=close].iter().collect::<String>();
                let set = pattern::expand_element(&bracket)?;
                r += "(?:";
                r += &set.join("|");
                r += ")";
                i = close + 1;
            }
            ']' | ',' => bail!("Unexpected '{}' in host pattern {p}", cs[i]),
            c => {
                r += &regex::escape(&c.to_string());
                i += 1;
            }
        }
    }
    if prefix {
        r += "(?:\\..*)?$"
    } else {
        r += "$";
    }
    Ok(Regex::new(&r)?)
}

/// Split a multi-pattern at commas that are outside brackets.  Nested brackets, unbalanced
/// brackets and empty patterns are errors.  The empty string splits into nothing.

pub fn split_multi_pattern(s: &str) -> Result<Vec<String>> {
    let mut result = vec![];
    if s.is_empty() {
        return Ok(result);
    }
    let mut inside_brackets = false;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '[' => {
                if inside_brackets {
                    bail!("Illegal pattern {s}: nested brackets")
                }
                inside_brackets = true;
                current.push(c);
            }
            ']' => {
                if !inside_brackets {
                    bail!("Illegal pattern {s}: unmatched end bracket")
                }
                inside_brackets = false;
                current.push(c);
            }
            ',' if !inside_brackets => {
                if current.is_empty() {
                    bail!("Illegal pattern {s}: empty host name")
                }
                result.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if inside_brackets {
        bail!("Illegal pattern {s}: missing end bracket")
    }
    if current.is_empty() {
        bail!("Illegal pattern {s}: empty host name")
    }
    result.push(current);
    Ok(result)
}

/// `expand_pattern()` takes a single <pattern> and expands it into the host names it denotes, in
/// the order written, leftmost element varying slowest.  The pattern must contain no `*`.

pub fn expand_pattern(p: &str) -> Result<Vec<String>> {
    let mut names = vec!["".to_string()];
    for (k, elt) in p.split('.').enumerate() {
        let expanded = pattern::expand_element(elt)?;
        let mut next = Vec::with_capacity(names.len() * expanded.len());
        for n in &names {
            for e in &expanded {
                if k == 0 {
                    next.push(e.clone());
                } else {
                    next.push(format!("{n}.{e}"));
                }
            }
        }
        names = next;
    }
    Ok(names)
}

/// Expand every pattern in a multi-pattern and concatenate the results.

pub fn expand_multi_pattern(s: &str) -> Result<Vec<String>> {
    let mut result = vec![];
    for p in split_multi_pattern(s)? {
        result.extend(expand_pattern(&p)?);
    }
    Ok(result)
}

/// `compress_hostnames()` takes a list of concrete host names and returns a sorted list of
/// patterns whose expansion is exactly the set of input names.  The result does not depend on
/// the order of the input.
///
/// Names are grouped by their tail (everything from the first `.`) and by the prefix of their
/// first element before a trailing run of digits; the digit values of each group are compressed
/// into a range list.  So c6-1.a, c6-2.a and c6-3.a become c6-[1-3].a.  Names whose first element
/// has no trailing digits, or whose digits have a leading zero, are passed through unchanged.

pub fn compress_hostnames<S: AsRef<str>>(hosts: &[S]) -> Vec<String> {
    let mut groups: BTreeMap<(&str, &str), BTreeSet<u32>> = BTreeMap::new();
    let mut singles: BTreeSet<String> = BTreeSet::new();
    for h in hosts {
        let h = h.as_ref();
        let (first, tail) = match h.find('.') {
            Some(ix) => (&h[..ix], &h[ix..]),
            None => (h, ""),
        };
        match numbered_suffix(first) {
            Some((prefix, n)) => {
                groups.entry((tail, prefix)).or_default().insert(n);
            }
            None => {
                singles.insert(h.to_string());
            }
        }
    }

    let mut results = singles;
    for ((tail, prefix), numbers) in groups {
        let numbers = numbers.into_iter().collect::<Vec<u32>>();
        let body = if numbers.len() == 1 {
            numbers[0].to_string()
        } else {
            combine(&numbers)
        };
        results.insert(format!("{prefix}{body}{tail}"));
    }
    results.into_iter().collect()
}

// Split "abc12" into ("abc", 12).  The prefix must be nonempty and the digit string must be a
// canonical decimal (no leading zero) that fits in u32, or the name is not combinable.

fn numbered_suffix(a: &str) -> Option<(&str, u32)> {
    let xs = a.as_bytes();
    let mut i = xs.len();
    while i > 0 && xs[i - 1].is_ascii_digit() {
        i -= 1;
    }
    if i == 0 || i == xs.len() {
        return None;
    }
    let digits = &a[i..];
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse::<u32>().ok().map(|n| (&a[..i], n))
}

// `numbers` is sorted and deduplicated.
fn combine(numbers: &[u32]) -> String {
    let mut s = "[".to_string();
    let mut k = 0;
    while k < numbers.len() {
        let mut m = k + 1;
        while m < numbers.len() && numbers[m] as u64 == numbers[k] as u64 + (m - k) as u64 {
            m += 1;
        }
        if k > 0 {
            s += ",";
        }
        if m == k + 1 {
            s += &numbers[k].to_string();
        } else {
            s += &format!("{}-{}", numbers[k], numbers[m - 1]);
        }
        k = m;
    }
    s + "]"
}

#[test]
fn test_hostglobber_prefix() {
    let mut hf = HostGlobber::new(true);
    hf.insert("ml8").unwrap();
    hf.insert("ml3.hpc").unwrap();
    assert!(hf.match_hostname("ml8.hpc.uio.no"));
    assert!(hf.match_hostname("ml3.hpc.uio.no"));
    assert!(!hf.match_hostname("ml80.hpc.uio.no"));

    let mut hf = HostGlobber::new(false);
    hf.insert("ml4.hpc.uio.no").unwrap();
    assert!(hf.match_hostname("ml4.hpc.uio.no"));
    assert!(!hf.match_hostname("ml4.hpc.uio.no.yes"));
    assert!(!hf.match_hostname("ml4xhpc.uio.no"));
}

#[test]
fn test_hostglobber_ranges_and_stars() {
    let hf = HostGlobber::from_multi_pattern(false, "c[1-3]-[2,4],gpu*.fox").unwrap();
    assert!(hf.match_hostname("c1-2"));
    assert!(hf.match_hostname("c3-4"));
    assert!(!hf.match_hostname("c2-3"));
    assert!(hf.match_hostname("gpu-7.fox"));
    assert!(!hf.match_hostname("gpu.7.fox"));
    assert!(HostGlobber::from_multi_pattern(false, "c[1-3").is_err());
    assert!(HostGlobber::new(true).is_empty());
}

#[test]
fn test_split_multi_pattern() {
    assert_eq!(
        split_multi_pattern("c1-[1,3],c2,b[1-2].x").unwrap(),
        vec!["c1-[1,3]", "c2", "b[1-2].x"]
    );
    assert!(split_multi_pattern("").unwrap().is_empty());
    assert!(split_multi_pattern("a,,b").is_err());
    assert!(split_multi_pattern("a,").is_err());
    assert!(split_multi_pattern("a[[1]]").is_err());
    assert!(split_multi_pattern("a1]").is_err());
    assert!(split_multi_pattern("a[1").is_err());
}

#[test]
fn test_expand_pattern() {
    assert_eq!(
        expand_pattern("hi[1-2].ho[3-4]").unwrap(),
        vec!["hi1.ho3", "hi1.ho4", "hi2.ho3", "hi2.ho4"]
    );
    assert!(expand_pattern("hi*.ho").is_err());
    assert!(expand_pattern("a..b").is_err());
    assert_eq!(
        expand_multi_pattern("c1-[0-1],c2-[2-3]").unwrap(),
        vec!["c1-0", "c1-1", "c2-2", "c2-3"]
    );
}

#[test]
fn test_compress_hostnames() {
    assert_eq!(
        compress_hostnames(&["c6-1", "c6-2", "c6-3", "c66-4", "cesium"]),
        vec!["c6-[1-3]", "c66-4", "cesium"]
    );
    assert_eq!(compress_hostnames(&["a1", "a3", "a2", "a5"]), vec!["a[1-3,5]"]);
    assert_eq!(
        compress_hostnames(&["a3.fox", "a1.fox", "a3.fum", "a2.fox", "a5.fox"]),
        vec!["a3.fum", "a[1-3,5].fox"]
    );
    // Leading zeros are not representable in a range.
    assert_eq!(compress_hostnames(&["n01", "n02"]), vec!["n01", "n02"]);
    assert!(compress_hostnames::<&str>(&[]).is_empty());
}

#[test]
fn test_compress_expand_roundtrip() {
    let hosts = [
        "c1-9.a", "c1-10.a", "c1-11.a", "c1-3.b", "x", "y7", "y9", "y8", "c1-12.a", "n007",
    ];
    let mut expected = hosts.iter().map(|s| s.to_string()).collect::<Vec<String>>();
    expected.sort();
    let mut rotated = hosts.to_vec();
    for _ in 0..hosts.len() {
        rotated.rotate_left(3);
        let compressed = compress_hostnames(&rotated);
        assert_eq!(compressed, compress_hostnames(&hosts));
        let mut expanded = compressed
            .iter()
            .flat_map(|p| expand_pattern(p).unwrap())
            .collect::<Vec<String>>();
        expanded.sort();
        assert_eq!(expanded, expected);
    }
}
