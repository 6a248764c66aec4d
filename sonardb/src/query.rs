/// Query machinery shared by the views: the record filter that selects samples as they come off the
/// store, and a small layer of typed fields on which predicates, projection and sorting work.
///
/// A predicate is an expression over the fields of a row:
///
///   expr ::= expr "or" expr
///          | expr "and" expr
///          | ("~" | "not") expr
///          | "(" expr ")"
///          | field op value
///   op   ::= "<" | "<=" | ">" | ">=" | "=" | "=~"
///
/// `or` binds looser than `and`, which binds looser than the relational operators, which bind
/// looser than the complement.  Field names are case-insensitive.  A value is a bare word or
/// number, or a string quoted with `"`, `'`, `/` or backquotes.  It is converted once, when the
/// predicate is compiled, to the kind of the field it is compared with.  `=~` matches a regular
/// expression against the printed form of the field.
use crate::intern::{intern, Sym};
use crate::sample::Sample;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use rustutils::{format_duration, gpuset_to_string, parse_duration, parse_timestamp};
use rustutils::{GpuSet, HostGlobber, Timestamp};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

/// The record-level selection given by the user's flags.  Empty sets and `None` mean "don't care".
/// The time bounds are both inclusive.

#[derive(Debug, Default)]
pub struct RecordFilter {
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
    pub hosts: Option<HostGlobber>,
    pub users: HashSet<String>,
    pub exclude_users: HashSet<String>,
    pub commands: HashSet<String>,
    pub exclude_commands: HashSet<String>,
    pub job_ids: HashSet<u32>,
}

pub type SampleFilter = Box<dyn Fn(&Sample) -> bool + Send + Sync>;

impl RecordFilter {
    /// Reduce the filter to a single closure.  Names are interned here so that the per-record
    /// tests are id comparisons.

    pub fn compile(self) -> SampleFilter {
        let syms = |xs: HashSet<String>| xs.iter().map(|x| intern(x)).collect::<HashSet<Sym>>();
        let users = syms(self.users);
        let exclude_users = syms(self.exclude_users);
        let commands = syms(self.commands);
        let exclude_commands = syms(self.exclude_commands);
        let hosts = self.hosts.filter(|h| !h.is_empty());
        let job_ids = self.job_ids;
        let from = self.from;
        let to = self.to;
        Box::new(move |s: &Sample| {
            from.map_or(true, |t| t <= s.timestamp)
                && to.map_or(true, |t| s.timestamp <= t)
                && (users.is_empty() || users.contains(&s.user))
                && !exclude_users.contains(&s.user)
                && (commands.is_empty() || commands.contains(&s.command))
                && !exclude_commands.contains(&s.command)
                && (job_ids.is_empty() || job_ids.contains(&s.job_id))
                && hosts
                    .as_ref()
                    .map_or(true, |h| h.match_hostname(s.hostname.as_str()))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    UInt,
    Float,
    Str,
    Bool,
    Timestamp,
    /// Seconds.
    Duration,
    GpuSet,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bool(bool),
    Timestamp(Timestamp),
    Duration(i64),
    Gpus(GpuSet),
}

impl Value {
    /// True for the values that `nodefaults` output leaves out.
    pub fn is_default(&self) -> bool {
        match self {
            Value::Int(x) => *x == 0,
            Value::UInt(x) => *x == 0,
            Value::Float(x) => *x == 0.0,
            Value::Str(s) => s.is_empty(),
            Value::Bool(b) => !b,
            Value::Timestamp(_) => false,
            Value::Duration(x) => *x == 0,
            Value::Gpus(g) => *g == Some(0),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(x) => write!(f, "{x}"),
            Value::UInt(x) => write!(f, "{x}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%dT%H:%M:%SZ")),
            Value::Duration(x) => write!(f, "{}", format_duration(*x)),
            Value::Gpus(g) => write!(f, "{}", gpuset_to_string(g)),
        }
    }
}

/// Values of different kinds are unordered.  GPU sets compare by their printed form, also against
/// strings, since that is what a literal for them is.

pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::UInt(x), Value::UInt(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::Duration(x), Value::Duration(y)) => Some(x.cmp(y)),
        (Value::Gpus(x), Value::Gpus(y)) => Some(gpuset_to_string(x).cmp(&gpuset_to_string(y))),
        (Value::Gpus(x), Value::Str(y)) => Some(gpuset_to_string(x).as_str().cmp(y.as_str())),
        _ => None,
    }
}

/// A named, typed column of a view over rows of type `T`.

pub struct Field<T> {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: FieldKind,
    pub get: fn(&T) -> Value,
}

pub fn find_field<'a, T>(fields: &'a [Field<T>], name: &str) -> Result<&'a Field<T>> {
    match fields.iter().find(|f| f.name.eq_ignore_ascii_case(name)) {
        Some(f) => Ok(f),
        None => bail!("Unknown field: {name}"),
    }
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM` (both UTC) and RFC 3339.

pub fn parse_time_literal(s: &str) -> Result<Timestamp> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&t));
        }
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    parse_timestamp(s)
}

pub fn convert_literal(kind: FieldKind, text: &str) -> Result<Value> {
    Ok(match kind {
        FieldKind::Int => Value::Int(text.parse::<i64>()?),
        FieldKind::UInt => Value::UInt(text.parse::<u64>()?),
        FieldKind::Float => Value::Float(text.parse::<f64>()?),
        FieldKind::Str | FieldKind::GpuSet => Value::Str(text.to_string()),
        FieldKind::Bool => match text.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Value::Bool(true),
            "false" | "no" | "0" => Value::Bool(false),
            _ => bail!("Not a boolean: {text}"),
        },
        FieldKind::Timestamp => Value::Timestamp(parse_time_literal(text)?),
        FieldKind::Duration => Value::Duration(parse_duration(text)?.num_seconds()),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Match,
    Prefix,
    Not,
    And,
    Or,
    Word(String),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Match,  // Regular expression on the formatted value
    Prefix, // String prefix of the formatted value
}

impl RelOp {
    fn holds(self, o: Ordering) -> bool {
        match self {
            RelOp::Lt => o == Ordering::Less,
            RelOp::Le => o != Ordering::Greater,
            RelOp::Gt => o == Ordering::Greater,
            RelOp::Ge => o != Ordering::Less,
            RelOp::Ne => o != Ordering::Equal,
            RelOp::Eq | RelOp::Match | RelOp::Prefix => o == Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Rel {
        op: RelOp,
        field: String,
        value: String,
    },
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || "()<>=!~\"'`".contains(c)
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let cs = input.chars().collect::<Vec<char>>();
    let mut toks = vec![];
    let mut i = 0;
    while i < cs.len() {
        let c = cs[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                toks.push(Token::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Token::RParen);
                i += 1;
            }
            '<' | '>' => {
                let eq = cs.get(i + 1) == Some(&'=');
                toks.push(match (c, eq) {
                    ('<', false) => Token::Lt,
                    ('<', true) => Token::Le,
                    (_, false) => Token::Gt,
                    (_, true) => Token::Ge,
                });
                i += if eq { 2 } else { 1 };
            }
            '=' => match cs.get(i + 1) {
                Some('~') => {
                    toks.push(Token::Match);
                    i += 2;
                }
                Some('?') => {
                    toks.push(Token::Prefix);
                    i += 2;
                }
                _ => {
                    toks.push(Token::Eq);
                    i += 1;
                }
            },
            '!' if cs.get(i + 1) == Some(&'=') => {
                toks.push(Token::Ne);
                i += 2;
            }
            '~' | '!' => {
                toks.push(Token::Not);
                i += 1;
            }
            '"' | '\'' | '/' | '`' => {
                let start = i + 1;
                let Some(len) = cs[start..].iter().position(|x| *x == c) else {
                    bail!("End of input in string at position {i}")
                };
                toks.push(Token::Str(cs[start..start + len].iter().collect()));
                i = start + len + 1;
            }
            _ => {
                let start = i;
                while i < cs.len() && !is_delimiter(cs[i]) {
                    i += 1;
                }
                let w = cs[start..i].iter().collect::<String>();
                toks.push(match w.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Word(w),
                });
            }
        }
    }
    Ok(toks)
}

struct Parser {
    toks: Vec<Token>,
    i: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.i)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.toks.get(self.i).cloned();
        self.i += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.i += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.i += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.i += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let e = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(e),
                    _ => bail!("Syntax error in query: missing ')'"),
                }
            }
            Some(Token::Word(field)) => {
                let op = match self.next() {
                    Some(Token::Lt) => RelOp::Lt,
                    Some(Token::Le) => RelOp::Le,
                    Some(Token::Gt) => RelOp::Gt,
                    Some(Token::Ge) => RelOp::Ge,
                    Some(Token::Eq) => RelOp::Eq,
                    Some(Token::Ne) => RelOp::Ne,
                    Some(Token::Match) => RelOp::Match,
                    Some(Token::Prefix) => RelOp::Prefix,
                    _ => bail!("Syntax error in query: operator expected after {field}"),
                };
                let value = match self.next() {
                    Some(Token::Word(v)) | Some(Token::Str(v)) => v,
                    _ => bail!("Syntax error in query: value expected after {field}"),
                };
                Ok(Expr::Rel { op, field, value })
            }
            Some(t) => bail!("Syntax error in query: unexpected {t:?}"),
            None => bail!("Syntax error in query: unexpected end of input"),
        }
    }
}

pub fn parse_query(text: &str) -> Result<Expr> {
    let mut p = Parser {
        toks: lex(text)?,
        i: 0,
    };
    let e = p.parse_or()?;
    if let Some(t) = p.peek() {
        bail!("Syntax error in query: unexpected {t:?}")
    }
    Ok(e)
}

pub type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Parse and compile `text` against the fields of a view.  Unknown fields and literals that don't
/// convert to the field's kind are errors.

pub fn compile_query<T: 'static>(fields: &[Field<T>], text: &str) -> Result<Predicate<T>> {
    let e = parse_query(text)?;
    compile_expr(fields, e)
}

fn compile_expr<T: 'static>(fields: &[Field<T>], e: Expr) -> Result<Predicate<T>> {
    let p: Predicate<T> = match e {
        Expr::And(a, b) => {
            let a = compile_expr(fields, *a)?;
            let b = compile_expr(fields, *b)?;
            Box::new(move |x: &T| a(x) && b(x))
        }
        Expr::Or(a, b) => {
            let a = compile_expr(fields, *a)?;
            let b = compile_expr(fields, *b)?;
            Box::new(move |x: &T| a(x) || b(x))
        }
        Expr::Not(a) => {
            let a = compile_expr(fields, *a)?;
            Box::new(move |x: &T| !a(x))
        }
        Expr::Rel { op, field, value } => {
            let f = find_field(fields, &field)?;
            let get = f.get;
            if op == RelOp::Match {
                let re = Regex::new(&value)
                    .with_context(|| format!("Bad regular expression {value}"))?;
                Box::new(move |x: &T| re.is_match(&get(x).to_string()))
            } else if op == RelOp::Prefix {
                Box::new(move |x: &T| get(x).to_string().starts_with(&value))
            } else {
                let v = convert_literal(f.kind, &value)
                    .with_context(|| format!("Bad value for field {}: {value}", f.name))?;
                Box::new(move |x: &T| compare_values(&get(x), &v).map_or(false, |o| op.holds(o)))
            }
        }
    };
    Ok(p)
}

/// Words in a field list that control the output format rather than name fields.

pub const CONTROL_WORDS: &[&str] = &[
    "fixed",
    "csv",
    "csvnamed",
    "json",
    "awk",
    "header",
    "noheader",
    "nodefaults",
];

fn is_control_word(w: &str) -> bool {
    CONTROL_WORDS.contains(&w) || w.starts_with("tag:")
}

pub struct Projection<'a, T> {
    pub fields: Vec<&'a Field<T>>,
    pub controls: Vec<String>,
}

/// Resolve a comma-separated field list.  `aliases` maps a name to a comma-separated list of
/// fields; `all` is every field.  Anything that is neither a field, an alias nor a control word is
/// an error, as is a list that selects no fields.

// Aliases may name other aliases, to a small depth.

fn expand_alias<'a, T>(
    fields: &'a [Field<T>],
    aliases: &[(&str, &str)],
    w: &str,
    depth: usize,
    selected: &mut Vec<&'a Field<T>>,
) -> Result<()> {
    match aliases.iter().find(|(a, _)| a.eq_ignore_ascii_case(w)) {
        Some((_, expansion)) if depth < 4 => {
            for name in expansion.split(',') {
                expand_alias(fields, aliases, name, depth + 1, selected)?;
            }
        }
        _ => selected.push(find_field(fields, w)?),
    }
    Ok(())
}

pub fn select_fields<'a, T>(
    fields: &'a [Field<T>],
    aliases: &[(&str, &str)],
    spec: &str,
) -> Result<Projection<'a, T>> {
    let mut selected = vec![];
    let mut controls = vec![];
    for w in spec.split(',').map(|w| w.trim()).filter(|w| !w.is_empty()) {
        if is_control_word(w) {
            controls.push(w.to_string());
        } else if w == "all" {
            selected.extend(fields.iter());
        } else {
            expand_alias(fields, aliases, w, 0, &mut selected)?;
        }
    }
    if selected.is_empty() {
        bail!("No output fields were selected")
    }
    Ok(Projection {
        fields: selected,
        controls,
    })
}

pub struct SortKey<T> {
    get: fn(&T) -> Value,
    descending: bool,
}

/// Parse `field[:asc|:desc],...`.

pub fn parse_sort_keys<T>(fields: &[Field<T>], spec: &str) -> Result<Vec<SortKey<T>>> {
    let mut keys = vec![];
    for item in spec.split(',').map(|w| w.trim()).filter(|w| !w.is_empty()) {
        let (name, descending) = match item.split_once(':') {
            None => (item, false),
            Some((n, "asc")) => (n, false),
            Some((n, "desc")) => (n, true),
            Some(_) => bail!("Bad sort key {item}"),
        };
        keys.push(SortKey {
            get: find_field(fields, name)?.get,
            descending,
        });
    }
    Ok(keys)
}

/// Stable sort by the keys in order.  Unordered pairs of values count as equal.

pub fn sort_rows<T>(rows: &mut [T], keys: &[SortKey<T>]) {
    rows.sort_by(|a, b| {
        for k in keys {
            let o = compare_values(&(k.get)(a), &(k.get)(b)).unwrap_or(Ordering::Equal);
            let o = if k.descending { o.reverse() } else { o };
            if o != Ordering::Equal {
                return o;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
use rustutils::{timestamp_from_ymd, timestamp_from_ymdhms};

#[cfg(test)]
struct Row {
    user: String,
    cpu: f64,
    samples: u64,
    duration: i64,
    start: Timestamp,
    gpus: GpuSet,
    zombie: bool,
}

#[cfg(test)]
fn row_fields() -> Vec<Field<Row>> {
    vec![
        Field {
            name: "user",
            help: "User name",
            kind: FieldKind::Str,
            get: |r: &Row| Value::Str(r.user.clone()),
        },
        Field {
            name: "cpu",
            help: "CPU utilization",
            kind: FieldKind::Float,
            get: |r: &Row| Value::Float(r.cpu),
        },
        Field {
            name: "samples",
            help: "Sample count",
            kind: FieldKind::UInt,
            get: |r: &Row| Value::UInt(r.samples),
        },
        Field {
            name: "duration",
            help: "Run time",
            kind: FieldKind::Duration,
            get: |r: &Row| Value::Duration(r.duration),
        },
        Field {
            name: "start",
            help: "Start time",
            kind: FieldKind::Timestamp,
            get: |r: &Row| Value::Timestamp(r.start),
        },
        Field {
            name: "gpus",
            help: "Cards used",
            kind: FieldKind::GpuSet,
            get: |r: &Row| Value::Gpus(r.gpus),
        },
        Field {
            name: "zombie",
            help: "Zombie flag",
            kind: FieldKind::Bool,
            get: |r: &Row| Value::Bool(r.zombie),
        },
    ]
}

#[cfg(test)]
fn rows() -> Vec<Row> {
    vec![
        Row {
            user: "ann".to_string(),
            cpu: 12.5,
            samples: 10,
            duration: 3600,
            start: timestamp_from_ymdhms(2024, 11, 4, 10, 0, 0),
            gpus: Some(0b101),
            zombie: false,
        },
        Row {
            user: "bob".to_string(),
            cpu: 250.0,
            samples: 2,
            duration: 60,
            start: timestamp_from_ymd(2024, 11, 3),
            gpus: Some(0),
            zombie: true,
        },
        Row {
            user: "cat".to_string(),
            cpu: 0.0,
            samples: 40,
            duration: 7200,
            start: timestamp_from_ymdhms(2024, 11, 5, 12, 30, 0),
            gpus: None,
            zombie: false,
        },
    ]
}

#[cfg(test)]
fn users_matching(q: &str) -> Vec<String> {
    let fields = row_fields();
    let p = compile_query(&fields, q).unwrap();
    rows()
        .into_iter()
        .filter(|r| p(r))
        .map(|r| r.user)
        .collect::<Vec<String>>()
}

#[test]
fn test_parse_query() {
    let e = parse_query("a=andor").unwrap();
    assert_eq!(
        e,
        Expr::Rel {
            op: RelOp::Eq,
            field: "a".to_string(),
            value: "andor".to_string()
        }
    );
    let e = parse_query("(ab <= `+=`)").unwrap();
    assert_eq!(
        e,
        Expr::Rel {
            op: RelOp::Le,
            field: "ab".to_string(),
            value: "+=".to_string()
        }
    );
    let e = parse_query("abc0 >=/hi ho/ ").unwrap();
    assert!(matches!(e, Expr::Rel { op: RelOp::Ge, ref value, .. } if value == "hi ho"));

    // The complement binds to the match, and `and` groups that with the comparison.
    let e = parse_query("not User =~ /root|toor/ and Duration > 1h").unwrap();
    assert_eq!(
        e,
        Expr::And(
            Box::new(Expr::Not(Box::new(Expr::Rel {
                op: RelOp::Match,
                field: "User".to_string(),
                value: "root|toor".to_string()
            }))),
            Box::new(Expr::Rel {
                op: RelOp::Gt,
                field: "Duration".to_string(),
                value: "1h".to_string()
            })
        )
    );

    let e = parse_query("a = 1 or b = 2 and c > 3").unwrap();
    assert!(matches!(e, Expr::Or(_, ref rhs) if matches!(**rhs, Expr::And(_, _))));
    let e = parse_query("a > 3 and b = 1 or c = 2").unwrap();
    assert!(matches!(e, Expr::Or(ref lhs, _) if matches!(**lhs, Expr::And(_, _))));
}

#[test]
fn test_parse_query_errors() {
    assert!(parse_query("a = 1 and b").is_err());
    assert!(parse_query("a = \"x").is_err());
    assert!(parse_query("(a = 1").is_err());
    assert!(parse_query("a = 1 b").is_err());
    assert!(parse_query("").is_err());
    assert!(parse_query("< 3").is_err());
}

#[test]
fn test_query_eval() {
    assert_eq!(users_matching("cpu > 10"), vec!["ann", "bob"]);
    assert_eq!(users_matching("Samples >= 10 and not zombie = true"), vec!["ann", "cat"]);
    assert_eq!(users_matching("user =~ /^a/ or duration > 1h"), vec!["ann", "cat"]);
    assert_eq!(users_matching("~(cpu < 100)"), vec!["bob"]);
    assert_eq!(users_matching("start < 2024-11-04"), vec!["bob"]);
    assert_eq!(users_matching("start >= '2024-11-04T10:00'"), vec!["ann", "cat"]);
    assert_eq!(users_matching("gpus = \"0,2\""), vec!["ann"]);
    assert_eq!(users_matching("gpus = unknown or gpus = none"), vec!["bob", "cat"]);
    assert_eq!(users_matching("user = bob or user = ann and cpu > 100"), vec!["bob"]);
    assert_eq!(users_matching("duration = 60"), vec!["bob"]);
    assert_eq!(users_matching("zombie = yes"), vec!["bob"]);
    assert_eq!(users_matching("user != bob"), vec!["ann", "cat"]);
    assert_eq!(users_matching("!(cpu < 100)"), vec!["bob"]);
    assert_eq!(users_matching("user =? ca"), vec!["cat"]);
    assert_eq!(users_matching("user=?a or samples!=40"), vec!["ann", "bob"]);

    let fields = row_fields();
    assert!(compile_query(&fields, "nosuch = 1").is_err());
    assert!(compile_query(&fields, "samples = abc").is_err());
    assert!(compile_query(&fields, "samples = -1").is_err());
    assert!(compile_query(&fields, "start > yesterday").is_err());
    assert!(compile_query(&fields, "user =~ /(/").is_err());
}

#[test]
fn test_select_fields() {
    let fields = row_fields();
    let aliases = [("default", "user,cpu"), ("time", "start,duration"), ("std", "default,time")];
    let names = |p: &Projection<Row>| p.fields.iter().map(|f| f.name).collect::<Vec<&str>>();

    let p = select_fields(&fields, &aliases, "default,csv,tag:x").unwrap();
    assert_eq!(names(&p), vec!["user", "cpu"]);
    assert_eq!(p.controls, vec!["csv", "tag:x"]);

    let p = select_fields(&fields, &aliases, "all").unwrap();
    assert!(p.fields.len() == fields.len());

    let p = select_fields(&fields, &aliases, "time,SAMPLES").unwrap();
    assert_eq!(names(&p), vec!["start", "duration", "samples"]);

    let p = select_fields(&fields, &aliases, "std").unwrap();
    assert_eq!(names(&p), vec!["user", "cpu", "start", "duration"]);

    assert!(select_fields(&fields, &aliases, "user,bogus").is_err());
    assert!(select_fields(&fields, &aliases, "csv,noheader").is_err());
}

#[test]
fn test_sort_rows() {
    let fields = row_fields();
    let users = |rs: &[Row]| rs.iter().map(|r| r.user.as_str()).collect::<Vec<&str>>().join(",");

    let mut rs = rows();
    sort_rows(&mut rs, &parse_sort_keys(&fields, "zombie,cpu:desc").unwrap());
    assert_eq!(users(&rs), "ann,cat,bob");

    // Stable on ties.
    let mut rs = rows();
    sort_rows(&mut rs, &parse_sort_keys(&fields, "zombie").unwrap());
    assert_eq!(users(&rs), "ann,cat,bob");

    let mut rs = rows();
    sort_rows(&mut rs, &parse_sort_keys(&fields, "start:desc").unwrap());
    assert_eq!(users(&rs), "cat,ann,bob");

    assert!(parse_sort_keys(&fields, "cpu:up").is_err());
    assert!(parse_sort_keys(&fields, "nosuch").is_err());
}

#[test]
fn test_record_filter() {
    let mk = |host: &str, user: &str, cmd: &str, job: u32, day: u32| {
        let mut s = crate::sample::empty_sample(timestamp_from_ymd(2024, 11, day), intern(host));
        s.user = intern(user);
        s.command = intern(cmd);
        s.job_id = job;
        s
    };
    let xs = vec![
        mk("c1-1", "ann", "python", 1, 3),
        mk("c1-2", "bob", "bash", 2, 4),
        mk("gpu-1", "ann", "python", 3, 5),
        mk("c1-3", "root", "sshd", 0, 4),
    ];
    let pick = |f: RecordFilter| {
        let f = f.compile();
        xs.iter()
            .filter(|s| f(s))
            .map(|s| s.job_id)
            .collect::<Vec<u32>>()
    };

    assert_eq!(pick(RecordFilter::default()), vec![1, 2, 3, 0]);
    assert_eq!(
        pick(RecordFilter {
            hosts: Some(HostGlobber::from_multi_pattern(false, "c1-[1-2]").unwrap()),
            ..Default::default()
        }),
        vec![1, 2]
    );
    assert_eq!(
        pick(RecordFilter {
            from: Some(timestamp_from_ymd(2024, 11, 4)),
            to: Some(timestamp_from_ymd(2024, 11, 4)),
            exclude_users: HashSet::from(["root".to_string()]),
            ..Default::default()
        }),
        vec![2]
    );
    assert_eq!(
        pick(RecordFilter {
            users: HashSet::from(["ann".to_string()]),
            exclude_commands: HashSet::from(["bash".to_string()]),
            job_ids: HashSet::from([3]),
            ..Default::default()
        }),
        vec![3]
    );
    assert_eq!(
        pick(RecordFilter {
            commands: HashSet::from(["bash".to_string(), "sshd".to_string()]),
            ..Default::default()
        }),
        vec![2, 0]
    );
}
