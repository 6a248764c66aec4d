/// Generic formatting of rows as aligned columns, csv, json or awk, from a projection of typed
/// fields.  Except for json the output may have a header, and csv fields may be named.
use anyhow::Result;
use csv;
use json;
use sonardb::{compile_query, parse_sort_keys, select_fields, sort_rows};
use sonardb::{Field, Predicate, SortKey, Value, CONTROL_WORDS};
use std::io;

/// The output side of a view: the projection and format from --fmt, the row predicate from
/// --query and the sort keys from --sort.  Building it checks all three, so it is done before
/// any data are read.

pub struct Report<'a, T> {
    pub fields: Vec<&'a Field<T>>,
    pub opts: FormatOptions,
    predicate: Option<Predicate<T>>,
    sort_keys: Vec<SortKey<T>>,
}

impl<'a, T: 'static> Report<'a, T> {
    pub fn new(
        fields: &'a [Field<T>],
        aliases: &[(&str, &str)],
        defaults: &str,
        fmt: Option<&str>,
        query: Option<&str>,
        sort: Option<&str>,
    ) -> Result<Report<'a, T>> {
        let projection = select_fields(fields, aliases, fmt.unwrap_or(defaults))?;
        let predicate = match query {
            Some(q) => Some(compile_query(fields, q)?),
            None => None,
        };
        let sort_keys = match sort {
            Some(s) => parse_sort_keys(fields, s)?,
            None => vec![],
        };
        Ok(Report {
            fields: projection.fields,
            opts: standard_options(&projection.controls),
            predicate,
            sort_keys,
        })
    }

    /// Headerless unnamed csv unless a format was requested.
    pub fn default_to_csv(&mut self) {
        let o = &mut self.opts;
        if !o.fixed && !o.csv && !o.json && !o.awk {
            o.csv = true;
            o.header = false;
        }
    }

    /// Keep the rows the predicate accepts, in order.
    pub fn select(&self, mut rows: Vec<T>) -> Vec<T> {
        if let Some(ref p) = self.predicate {
            rows.retain(|r| p(r));
        }
        rows
    }

    pub fn sort(&self, rows: &mut [T]) {
        if !self.sort_keys.is_empty() {
            sort_rows(rows, &self.sort_keys);
        }
    }

    pub fn print(&self, output: &mut dyn io::Write, rows: &[T]) {
        format_data(output, &self.fields, &self.opts, rows)
    }
}

/// Print help for `--fmt=help` and return true, or return false if help was not requested.

pub fn maybe_help<T>(
    fmt: &Option<String>,
    fields: &[Field<T>],
    aliases: &[(&str, &str)],
    defaults: &str,
) -> bool {
    match fmt {
        Some(s) if s.starts_with("help") => {
            print!("{}", help_text(fields, aliases, defaults));
            true
        }
        _ => false,
    }
}

fn help_text<T>(fields: &[Field<T>], aliases: &[(&str, &str)], defaults: &str) -> String {
    let mut s = "Syntax:\n  --fmt=(field|alias|control),...\n\nFields:\n".to_string();
    let w = fields.iter().map(|f| f.name.len()).max().unwrap_or(0);
    let mut names = fields.iter().map(|f| (f.name, f.help)).collect::<Vec<_>>();
    names.sort();
    for (name, help) in names {
        s += format!("  {name:w$}  {help}\n").as_str();
    }
    if !aliases.is_empty() {
        s += "\nAliases:\n";
        let mut aliases = aliases.to_vec();
        aliases.sort();
        for (name, expansion) in aliases {
            s += format!("  {name} --> {expansion}\n").as_str();
        }
    }
    s += format!("\nDefaults:\n  {defaults}\n\nControl:\n").as_str();
    for c in CONTROL_WORDS {
        s += format!("  {c}\n").as_str();
    }
    s += "  tag:<tagvalue>\n";
    s
}

#[derive(Debug, Default, PartialEq)]
pub struct FormatOptions {
    pub tag: Option<String>,
    pub json: bool,       // json explicitly requested
    pub csv: bool,        // csv or csvnamed explicitly requested
    pub awk: bool,        // awk explicitly requested
    pub fixed: bool,      // fixed output explicitly requested
    pub named: bool,      // csvnamed explicitly requested
    pub header: bool,     // true if nothing requested b/c fixed+header is default
    pub nodefaults: bool, // leave out zero and empty values
}

/// Interpret the control words of a projection.  csv wins over json, which wins over awk.

pub fn standard_options(controls: &[String]) -> FormatOptions {
    let has = |w: &str| controls.iter().any(|c| c == w);
    let named = has("csvnamed");
    let csv = has("csv") || named;
    let json = has("json") && !csv;
    let awk = has("awk") && !csv && !json;
    let fixed = has("fixed") && !csv && !json && !awk;
    // json and awk get no header, even if one is requested
    let header = (!csv && !json && !awk && !has("noheader")) || (csv && has("header"));
    let tag = controls
        .iter()
        .find_map(|c| c.strip_prefix("tag:"))
        .map(|t| t.to_string());
    FormatOptions {
        tag,
        json,
        csv,
        awk,
        fixed,
        named,
        header,
        nodefaults: has("nodefaults"),
    }
}

// One printed cell.  `None` is a default value that `nodefaults` leaves out.
type Cell = Option<String>;

/// Apply `fields` to each of `data` and print the result in the format given by `opts`.  Write
/// errors are ignored, they are common for broken pipelines.

pub fn format_data<T>(
    output: &mut dyn io::Write,
    fields: &[&Field<T>],
    opts: &FormatOptions,
    data: &[T],
) {
    let names = fields.iter().map(|f| f.name).collect::<Vec<&str>>();
    let rows = data
        .iter()
        .map(|x| {
            fields
                .iter()
                .map(|f| render((f.get)(x), opts.nodefaults))
                .collect::<Vec<Cell>>()
        })
        .collect::<Vec<Vec<Cell>>>();

    let _ = if opts.csv {
        format_csv(output, &names, opts, rows)
    } else if opts.json {
        format_json(output, &names, opts, rows)
    } else if opts.awk {
        format_awk(output, opts, rows)
    } else {
        format_fixed_width(output, &names, opts, rows)
    };
}

fn render(v: Value, nodefaults: bool) -> Cell {
    if nodefaults && v.is_default() {
        None
    } else {
        Some(v.to_string())
    }
}

fn format_fixed_width(
    output: &mut dyn io::Write,
    names: &[&str],
    opts: &FormatOptions,
    rows: Vec<Vec<Cell>>,
) -> Result<()> {
    // The column width is the max across all the entries in the column, including the header if
    // present.  A tag goes in an extra last column.
    let mut header = names.iter().map(|n| n.to_string()).collect::<Vec<String>>();
    let mut body = rows
        .into_iter()
        .map(|r| r.into_iter().map(|c| c.unwrap_or_default()).collect())
        .collect::<Vec<Vec<String>>>();
    if let Some(ref tag) = opts.tag {
        header.push("tag".to_string());
        for r in body.iter_mut() {
            r.push(tag.clone());
        }
    }

    let mut widths = vec![0; header.len()];
    if opts.header {
        for (w, h) in widths.iter_mut().zip(header.iter()) {
            *w = h.len();
        }
    }
    for r in &body {
        for (w, c) in widths.iter_mut().zip(r.iter()) {
            *w = usize::max(*w, c.len());
        }
    }

    let mut emit = |cells: &[String]| -> Result<()> {
        let mut s = String::new();
        for (c, w) in cells.iter().zip(widths.iter().copied()) {
            s += format!("{c:w$}  ").as_str();
        }
        output.write_all(s.trim_end().as_bytes())?;
        output.write_all(b"\n")?;
        Ok(())
    };
    if opts.header {
        emit(&header)?;
    }
    for r in &body {
        emit(r)?;
    }
    Ok(())
}

fn format_csv(
    output: &mut dyn io::Write,
    names: &[&str],
    opts: &FormatOptions,
    rows: Vec<Vec<Cell>>,
) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(output);

    if opts.header {
        let mut out_fields = names.iter().map(|n| n.to_string()).collect::<Vec<String>>();
        if opts.tag.is_some() {
            out_fields.push("tag".to_string());
        }
        writer.write_record(out_fields)?;
    }

    for r in rows {
        let mut out_fields = vec![];
        for (name, cell) in names.iter().zip(r) {
            match cell {
                None => {}
                Some(val) if opts.named => out_fields.push(format!("{name}={val}")),
                Some(val) => out_fields.push(val),
            }
        }
        if let Some(ref tag) = opts.tag {
            if opts.named {
                out_fields.push(format!("tag={tag}"));
            } else {
                out_fields.push(tag.clone());
            }
        }
        writer.write_record(out_fields)?;
    }

    writer.flush()?;
    Ok(())
}

fn format_json(
    output: &mut dyn io::Write,
    names: &[&str],
    opts: &FormatOptions,
    rows: Vec<Vec<Cell>>,
) -> Result<()> {
    let mut objects = vec![];
    for r in rows {
        let mut obj = json::JsonValue::new_object();
        for (name, cell) in names.iter().zip(r) {
            if let Some(val) = cell {
                obj[*name] = val.into();
            }
        }
        if let Some(ref tag) = opts.tag {
            obj["tag"] = tag.clone().into();
        }
        objects.push(obj);
    }
    output.write_all(json::stringify(objects).as_bytes())?;
    output.write_all(b"\n")?;
    Ok(())
}

// awk output: fields are space-separated and spaces within fields are replaced by `_`.

fn format_awk(output: &mut dyn io::Write, opts: &FormatOptions, rows: Vec<Vec<Cell>>) -> Result<()> {
    for r in rows {
        let mut words = r
            .into_iter()
            .flatten()
            .map(|val| val.replace(' ', "_"))
            .collect::<Vec<String>>();
        if let Some(ref tag) = opts.tag {
            words.push(tag.clone());
        }
        output.write_all(words.join(" ").as_bytes())?;
        output.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
use sonardb::FieldKind;

#[cfg(test)]
struct Item {
    name: &'static str,
    count: u64,
}

#[cfg(test)]
fn item_fields() -> Vec<Field<Item>> {
    vec![
        Field {
            name: "name",
            help: "Name of the thing",
            kind: FieldKind::Str,
            get: |x: &Item| Value::Str(x.name.to_string()),
        },
        Field {
            name: "count",
            help: "How many",
            kind: FieldKind::UInt,
            get: |x: &Item| Value::UInt(x.count),
        },
    ]
}

#[cfg(test)]
fn format_items(spec: &str) -> String {
    let fields = item_fields();
    let proj = select_fields(&fields, &[], spec).unwrap();
    let opts = standard_options(&proj.controls);
    let items = vec![
        Item {
            name: "a b",
            count: 10,
        },
        Item {
            name: "longer",
            count: 0,
        },
    ];
    let mut out = vec![];
    format_data(&mut out, &proj.fields, &opts, &items);
    String::from_utf8(out).unwrap()
}

#[test]
fn test_standard_options() {
    let ctl = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<String>>();
    let o = standard_options(&ctl(&[]));
    assert!(o.header && !o.csv && !o.json && !o.awk && o.tag.is_none());
    let o = standard_options(&ctl(&["csvnamed", "json", "tag:x"]));
    assert!(o.csv && o.named && !o.json && !o.header);
    assert_eq!(o.tag, Some("x".to_string()));
    let o = standard_options(&ctl(&["csv", "header"]));
    assert!(o.csv && o.header);
    let o = standard_options(&ctl(&["awk", "header"]));
    assert!(o.awk && !o.header);
    let o = standard_options(&ctl(&["fixed", "noheader", "nodefaults"]));
    assert!(o.fixed && !o.header && o.nodefaults);
}

#[test]
fn test_format_fixed() {
    assert_eq!(
        format_items("name,count"),
        "name    count\na b     10\nlonger  0\n"
    );
    assert_eq!(
        format_items("count,noheader,tag:t"),
        "10  t\n0   t\n"
    );
}

#[test]
fn test_format_csv_awk_json() {
    assert_eq!(format_items("name,count,csv"), "a b,10\nlonger,0\n");
    assert_eq!(
        format_items("name,count,csvnamed,nodefaults"),
        "name=a b,count=10\nname=longer\n"
    );
    assert_eq!(format_items("name,count,awk"), "a_b 10\nlonger 0\n");
    assert_eq!(
        format_items("name,count,json,nodefaults"),
        "[{\"name\":\"a b\",\"count\":\"10\"},{\"name\":\"longer\"}]\n"
    );
}

#[test]
fn test_help_text() {
    let fields = item_fields();
    let s = help_text(&fields, &[("default", "name,count")], "default");
    assert!(s.contains("  count  How many\n"));
    assert!(s.contains("  default --> name,count\n"));
    assert!(s.contains("  tag:<tagvalue>\n"));
}

#[test]
fn test_report() {
    let fields = item_fields();
    assert!(Report::new(&fields, &[], "name", Some("nope"), None, None).is_err());
    assert!(Report::new(&fields, &[], "name", None, Some("count >"), None).is_err());
    assert!(Report::new(&fields, &[], "name", None, None, Some("count:up")).is_err());

    let mut r = Report::new(&fields, &[], "name", None, Some("count < 100"), Some("name:desc"))
        .unwrap();
    assert!(r.opts.header && !r.opts.csv);
    r.default_to_csv();
    assert!(!r.opts.header && r.opts.csv);
    let items = vec![
        Item { name: "a", count: 1 },
        Item { name: "b", count: 1000 },
        Item { name: "c", count: 2 },
    ];
    let mut rows = r.select(items);
    r.sort(&mut rows);
    let mut out = vec![];
    r.print(&mut out, &rows);
    assert_eq!(String::from_utf8(out).unwrap(), "c\na\n");
}
