/// Process-wide interned strings for host names, user names, commands and other highly repetitive
/// record fields.
///
/// A `Sym` pairs a small integer id with the interned text.  Ids are handed out in increasing
/// order starting at 1; id 0 is the empty string and is also the "unset" value.  The table only
/// grows, so an id is stable for the life of the process.  Equality and hashing use the id;
/// ordering uses the text, so sorting by a `Sym` is sorting by name.
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{OnceLock, RwLock};
use ustr::Ustr;

#[derive(Clone, Copy)]
pub struct Sym {
    id: u32,
    s: Ustr,
}

struct Table {
    ids: HashMap<Ustr, u32>,
    names: Vec<Ustr>,
}

pub struct Interner {
    table: RwLock<Table>,
}

static INTERNER: OnceLock<Interner> = OnceLock::new();

impl Interner {
    fn new() -> Interner {
        let empty = Ustr::from("");
        let mut ids = HashMap::new();
        ids.insert(empty, 0);
        Interner {
            table: RwLock::new(Table {
                ids,
                names: vec![empty],
            }),
        }
    }

    pub fn global() -> &'static Interner {
        INTERNER.get_or_init(Interner::new)
    }

    pub fn intern(&self, s: &str) -> Sym {
        if s.is_empty() {
            return Sym::empty();
        }
        let u = Ustr::from(s);
        {
            let t = self.table.read().unwrap_or_else(|e| e.into_inner());
            if let Some(id) = t.ids.get(&u) {
                return Sym { id: *id, s: u };
            }
        }
        let mut t = self.table.write().unwrap_or_else(|e| e.into_inner());
        // Someone may have beaten us to it between the locks.
        if let Some(id) = t.ids.get(&u) {
            return Sym { id: *id, s: u };
        }
        let id = t.names.len() as u32;
        t.names.push(u);
        t.ids.insert(u, id);
        Sym { id, s: u }
    }

    pub fn lookup(&self, id: u32) -> Option<Sym> {
        let t = self.table.read().unwrap_or_else(|e| e.into_inner());
        t.names.get(id as usize).map(|s| Sym { id, s: *s })
    }

    /// Number of ids allocated, including the empty id.
    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(|e| e.into_inner()).names.len()
    }
}

/// Intern `s` in the process-wide table.

pub fn intern(s: &str) -> Sym {
    Interner::global().intern(s)
}

pub fn lookup(id: u32) -> Option<Sym> {
    Interner::global().lookup(id)
}

impl Sym {
    pub const EMPTY_ID: u32 = 0;

    pub fn empty() -> Sym {
        Sym {
            id: Sym::EMPTY_ID,
            s: Ustr::from(""),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn as_str(&self) -> &'static str {
        self.s.as_str()
    }

    pub fn as_ustr(&self) -> Ustr {
        self.s
    }

    pub fn is_empty(&self) -> bool {
        self.id == Sym::EMPTY_ID
    }
}

impl Default for Sym {
    fn default() -> Sym {
        Sym::empty()
    }
}

impl From<&str> for Sym {
    fn from(s: &str) -> Sym {
        intern(s)
    }
}

impl PartialEq for Sym {
    fn eq(&self, other: &Sym) -> bool {
        self.id == other.id
    }
}

impl Eq for Sym {}

impl Hash for Sym {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialOrd for Sym {
    fn partial_cmp(&self, other: &Sym) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sym {
    fn cmp(&self, other: &Sym) -> Ordering {
        if self.id == other.id {
            Ordering::Equal
        } else {
            self.as_str().cmp(other.as_str())
        }
    }
}

impl PartialEq<&str> for Sym {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.as_str(), self.id)
    }
}

#[test]
fn test_intern_basics() {
    let a = intern("ml1.hpc.uio.no");
    let b = intern("ml1.hpc.uio.no");
    let c = intern("ml2.hpc.uio.no");
    assert!(a == b);
    assert!(a.id() == b.id());
    assert!(a != c);
    assert!(a.id() != 0);
    assert!(a < c);
    assert!(a == "ml1.hpc.uio.no");
    assert!(lookup(a.id()).unwrap() == a);
    assert!(lookup(Sym::EMPTY_ID).unwrap().as_str() == "");
    assert!(intern("").is_empty());
    assert!(Sym::default() == intern(""));
    assert!(lookup(u32::MAX).is_none());
}

#[test]
fn test_intern_monotonic() {
    let x = intern("test_intern_monotonic_x");
    let y = intern("test_intern_monotonic_y");
    assert!(y.id() > x.id());
    assert!(Interner::global().len() > y.id() as usize);
}

#[test]
fn test_intern_concurrent() {
    let names = (0..50)
        .map(|i| format!("test_intern_concurrent_{i}"))
        .collect::<Vec<String>>();
    let names = &names;
    let ids = std::thread::scope(|s| {
        let handles = (0..4)
            .map(|_| {
                s.spawn(move || {
                    names
                        .iter()
                        .map(|n| intern(n).id())
                        .collect::<Vec<u32>>()
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<Vec<u32>>>()
    });
    for v in &ids[1..] {
        assert!(*v == ids[0]);
    }
}
