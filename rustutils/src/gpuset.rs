/// The GpuSet has three states:
///
///  - the set is known to be empty, this is Some(0)
///  - the set is known to be nonempty and have only known gpus in the set, this is Some(bits)
///  - the set is known to be nonempty but have (some) unknown members, this is None
///
/// Once a set has become unknown it stays unknown under union.  There is no representation for
/// some known + some unknown GPUs.
///
/// Samples are numerous, so the set is a bitmap and not a HashSet.  Card indices are limited to
/// 0..MAX_GPUS; a set with a card beyond that is unknown.

pub type GpuSet = Option<u64>;

pub const MAX_GPUS: u32 = 64;

pub fn empty_gpuset() -> GpuSet {
    Some(0)
}

pub fn is_empty_gpuset(s: &GpuSet) -> bool {
    *s == Some(0)
}

pub fn unknown_gpuset() -> GpuSet {
    None
}

pub fn is_unknown_gpuset(s: &GpuSet) -> bool {
    s.is_none()
}

pub fn singleton_gpuset(maybe_device: Option<u32>) -> GpuSet {
    match maybe_device {
        Some(dev) if dev < MAX_GPUS => Some(1 << dev),
        _ => None,
    }
}

pub fn adjoin_gpuset(lhs: &mut GpuSet, rhs: u32) {
    match lhs {
        Some(gpus) if rhs < MAX_GPUS => *gpus |= 1 << rhs,
        Some(_) => *lhs = None,
        None => {}
    }
}

pub fn union_gpuset(lhs: &mut GpuSet, rhs: &GpuSet) {
    match rhs {
        Some(r) => {
            if let Some(l) = lhs {
                *l |= r
            }
        }
        None => *lhs = None,
    }
}

/// The card indices in ascending order; empty for both the empty and the unknown set.

pub fn gpuset_cards(gpus: &GpuSet) -> Vec<u32> {
    match gpus {
        Some(bits) => (0..MAX_GPUS).filter(|i| bits & (1 << i) != 0).collect(),
        None => vec![],
    }
}

/// "unknown", "none", or the card indices in ascending order joined by `sep`.

pub fn gpuset_to_string_with(gpus: &GpuSet, sep: &str) -> String {
    match gpus {
        None => "unknown".to_string(),
        Some(0) => "none".to_string(),
        Some(_) => gpuset_cards(gpus)
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<String>>()
            .join(sep),
    }
}

pub fn gpuset_to_string(gpus: &GpuSet) -> String {
    gpuset_to_string_with(gpus, ",")
}

// The bool return value is "failed".  The list separator is `;` on the wire but older data use
// `,` inside a quoted field, so accept both.  A card index too large for the set makes the set
// unknown, it is not a failure.

pub fn gpuset_from_list(s: &str) -> (Option<GpuSet>, bool) {
    match s {
        "unknown" => (Some(unknown_gpuset()), false),
        "none" => (Some(empty_gpuset()), false),
        _ => {
            let mut set = empty_gpuset();
            for v in s.split(|c: char| c == ';' || c == ',') {
                match v.parse::<u32>() {
                    Ok(n) => adjoin_gpuset(&mut set, n),
                    Err(_) => return (None, true),
                }
            }
            (Some(set), false)
        }
    }
}

#[test]
fn test_gpuset() {
    assert!(is_empty_gpuset(&empty_gpuset()));
    assert!(!is_empty_gpuset(&unknown_gpuset()));
    assert!(!is_empty_gpuset(&singleton_gpuset(Some(1))));
    let mut s = unknown_gpuset();
    adjoin_gpuset(&mut s, 1);
    assert!(is_unknown_gpuset(&s));

    let mut u = singleton_gpuset(Some(3));
    union_gpuset(&mut u, &singleton_gpuset(Some(0)));
    assert!(gpuset_cards(&u) == vec![0, 3]);
    union_gpuset(&mut u, &unknown_gpuset());
    assert!(is_unknown_gpuset(&u));

    let mut big = singleton_gpuset(Some(2));
    adjoin_gpuset(&mut big, MAX_GPUS);
    assert!(is_unknown_gpuset(&big));
    assert!(is_unknown_gpuset(&singleton_gpuset(Some(MAX_GPUS))));
}

#[test]
fn test_gpuset_wire_form() {
    assert!(gpuset_from_list("unknownx") == (None, true));
    assert!(gpuset_from_list("unknown") == (Some(unknown_gpuset()), false));
    assert!(gpuset_from_list("none") == (Some(empty_gpuset()), false));
    assert!(gpuset_from_list("1;1;1") == (Some(singleton_gpuset(Some(1))), false));
    assert!(gpuset_from_list("") == (None, true));
    assert!(gpuset_from_list("x") == (None, true));
    let (s, failed) = gpuset_from_list("40;63");
    assert!(!failed);
    assert!(gpuset_cards(&s.unwrap()) == vec![40, 63]);
    assert!(gpuset_from_list("3;64") == (Some(unknown_gpuset()), false));
    let (s, failed) = gpuset_from_list("2;1");
    assert!(!failed);
    assert!(gpuset_to_string_with(&s.unwrap(), ";") == "1;2");
    let (s, _) = gpuset_from_list("5,4");
    assert!(gpuset_to_string(&s.unwrap()) == "4,5");
}
