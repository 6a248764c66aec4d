/// Deduction of CPU time that a process inherits from children that ran in another job.
///
/// A process's `cputime_sec` includes the time of every child it has waited for.  When a child
/// belongs to a different job than its parent (typically a process launched by a job-submission
/// wrapper), that time is not the parent's job's work, so once the child is gone its cumulative
/// time is subtracted from all later readings of the parent.
///
/// Within one job, deductions propagate up the tree unchanged: if a process that dies had itself
/// accumulated a deduction from its own foreign children, the same amount is deducted from its
/// parent.  Across a job boundary the deductible amount is the child's raw cumulative time at its
/// last observation, which covers the child and everything it waited for.
///
/// A process is considered dead at its last observation if the host was observed later than that.
/// Deaths are handled in ascending time order, and at equal times in postorder of the process tree
/// so that a child is handled before its parent.
///
/// All of this is per host; pids are not meaningful across hosts.
use crate::sample::Sample;

use rustutils::Timestamp;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

struct Process {
    ppid: u32,
    job_id: u32,
    // Indices of the process's samples, ascending by time.
    samples: Vec<usize>,
    last_seen: Timestamp,
    last_cputime: f64,
    label: usize,
    // Amount deducted so far, propagated to a same-job parent.
    deducted: f64,
    // (time, amount): subtract amount from readings strictly after time.
    events: Vec<(Timestamp, f64)>,
}

/// Adjust `cputime_sec` of the samples of one host in place.  Samples for pid 0 are left alone.
/// Adjusted values are clamped at zero.  Returns the number of deductions applied.

pub fn deduct_foreign_children(samples: &mut [Box<Sample>]) -> usize {
    let Some(host_latest) = samples.iter().map(|s| s.timestamp).max() else {
        return 0;
    };

    let mut procs: HashMap<u32, Process> = HashMap::new();
    for (ix, s) in samples.iter().enumerate() {
        if s.pid == 0 {
            continue;
        }
        let p = procs.entry(s.pid).or_insert_with(|| Process {
            ppid: s.ppid,
            job_id: s.job_id,
            samples: vec![],
            last_seen: s.timestamp,
            last_cputime: s.cputime_sec,
            label: 0,
            deducted: 0.0,
            events: vec![],
        });
        p.samples.push(ix);
        if s.timestamp >= p.last_seen {
            p.last_seen = s.timestamp;
            p.last_cputime = s.cputime_sec;
            p.ppid = s.ppid;
            p.job_id = s.job_id;
        }
    }
    if procs.len() < 2 {
        return 0;
    }

    assign_postorder_labels(&mut procs);

    let mut deaths = BinaryHeap::new();
    for (pid, p) in procs.iter() {
        if p.last_seen < host_latest && p.ppid != *pid && procs.contains_key(&p.ppid) {
            deaths.push(Reverse((p.last_seen, p.label, *pid)));
        }
    }

    let mut applied = 0;
    while let Some(Reverse((died, _, pid))) = deaths.pop() {
        let (ppid, amount) = {
            let child = &procs[&pid];
            let parent = &procs[&child.ppid];
            let amount = if child.job_id == parent.job_id {
                child.deducted
            } else {
                child.last_cputime
            };
            (child.ppid, amount)
        };
        if amount > 0.0 {
            if let Some(parent) = procs.get_mut(&ppid) {
                parent.deducted += amount;
                parent.events.push((died, amount));
                applied += 1;
            }
        }
    }

    for p in procs.values_mut() {
        if p.events.is_empty() {
            continue;
        }
        p.samples.sort_by_key(|ix| samples[*ix].timestamp);
        // Events were recorded in time order, so one sweep suffices.
        let mut next = 0;
        let mut total = 0.0;
        for ix in p.samples.iter() {
            let s = &mut samples[*ix];
            while next < p.events.len() && p.events[next].0 < s.timestamp {
                total += p.events[next].1;
                next += 1;
            }
            if total > 0.0 {
                s.cputime_sec = (s.cputime_sec - total).max(0.0);
            }
        }
    }

    applied
}

// Children are visited in pid order, and roots (processes whose parent was not observed) too, so
// the labeling is deterministic.  Stale ppids can make the graph cyclic; every process is labeled
// exactly once regardless.

fn assign_postorder_labels(procs: &mut HashMap<u32, Process>) {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut roots = vec![];
    for (pid, p) in procs.iter() {
        if p.ppid != *pid && procs.contains_key(&p.ppid) {
            children.entry(p.ppid).or_default().push(*pid);
        } else {
            roots.push(*pid);
        }
    }
    for v in children.values_mut() {
        v.sort();
    }
    roots.sort();
    // Processes that are only reachable through a cycle get visited after the real roots.
    let mut rest = procs.keys().copied().collect::<Vec<u32>>();
    rest.sort();
    roots.extend(rest);

    let mut visited = HashSet::new();
    let mut label = 0;
    for root in roots {
        if !visited.insert(root) {
            continue;
        }
        // (pid, index of next child to visit)
        let mut stack = vec![(root, 0usize)];
        while let Some((pid, next)) = stack.pop() {
            let kids = children.get(&pid).map(|v| v.as_slice()).unwrap_or(&[]);
            if let Some(kid) = kids.get(next) {
                stack.push((pid, next + 1));
                if visited.insert(*kid) {
                    stack.push((*kid, 0));
                }
            } else if let Some(p) = procs.get_mut(&pid) {
                p.label = label;
                label += 1;
            }
        }
    }
}

#[cfg(test)]
use crate::intern::intern;

#[cfg(test)]
fn proc_sample(t: i64, pid: u32, ppid: u32, job: u32, cputime: f64) -> Box<Sample> {
    let mut s = crate::sample::empty_sample(
        rustutils::timestamp_from_seconds(t).unwrap(),
        intern("h1"),
    );
    s.pid = pid;
    s.ppid = ppid;
    s.job_id = job;
    s.cputime_sec = cputime;
    s
}

#[test]
fn test_deduct_across_job_boundary() {
    // 10 (job 1) -> 20 (job 1) -> 30 (job 2).  30 is last seen at 200, 20 lives on.
    let mut xs = vec![
        proc_sample(100, 10, 1, 1, 5.0),
        proc_sample(100, 20, 10, 1, 50.0),
        proc_sample(100, 30, 20, 2, 10.0),
        proc_sample(200, 10, 1, 1, 6.0),
        proc_sample(200, 20, 10, 1, 100.0),
        proc_sample(200, 30, 20, 2, 60.0),
        proc_sample(250, 10, 1, 1, 7.0),
        proc_sample(250, 20, 10, 1, 200.0),
    ];
    assert_eq!(deduct_foreign_children(&mut xs), 1);
    // Readings at or before the death are untouched.
    assert!(xs[1].cputime_sec == 50.0);
    assert!(xs[4].cputime_sec == 100.0);
    assert!(xs[7].cputime_sec == 140.0);
    // 20 and 10 are in the same job and nothing has died under 20 from 10's point of view yet.
    assert!(xs[6].cputime_sec == 7.0);
}

#[test]
fn test_deduct_propagates_within_job() {
    // 10 (job 1) -> 20 (job 1) -> 30 (job 2).  30 dies at 200, 20 dies at 300, 10 lives on.
    let mut xs = vec![
        proc_sample(100, 10, 1, 1, 1.0),
        proc_sample(100, 20, 10, 1, 10.0),
        proc_sample(100, 30, 20, 2, 40.0),
        proc_sample(200, 30, 20, 2, 60.0),
        proc_sample(200, 20, 10, 1, 20.0),
        proc_sample(300, 20, 10, 1, 90.0),
        proc_sample(400, 10, 1, 1, 100.0),
    ];
    assert_eq!(deduct_foreign_children(&mut xs), 2);
    assert!(xs[5].cputime_sec == 30.0);
    // 10 inherits 20's deduction of 60 once 20 is gone.
    assert!(xs[6].cputime_sec == 40.0);
    assert!(xs[0].cputime_sec == 1.0);
}

#[test]
fn test_deduct_same_time_postorder() {
    // A foreign child and its parent are last seen at the same time, the grandparent lives on.
    let mut xs = vec![
        proc_sample(100, 10, 1, 1, 1.0),
        proc_sample(100, 20, 10, 1, 10.0),
        proc_sample(100, 30, 20, 1, 30.0),
        proc_sample(200, 10, 1, 1, 5.0),
        proc_sample(200, 20, 10, 1, 12.0),
        proc_sample(200, 30, 20, 2, 50.0),
        proc_sample(300, 10, 1, 1, 100.0),
    ];
    // 30 last seen in job 2, so 20 gets 50 deducted; that deduction reaches 10 only because 30 is
    // handled before 20 at t=200.
    deduct_foreign_children(&mut xs);
    assert!(xs[6].cputime_sec == 50.0);
}

#[test]
fn test_deduct_clamps_and_ignores_unknown() {
    let mut xs = vec![
        proc_sample(100, 20, 10, 1, 1.0),
        proc_sample(100, 30, 20, 2, 60.0),
        proc_sample(200, 20, 10, 1, 5.0),
        proc_sample(200, 0, 0, 3, 5.0),
    ];
    deduct_foreign_children(&mut xs);
    assert!(xs[2].cputime_sec == 0.0);
    assert!(xs[3].cputime_sec == 5.0);

    let mut empty: Vec<Box<Sample>> = vec![];
    assert_eq!(deduct_foreign_children(&mut empty), 0);

    // A cycle through stale ppids does not hang or deduct.
    let mut cyc = vec![
        proc_sample(100, 20, 30, 1, 1.0),
        proc_sample(100, 30, 20, 1, 1.0),
        proc_sample(200, 20, 30, 1, 2.0),
    ];
    deduct_foreign_children(&mut cyc);
    assert!(cyc[2].cputime_sec == 2.0);
}
