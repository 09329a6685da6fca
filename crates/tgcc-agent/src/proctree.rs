//! Process-tree inspection for hang detection.
//!
//! The only question the supervisor ever asks is "does any descendant of
//! this pid exist" — a hung CLI has none, a CLI running a long Bash tool
//! has at least one. Answered with a single `/proc` scan; no external
//! `pgrep` dependency.

use std::collections::HashMap;

/// Return `true` if any live process is a descendant of `root`.
pub fn has_descendants(root: u32) -> bool {
    descendant_count(root) > 0
}

/// Count live descendants of `root` (children, grandchildren, …).
pub fn descendant_count(root: u32) -> usize {
    let parents = parent_map();
    let mut count = 0;
    for pid in parents.keys() {
        let mut cursor = *pid;
        // Walk up the ancestry chain; depth-bounded against ppid cycles
        // from pid reuse mid-scan.
        for _ in 0..64 {
            let Some(&ppid) = parents.get(&cursor) else {
                break;
            };
            if ppid == root {
                count += 1;
                break;
            }
            if ppid <= 1 {
                break;
            }
            cursor = ppid;
        }
    }
    count
}

/// Snapshot of pid → ppid for every live process, from `/proc/*/stat`.
fn parent_map() -> HashMap<u32, u32> {
    let mut map = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return map;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_ppid(&stat) {
            map.insert(pid, ppid);
        }
    }
    map
}

/// Field 4 of `/proc/<pid>/stat`, scanning past the parenthesised comm
/// (which may itself contain spaces and parentheses).
fn parse_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppid_parses_past_hostile_comm() {
        let stat = "1234 (a b) c) R 77 1234 1234 0 -1";
        assert_eq!(parse_ppid(stat), Some(77));
    }

    #[test]
    fn ppid_none_on_garbage() {
        assert_eq!(parse_ppid("not a stat line"), None);
    }

    #[test]
    fn own_children_are_visible() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");

        assert!(has_descendants(std::process::id()));

        child.kill().expect("kill sleep");
        child.wait().expect("reap sleep");
    }

    #[test]
    fn leaf_process_has_no_descendants() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();

        assert_eq!(descendant_count(pid), 0);

        child.kill().expect("kill sleep");
        child.wait().expect("reap sleep");
    }
}
