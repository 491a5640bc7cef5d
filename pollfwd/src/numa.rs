//! NUMA topology lookups from sysfs.
//!
//! Only the little the forwarder needs: which socket a CPU belongs to, and whether a
//! socket exists. Machines without `/sys/devices/system/node` are treated as a single
//! socket 0.

use std::fs;
use std::io;
use std::path::Path;

/// Socket id meaning "no preference".
pub const SOCKET_ID_ANY: i32 = -1;

const NODE_ROOT: &str = "/sys/devices/system/node";
const CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Returns true if `socket_id` names an online NUMA node, or if it is `SOCKET_ID_ANY`.
pub fn node_online(socket_id: i32) -> bool {
    if socket_id == SOCKET_ID_ANY {
        return true;
    }
    if socket_id < 0 {
        return false;
    }
    let root = Path::new(NODE_ROOT);
    if !root.exists() {
        return socket_id == 0;
    }
    root.join(format!("node{socket_id}")).exists()
}

/// Socket of a CPU, 0 when the topology is not exposed.
pub fn cpu_socket_id(cpu: usize) -> i32 {
    let dir = Path::new(CPU_ROOT).join(format!("cpu{cpu}"));
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("node"))
                .and_then(|id| id.parse::<i32>().ok())
        })
        .next()
        .unwrap_or(0)
}

/// Parses a CPU list such as `0-3,8,10-11`.
///
/// Entries keep the order they were given in; duplicates are an error.
pub fn parse_cpu_list(list: &str) -> io::Result<Vec<usize>> {
    let invalid = |what: &str| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid cpu list '{list}': {what}"),
        )
    };
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim) {
        if part.is_empty() {
            return Err(invalid("empty entry"));
        }
        let (first, last) = match part.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (part, part),
        };
        let first: usize = first.parse().map_err(|_| invalid(part))?;
        let last: usize = last.parse().map_err(|_| invalid(part))?;
        if last < first {
            return Err(invalid(part));
        }
        for cpu in first..=last {
            if cpus.contains(&cpu) {
                return Err(invalid(&format!("cpu {cpu} listed twice")));
            }
            cpus.push(cpu);
        }
    }
    Ok(cpus)
}
