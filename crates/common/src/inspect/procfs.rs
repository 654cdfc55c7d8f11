//! Linux occupier lookup through `/proc`.
#![cfg_attr(not(target_os = "linux"), allow(dead_code))]

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;

use super::{InspectError, Occupier};

const TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];
const TCP_LISTEN: &str = "0A";

pub(super) fn find_occupier(port: u16) -> Result<Option<Occupier>, InspectError> {
    let mut inodes = Vec::new();
    let mut read_any = false;
    for table in TCP_TABLES {
        match fs::read_to_string(table) {
            Ok(contents) => {
                read_any = true;
                inodes.extend(listening_inodes(&contents, port));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if !read_any {
        return Err(InspectError::Unsupported("/proc/net/tcp is not mounted"));
    }
    if inodes.is_empty() {
        return Ok(None);
    }

    // Sockets owned by other users are invisible without privileges.
    let Some(pid) = pid_owning(&inodes)? else {
        return Ok(None);
    };
    Ok(Some(Occupier {
        pid,
        process_name: process_name(pid),
        port,
    }))
}

/// Socket inodes in LISTEN state on `port`, from the text of a `/proc/net/tcp*` table.
///
/// Row layout: `sl local_address rem_address st tx:rx tr:when retrnsmt uid timeout inode ...`
/// with addresses as `HEXADDR:HEXPORT`.
pub(super) fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            if u16::from_str_radix(port_hex, 16).ok()? != port {
                return None;
            }
            let inode = fields[9].parse::<u64>().ok()?;
            (inode != 0).then_some(inode)
        })
        .collect()
}

fn pid_owning(inodes: &[u64]) -> Result<Option<u32>, InspectError> {
    let targets: HashSet<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();

    for entry in fs::read_dir("/proc")?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = fs::read_link(fd.path()) {
                if targets.contains(link.to_string_lossy().as_ref()) {
                    return Ok(Some(pid));
                }
            }
        }
    }
    Ok(None)
}

fn process_name(pid: u32) -> String {
    fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
