//! macOS occupier lookup through `lsof`.
#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

use std::process::Command;

use super::{InspectError, Occupier};

pub(super) fn find_occupier(port: u16) -> Result<Option<Occupier>, InspectError> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-F", "pc"])
        .output()
        .map_err(|e| InspectError::Command {
            command: "lsof",
            reason: e.to_string(),
        })?;

    // lsof exits 1 with empty output when nothing matches.
    if !output.status.success() && !output.stdout.is_empty() {
        return Err(InspectError::Command {
            command: "lsof",
            reason: format!("exited with {}", output.status),
        });
    }

    Ok(parse_field_output(&String::from_utf8_lossy(&output.stdout), port))
}

/// First process in `lsof -F pc` output: a `p<pid>` line followed by `c<command>`.
pub(super) fn parse_field_output(stdout: &str, port: u16) -> Option<Occupier> {
    let mut pid: Option<u32> = None;
    let mut name: Option<String> = None;

    for line in stdout.lines() {
        if let Some(stripped) = line.strip_prefix('p') {
            if pid.is_some() {
                break;
            }
            pid = stripped.parse().ok();
        } else if let Some(stripped) = line.strip_prefix('c') {
            if pid.is_some() && name.is_none() {
                name = Some(stripped.to_string());
            }
        }
    }

    pid.map(|pid| Occupier {
        pid,
        process_name: name.unwrap_or_else(|| "unknown".to_string()),
        port,
    })
}
