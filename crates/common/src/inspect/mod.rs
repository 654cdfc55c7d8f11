//! OS port and process inspection.
//!
//! Everything the allocator needs from the operating system goes through
//! [`PortInspector`]. [`SystemInspector`] is the real implementation; the
//! platform-specific parts are chosen at compile time.

mod lsof;
mod procfs;

use std::net::TcpListener;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The process currently bound to a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occupier {
    pub pid: u32,
    pub process_name: String,
    pub port: u16,
}

/// Result of asking who holds a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Occupancy {
    Free,
    OccupiedBy(Occupier),
    InspectionFailed { reason: String },
}

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("process inspection is not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("refusing to signal pid {pid}: {reason}")]
    InvalidPid { pid: u32, reason: &'static str },

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("{command} failed: {reason}")]
    Command { command: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Narrow view of the OS networking and process subsystems.
pub trait PortInspector: Send + Sync {
    /// `true` when the port can be bound right now.
    fn probe(&self, port: u16) -> bool;

    /// The process listening on `port`, if one is visible.
    fn find_occupier(&self, port: u16) -> Result<Option<Occupier>, InspectError>;

    /// Send SIGTERM, or SIGKILL when `force`.
    fn terminate(&self, pid: u32, force: bool) -> Result<(), InspectError>;

    fn process_alive(&self, pid: u32) -> bool;
}

/// The inspector for the platform this binary was built for.
pub fn system() -> Arc<dyn PortInspector> {
    Arc::new(SystemInspector)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInspector;

impl PortInspector for SystemInspector {
    fn probe(&self, port: u16) -> bool {
        is_port_available(port)
    }

    fn find_occupier(&self, port: u16) -> Result<Option<Occupier>, InspectError> {
        #[cfg(target_os = "linux")]
        {
            procfs::find_occupier(port)
        }

        #[cfg(target_os = "macos")]
        {
            lsof::find_occupier(port)
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = port;
            Err(InspectError::Unsupported("no connection table reader"))
        }
    }

    fn terminate(&self, pid: u32, force: bool) -> Result<(), InspectError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};

            let nix_pid = validate_pid(pid)?;
            let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            tracing::debug!("Sending {:?} to pid {}", sig, pid);
            signal::kill(nix_pid, sig).map_err(|e| InspectError::Signal {
                pid,
                reason: e.to_string(),
            })
        }

        #[cfg(not(unix))]
        {
            let _ = (pid, force);
            Err(InspectError::Unsupported("signals are only available on Unix"))
        }
    }

    fn process_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            if pid == 0 || pid > i32::MAX as u32 {
                return false;
            }
            match kill(Pid::from_raw(pid as i32), None) {
                Ok(_) => true,
                Err(Errno::ESRCH) => false,
                Err(Errno::EPERM) => true,
                Err(_) => false,
            }
        }

        #[cfg(not(unix))]
        {
            // Without a liveness check nothing is ever considered stale.
            let _ = pid;
            true
        }
    }
}

/// Bind-test both loopback and the wildcard address.
///
/// On macOS binding 127.0.0.1 can succeed while 0.0.0.0 is taken, so both
/// must succeed for the port to count as free.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(unix)]
fn validate_pid(pid: u32) -> Result<nix::unistd::Pid, InspectError> {
    if pid == 0 {
        return Err(InspectError::InvalidPid {
            pid,
            reason: "pid 0 addresses a process group",
        });
    }
    if pid == 1 {
        return Err(InspectError::InvalidPid {
            pid,
            reason: "pid 1 is init",
        });
    }
    if pid > i32::MAX as u32 {
        return Err(InspectError::InvalidPid {
            pid,
            reason: "pid exceeds i32::MAX",
        });
    }
    if pid == std::process::id() {
        return Err(InspectError::InvalidPid {
            pid,
            reason: "that is this process",
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_port_is_not_available() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!SystemInspector.probe(port));
        drop(listener);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(SystemInspector.process_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn refuses_to_signal_reserved_pids() {
        for pid in [0, 1, std::process::id()] {
            assert!(matches!(
                SystemInspector.terminate(pid, false),
                Err(InspectError::InvalidPid { .. })
            ));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn finds_own_listener_on_linux() {
        // 0.0.0.0 so the socket shows up in /proc/net/tcp regardless of loopback handling.
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let occupier = SystemInspector.find_occupier(port).unwrap().unwrap();
        assert_eq!(occupier.pid, std::process::id());
        assert_eq!(occupier.port, port);
        drop(listener);
    }

    #[test]
    fn occupancy_serializes_with_status_tag() {
        let value = serde_json::to_value(Occupancy::OccupiedBy(Occupier {
            pid: 7,
            process_name: "redis-server".into(),
            port: 6379,
        }))
        .unwrap();
        assert_eq!(value["status"], "occupiedBy");
        assert_eq!(value["processName"], "redis-server");

        let value = serde_json::to_value(Occupancy::Free).unwrap();
        assert_eq!(value["status"], "free");
    }
}
