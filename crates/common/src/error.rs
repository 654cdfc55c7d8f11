//! Error types for allocator and registry operations.

use thiserror::Error;

use crate::inspect::Occupier;

#[derive(Debug, Error)]
pub enum Error {
    /// Every candidate in the range was registered or bound.
    #[error("no available ports in range {start}-{end}")]
    NoAvailablePorts { start: u16, end: u16 },

    /// Exact-port reservation blocked and no permission to kill.
    #[error("port {port} is occupied by {}", describe_occupier(.occupier))]
    PortOccupied {
        port: u16,
        occupier: Option<Occupier>,
    },

    /// The occupier was signalled but the port did not free up within the grace interval.
    #[error("port {port} is still unavailable after terminating its occupier")]
    StillUnavailable { port: u16 },

    #[error("group allocation failed: found {found} of {requested} ports")]
    GroupAllocationFailed { requested: usize, found: usize },

    #[error("port {port} is already allocated in the registry")]
    AlreadyAllocated { port: u16 },

    #[error("failed to terminate pid {pid} on port {port}: {reason}")]
    KillFailed { port: u16, pid: u32, reason: String },

    /// Occupancy could not be determined and the port is not bindable.
    #[error("could not inspect port {port}: {reason}")]
    Inspection { port: u16, reason: String },

    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("invalid port range '{0}': expected START-END or PORT")]
    InvalidRangeSyntax(String),

    #[error("group size must be at least 1")]
    InvalidGroupSize,

    #[error("duplicate role '{0}' in group request")]
    DuplicateRole(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn describe_occupier(occupier: &Option<Occupier>) -> String {
    match occupier {
        Some(o) => format!("{} (pid {})", o.process_name, o.pid),
        None => "an unknown process".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupied_message_names_the_process() {
        let err = Error::PortOccupied {
            port: 3000,
            occupier: Some(Occupier {
                pid: 42,
                process_name: "node".into(),
                port: 3000,
            }),
        };
        assert_eq!(err.to_string(), "port 3000 is occupied by node (pid 42)");

        let err = Error::PortOccupied {
            port: 3000,
            occupier: None,
        };
        assert_eq!(
            err.to_string(),
            "port 3000 is occupied by an unknown process"
        );
    }
}
