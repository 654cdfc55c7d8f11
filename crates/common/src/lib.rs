pub mod allocator;
pub mod config;
pub mod error;
pub mod inspect;
pub mod registry;

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use allocator::{Allocator, CleanupOptions, ReserveOptions};
pub use config::Config;
pub use error::{Error, Result};
pub use inspect::{InspectError, Occupancy, Occupier, PortInspector, SystemInspector};
pub use registry::RegistryStore;

/// Schema tag written into every registry document.
pub const REGISTRY_VERSION: &str = "1.0.0";

/// Bucket name used by the dashboard view for entries without `app`/`worktree` metadata.
pub const UNASSIGNED: &str = "unassigned";

pub type Metadata = BTreeMap<String, String>;

/// The persisted root document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default = "registry_version")]
    pub version: String,
    #[serde(default)]
    pub allocations: BTreeMap<u16, Allocation>,
}

fn registry_version() -> String {
    REGISTRY_VERSION.to_string()
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: registry_version(),
            allocations: BTreeMap::new(),
        }
    }
}

/// One record per currently-held port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub allocated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Owning process. Entries without one are never considered stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl Allocation {
    pub fn from_claim(claim: Claim, now: DateTime<Utc>) -> Self {
        Self {
            allocated_at: now,
            metadata: claim.metadata,
            group_id: None,
            role: None,
            label: claim.label,
            pid: claim.pid,
        }
    }

    pub fn app(&self) -> Option<&str> {
        self.metadata.get("app").map(String::as_str)
    }

    pub fn worktree(&self) -> Option<&str> {
        self.metadata.get("worktree").map(String::as_str)
    }
}

/// What a caller supplies when asking for a port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl Claim {
    pub fn with_metadata(metadata: Metadata) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }
}

/// Inclusive range of candidate ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start == 0 || self.start > self.end {
            return Err(Error::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn ports(&self) -> std::ops::RangeInclusive<u16> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = Error;

    /// Accepts `START-END` or a single `PORT`.
    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| Error::InvalidRangeSyntax(s.to_string()))
        };
        match s.split_once('-') {
            Some((start, end)) => PortRange::new(parse(start)?, parse(end)?),
            None => {
                let port = parse(s)?;
                PortRange::new(port, port)
            }
        }
    }
}

/// A registry entry paired with its port, as returned by the query helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
    #[serde(flatten)]
    pub allocation: Allocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub port: u16,
    pub in_use: bool,
}

/// Outcome of an exact-port reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub port: u16,
    pub was_occupied: bool,
    pub killed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupier: Option<Occupier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillReport {
    pub killed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAllocation {
    pub group_id: String,
    pub ports: BTreeMap<String, u16>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRelease {
    pub released: usize,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub role: Option<String>,
    pub port: u16,
}

/// Allocations sharing a `groupId`, rebuilt from the flat registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_id: String,
    pub members: Vec<GroupMember>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardEntry {
    pub port: u16,
    #[serde(flatten)]
    pub allocation: Allocation,
    pub in_use: bool,
}

/// app -> worktree -> entries
pub type Dashboard = BTreeMap<String, BTreeMap<String, Vec<DashboardEntry>>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    pub range: Option<PortRange>,
    #[serde(flatten)]
    pub claim: Claim,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Allocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub port: u16,
    pub released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRequest {
    pub count: usize,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReleaseRequest {
    pub group_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub app: Option<String>,
    pub worktree: Option<String>,
    pub port: Option<u16>,
    pub all_ports: Vec<u16>,
    pub allocations: Vec<PortAllocation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("3000-3999", 3000, 3999)]
    #[case("8080", 8080, 8080)]
    #[case(" 5000 - 5002 ", 5000, 5002)]
    fn parses_port_ranges(#[case] input: &str, #[case] start: u16, #[case] end: u16) {
        let range: PortRange = input.parse().unwrap();
        assert_eq!(range, PortRange { start, end });
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("3000-")]
    #[case("70000")]
    fn rejects_malformed_ranges(#[case] input: &str) {
        assert!(matches!(
            input.parse::<PortRange>(),
            Err(Error::InvalidRangeSyntax(_))
        ));
    }

    #[rstest]
    #[case(0, 10)]
    #[case(4000, 3000)]
    fn rejects_inverted_or_zero_ranges(#[case] start: u16, #[case] end: u16) {
        assert!(matches!(
            PortRange::new(start, end),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn allocation_wire_format_is_camel_case_and_sparse() {
        let mut metadata = Metadata::new();
        metadata.insert("app".into(), "web".into());
        let allocation = Allocation {
            allocated_at: "2024-01-02T03:04:05Z".parse().unwrap(),
            metadata,
            group_id: None,
            role: Some("frontend".into()),
            label: None,
            pid: None,
        };

        let value = serde_json::to_value(&allocation).unwrap();
        assert_eq!(value["allocatedAt"], "2024-01-02T03:04:05Z");
        assert_eq!(value["metadata"]["app"], "web");
        assert_eq!(value["role"], "frontend");
        assert!(value.get("groupId").is_none());
        assert!(value.get("pid").is_none());
    }

    #[test]
    fn registry_keys_are_port_strings() {
        let json = r#"{"version":"1.0.0","allocations":{"3000":{"allocatedAt":"2024-01-02T03:04:05Z","metadata":{}}}}"#;
        let registry: Registry = serde_json::from_str(json).unwrap();
        assert!(registry.allocations.contains_key(&3000));
        assert_eq!(
            serde_json::to_string(&registry).unwrap(),
            json.to_string()
        );
    }
}
