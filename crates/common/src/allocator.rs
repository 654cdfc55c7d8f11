//! Port allocation over a [`RegistryStore`].
//!
//! Every operation is a single locked read-modify-write of the registry file.
//! The allocator holds no state of its own beyond its configuration.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_KILL_GRACE, MAX_PORT, MIN_PORT};
use crate::error::{Error, Result};
use crate::inspect::{Occupancy, PortInspector};
use crate::registry::RegistryStore;
use crate::{
    Allocation, Claim, CleanupReport, Dashboard, DashboardEntry, Group, GroupAllocation,
    GroupMember, GroupRelease, KillReport, Metadata, PortAllocation, PortRange, ProbeResult,
    Registry, Reservation, UNASSIGNED,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReserveOptions {
    pub kill_if_occupied: bool,
    /// SIGKILL instead of SIGTERM.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Also drop entries whose port nothing is bound to.
    pub idle: bool,
}

pub struct Allocator {
    store: RegistryStore,
    inspector: Arc<dyn PortInspector>,
    default_range: PortRange,
    kill_grace: Duration,
}

impl Allocator {
    pub fn new(store: RegistryStore, inspector: Arc<dyn PortInspector>) -> Self {
        Self {
            store,
            inspector,
            default_range: PortRange {
                start: MIN_PORT,
                end: MAX_PORT,
            },
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn from_config(config: &Config, inspector: Arc<dyn PortInspector>) -> Self {
        Self::new(RegistryStore::new(&config.registry_path), inspector)
            .with_default_range(config.default_range)
            .with_kill_grace(config.kill_grace)
    }

    pub fn with_default_range(mut self, range: PortRange) -> Self {
        self.default_range = range;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn default_range(&self) -> PortRange {
        self.default_range
    }

    /// Lowest port in `range` that is neither registered nor bound.
    pub fn allocate(&self, range: PortRange, claim: Claim) -> Result<u16> {
        self.allocate_entry(range, claim).map(|entry| entry.port)
    }

    /// Like [`allocate`](Self::allocate), returning the record as written.
    pub fn allocate_entry(&self, range: PortRange, claim: Claim) -> Result<PortAllocation> {
        range.validate()?;
        self.store.update(|registry| {
            let port = self
                .scan(registry, range, &HashSet::new())
                .ok_or(Error::NoAvailablePorts {
                    start: range.start,
                    end: range.end,
                })?;
            let allocation = Allocation::from_claim(claim, Utc::now());
            registry.allocations.insert(port, allocation.clone());
            info!("Allocated port {} from {}", port, range);
            Ok(PortAllocation { port, allocation })
        })
    }

    /// Like [`allocate`](Self::allocate), but try `preferred` first.
    ///
    /// The preferred port does not have to lie inside `range`.
    pub fn acquire(&self, preferred: Option<u16>, range: PortRange, claim: Claim) -> Result<u16> {
        range.validate()?;
        self.store.update(|registry| {
            let no_claims = HashSet::new();
            let preferred = preferred
                .filter(|&p| p != 0 && self.candidate_free(registry, p, &no_claims));
            let port = match preferred {
                Some(port) => port,
                None => self
                    .scan(registry, range, &no_claims)
                    .ok_or(Error::NoAvailablePorts {
                        start: range.start,
                        end: range.end,
                    })?,
            };
            registry
                .allocations
                .insert(port, Allocation::from_claim(claim, Utc::now()));
            info!("Acquired port {}", port);
            Ok(port)
        })
    }

    /// Claim exactly `port`, optionally killing whatever holds it.
    pub fn reserve(&self, port: u16, options: ReserveOptions, claim: Claim) -> Result<Reservation> {
        if port == 0 {
            return Err(Error::InvalidRange { start: 0, end: 0 });
        }

        self.store.update(|registry| {
            if !self.evict_if_stale(registry, port) {
                return Err(Error::AlreadyAllocated { port });
            }

            let (was_occupied, killed, occupier) = match self.detect_occupier(port) {
                Occupancy::OccupiedBy(occupier) => {
                    if !options.kill_if_occupied {
                        return Err(Error::PortOccupied {
                            port,
                            occupier: Some(occupier),
                        });
                    }
                    self.inspector
                        .terminate(occupier.pid, options.force)
                        .map_err(|e| Error::KillFailed {
                            port,
                            pid: occupier.pid,
                            reason: e.to_string(),
                        })?;
                    info!(
                        "Terminated {} (pid {}) holding port {}",
                        occupier.process_name, occupier.pid, port
                    );

                    thread::sleep(self.kill_grace);
                    if !self.inspector.probe(port) {
                        return Err(Error::StillUnavailable { port });
                    }
                    (true, true, Some(occupier))
                }
                Occupancy::InspectionFailed { reason } => {
                    if !self.inspector.probe(port) {
                        return Err(Error::Inspection { port, reason });
                    }
                    debug!("Inspection of port {} failed ({}) but it binds", port, reason);
                    (false, false, None)
                }
                Occupancy::Free => {
                    // Something may have grabbed it since detection.
                    if !self.inspector.probe(port) {
                        return Err(Error::PortOccupied {
                            port,
                            occupier: None,
                        });
                    }
                    (false, false, None)
                }
            };

            registry
                .allocations
                .insert(port, Allocation::from_claim(claim, Utc::now()));
            info!("Reserved port {}", port);
            Ok(Reservation {
                port,
                was_occupied,
                killed,
                occupier,
            })
        })
    }

    /// Remove the allocation for `port`. Returns whether one existed.
    pub fn release(&self, port: u16) -> Result<bool> {
        self.store.update(|registry| {
            let released = registry.allocations.remove(&port).is_some();
            if released {
                info!("Released port {}", port);
            }
            Ok(released)
        })
    }

    /// Free in both the registry and the OS. A stale entry for `port` is evicted first.
    pub fn is_available(&self, port: u16) -> Result<bool> {
        self.store.update(|registry| {
            let unregistered = self.evict_if_stale(registry, port);
            Ok(unregistered && self.inspector.probe(port))
        })
    }

    pub fn probe(&self, port: u16) -> ProbeResult {
        ProbeResult {
            port,
            in_use: !self.inspector.probe(port),
        }
    }

    pub fn detect_occupier(&self, port: u16) -> Occupancy {
        match self.inspector.find_occupier(port) {
            Ok(Some(occupier)) => Occupancy::OccupiedBy(occupier),
            Ok(None) if self.inspector.probe(port) => Occupancy::Free,
            Ok(None) => Occupancy::InspectionFailed {
                reason: format!("port {port} is bound but its owning process is not visible"),
            },
            Err(e) => Occupancy::InspectionFailed {
                reason: e.to_string(),
            },
        }
    }

    /// Terminate the occupier of `port` and drop its registry entry.
    pub fn kill_occupier(&self, port: u16, force: bool) -> Result<KillReport> {
        let occupier = match self.detect_occupier(port) {
            Occupancy::Free => {
                return Ok(KillReport {
                    killed: false,
                    pid: None,
                    process_name: None,
                    reason: Some("Port not in use".to_string()),
                })
            }
            Occupancy::InspectionFailed { reason } => {
                return Ok(KillReport {
                    killed: false,
                    pid: None,
                    process_name: None,
                    reason: Some(reason),
                })
            }
            Occupancy::OccupiedBy(occupier) => occupier,
        };

        if let Err(e) = self.inspector.terminate(occupier.pid, force) {
            warn!("Failed to terminate pid {} on port {}: {}", occupier.pid, port, e);
            return Ok(KillReport {
                killed: false,
                pid: Some(occupier.pid),
                process_name: Some(occupier.process_name),
                reason: Some(e.to_string()),
            });
        }

        info!(
            "Killed {} (pid {}) on port {}",
            occupier.process_name, occupier.pid, port
        );
        self.release(port)?;
        Ok(KillReport {
            killed: true,
            pid: Some(occupier.pid),
            process_name: Some(occupier.process_name),
            reason: None,
        })
    }

    /// Allocate `count` ports from the default range under one fresh group id.
    ///
    /// All or nothing: if the range runs dry part way, nothing is written.
    pub fn allocate_group(
        &self,
        count: usize,
        metadata: Metadata,
        roles: &[String],
    ) -> Result<GroupAllocation> {
        if count == 0 {
            return Err(Error::InvalidGroupSize);
        }

        let role_names: Vec<String> = (0..count)
            .map(|i| roles.get(i).cloned().unwrap_or_else(|| format!("port{}", i + 1)))
            .collect();
        let mut seen = HashSet::new();
        for role in &role_names {
            if !seen.insert(role.as_str()) {
                return Err(Error::DuplicateRole(role.clone()));
            }
        }

        let range = self.default_range;
        range.validate()?;
        let group_id = Uuid::new_v4().to_string();

        self.store.update(|registry| {
            let mut claimed = HashSet::new();
            let mut assigned: Vec<(String, u16)> = Vec::with_capacity(count);

            for role in role_names {
                match self.scan(registry, range, &claimed) {
                    Some(port) => {
                        claimed.insert(port);
                        assigned.push((role, port));
                    }
                    None => {
                        warn!(
                            "Group allocation found {} of {} ports in {}; rolling back",
                            assigned.len(),
                            count,
                            range
                        );
                        return Err(Error::GroupAllocationFailed {
                            requested: count,
                            found: assigned.len(),
                        });
                    }
                }
            }

            let now = Utc::now();
            for (role, port) in &assigned {
                registry.allocations.insert(
                    *port,
                    Allocation {
                        allocated_at: now,
                        metadata: metadata.clone(),
                        group_id: Some(group_id.clone()),
                        role: Some(role.clone()),
                        label: None,
                        pid: None,
                    },
                );
            }
            info!("Allocated group {} with {} port(s)", group_id, assigned.len());

            Ok(GroupAllocation {
                group_id: group_id.clone(),
                ports: assigned.into_iter().collect(),
                metadata,
            })
        })
    }

    pub fn release_group(&self, group_id: &str) -> Result<GroupRelease> {
        self.store.update(|registry| {
            let ports: Vec<u16> = registry
                .allocations
                .iter()
                .filter(|(_, a)| a.group_id.as_deref() == Some(group_id))
                .map(|(port, _)| *port)
                .collect();
            for port in &ports {
                registry.allocations.remove(port);
            }
            if !ports.is_empty() {
                info!("Released group {} ({} port(s))", group_id, ports.len());
            }
            Ok(GroupRelease {
                released: ports.len(),
                ports,
            })
        })
    }

    pub fn list_allocations(&self) -> Result<Vec<PortAllocation>> {
        self.filtered(|_| true)
    }

    pub fn ports_by_app(&self, app: &str) -> Result<Vec<PortAllocation>> {
        self.filtered(|a| a.app() == Some(app))
    }

    pub fn ports_by_worktree(&self, worktree: &str) -> Result<Vec<PortAllocation>> {
        self.filtered(|a| a.worktree() == Some(worktree))
    }

    /// app -> worktree -> entries, each with a live occupancy probe.
    pub fn all_grouped(&self) -> Result<Dashboard> {
        let registry = self.store.snapshot()?;
        let mut dashboard = Dashboard::new();
        for (port, allocation) in registry.allocations {
            let app = allocation.app().unwrap_or(UNASSIGNED).to_string();
            let worktree = allocation.worktree().unwrap_or(UNASSIGNED).to_string();
            let in_use = !self.inspector.probe(port);
            dashboard
                .entry(app)
                .or_default()
                .entry(worktree)
                .or_default()
                .push(DashboardEntry {
                    port,
                    allocation,
                    in_use,
                });
        }
        Ok(dashboard)
    }

    pub fn groups(&self) -> Result<Vec<Group>> {
        let registry = self.store.snapshot()?;
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        for (port, allocation) in registry.allocations {
            let Some(group_id) = allocation.group_id else {
                continue;
            };
            groups
                .entry(group_id.clone())
                .or_insert_with(|| Group {
                    group_id,
                    members: Vec::new(),
                    metadata: allocation.metadata,
                })
                .members
                .push(GroupMember {
                    role: allocation.role,
                    port,
                });
        }
        Ok(groups.into_values().collect())
    }

    /// Drop stale entries, and with `idle` also entries nothing is bound to.
    pub fn cleanup(&self, options: CleanupOptions) -> Result<CleanupReport> {
        self.store.update(|registry| {
            let removed: Vec<u16> = registry
                .allocations
                .iter()
                .filter(|(port, a)| {
                    self.is_stale(a) || (options.idle && self.inspector.probe(**port))
                })
                .map(|(port, _)| *port)
                .collect();
            for port in &removed {
                registry.allocations.remove(port);
            }
            if !removed.is_empty() {
                info!("Cleaned up {} allocation(s): {:?}", removed.len(), removed);
            }
            Ok(CleanupReport { removed })
        })
    }

    fn filtered(&self, keep: impl Fn(&Allocation) -> bool) -> Result<Vec<PortAllocation>> {
        let registry = self.store.snapshot()?;
        Ok(registry
            .allocations
            .into_iter()
            .filter(|(_, a)| keep(a))
            .map(|(port, allocation)| PortAllocation { port, allocation })
            .collect())
    }

    fn is_stale(&self, allocation: &Allocation) -> bool {
        allocation
            .pid
            .is_some_and(|pid| !self.inspector.process_alive(pid))
    }

    /// Evict the entry for `port` if its owner is gone.
    /// Returns `true` when `port` is unregistered afterwards.
    fn evict_if_stale(&self, registry: &mut Registry, port: u16) -> bool {
        match registry.allocations.get(&port) {
            None => true,
            Some(a) if self.is_stale(a) => {
                info!(
                    "Evicting stale allocation for port {} (pid {:?} is gone)",
                    port, a.pid
                );
                registry.allocations.remove(&port);
                true
            }
            Some(_) => false,
        }
    }

    fn candidate_free(&self, registry: &mut Registry, port: u16, claimed: &HashSet<u16>) -> bool {
        if claimed.contains(&port) {
            return false;
        }
        if !self.evict_if_stale(registry, port) {
            debug!("Port {} is registered, skipping", port);
            return false;
        }
        if !self.inspector.probe(port) {
            debug!("Port {} is bound by another process, skipping", port);
            return false;
        }
        true
    }

    fn scan(&self, registry: &mut Registry, range: PortRange, claimed: &HashSet<u16>) -> Option<u16> {
        range
            .ports()
            .find(|&port| self.candidate_free(registry, port, claimed))
    }
}
