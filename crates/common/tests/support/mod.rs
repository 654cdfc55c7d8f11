#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use portkeeper::{
    Allocation, Allocator, InspectError, Metadata, Occupier, PortInspector, PortRange, Registry,
    RegistryStore,
};
use tempfile::TempDir;

/// Scripted stand-in for the OS.
#[derive(Default)]
pub struct FakeInspector {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    occupied: HashMap<u16, Occupier>,
    hidden: HashSet<u16>,
    dead: HashSet<u32>,
    stubborn: bool,
    refuse_kill: bool,
    broken_table: bool,
    probes: Vec<u16>,
    terminated: Vec<(u32, bool)>,
}

impl FakeInspector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn occupy(&self, port: u16, pid: u32, name: &str) {
        self.state.lock().unwrap().occupied.insert(
            port,
            Occupier {
                pid,
                process_name: name.to_string(),
                port,
            },
        );
    }

    /// Bound, but no owner shows up in the connection table.
    pub fn occupy_hidden(&self, port: u16) {
        self.state.lock().unwrap().hidden.insert(port);
    }

    pub fn mark_dead(&self, pid: u32) {
        self.state.lock().unwrap().dead.insert(pid);
    }

    /// Termination "succeeds" but the process keeps the port.
    pub fn make_stubborn(&self) {
        self.state.lock().unwrap().stubborn = true;
    }

    pub fn refuse_kill(&self) {
        self.state.lock().unwrap().refuse_kill = true;
    }

    pub fn break_table(&self) {
        self.state.lock().unwrap().broken_table = true;
    }

    pub fn probes(&self) -> Vec<u16> {
        self.state.lock().unwrap().probes.clone()
    }

    pub fn terminated(&self) -> Vec<(u32, bool)> {
        self.state.lock().unwrap().terminated.clone()
    }
}

impl PortInspector for FakeInspector {
    fn probe(&self, port: u16) -> bool {
        let mut state = self.state.lock().unwrap();
        state.probes.push(port);
        !state.occupied.contains_key(&port) && !state.hidden.contains(&port)
    }

    fn find_occupier(&self, port: u16) -> Result<Option<Occupier>, InspectError> {
        let state = self.state.lock().unwrap();
        if state.broken_table {
            return Err(InspectError::Unsupported("fake table is broken"));
        }
        Ok(state.occupied.get(&port).cloned())
    }

    fn terminate(&self, pid: u32, force: bool) -> Result<(), InspectError> {
        let mut state = self.state.lock().unwrap();
        state.terminated.push((pid, force));
        if state.refuse_kill {
            return Err(InspectError::Signal {
                pid,
                reason: "EPERM".to_string(),
            });
        }
        if !state.stubborn {
            state.occupied.retain(|_, o| o.pid != pid);
            state.dead.insert(pid);
        }
        Ok(())
    }

    fn process_alive(&self, pid: u32) -> bool {
        !self.state.lock().unwrap().dead.contains(&pid)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub inspector: Arc<FakeInspector>,
    pub allocator: Allocator,
}

impl Harness {
    pub fn new(default_range: PortRange) -> Self {
        let dir = TempDir::new().unwrap();
        let inspector = FakeInspector::new();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        let allocator = Allocator::new(store, inspector.clone())
            .with_default_range(default_range)
            .with_kill_grace(Duration::ZERO);
        Self {
            dir,
            inspector,
            allocator,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.allocator.store().path().to_path_buf()
    }

    pub fn registry(&self) -> Registry {
        self.allocator.store().load()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.registry().allocations.keys().copied().collect()
    }

    pub fn raw(&self) -> Option<Vec<u8>> {
        fs::read(self.registry_path()).ok()
    }

    /// Write an entry straight into the file, bypassing the allocator.
    pub fn seed(&self, port: u16, pid: Option<u32>, metadata: Metadata) {
        let store = self.allocator.store();
        let mut registry = store.load();
        registry.allocations.insert(
            port,
            Allocation {
                allocated_at: Utc::now(),
                metadata,
                group_id: None,
                role: None,
                label: None,
                pid,
            },
        );
        store.save(&registry).unwrap();
    }
}

pub fn range(start: u16, end: u16) -> PortRange {
    PortRange::new(start, end).unwrap()
}

pub fn meta(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
