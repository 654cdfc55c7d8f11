use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::PortRange;

pub const MIN_PORT: u16 = 3000;
pub const MAX_PORT: u16 = 9999;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

pub const ENV_REGISTRY: &str = "PORTKEEPER_REGISTRY";
pub const ENV_RANGE: &str = "PORTKEEPER_RANGE";
pub const ENV_KILL_GRACE_MS: &str = "PORTKEEPER_KILL_GRACE_MS";

/// Runtime settings shared by the CLI and the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub registry_path: PathBuf,
    /// Range scanned by group allocation and by single allocations that name no range.
    pub default_range: PortRange,
    /// How long `reserve` waits after killing an occupier before re-probing.
    pub kill_grace: Duration,
}

impl Config {
    /// Defaults overlaid with `PORTKEEPER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let registry_path = lookup(ENV_REGISTRY)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_registry_path);

        let default_range = match lookup(ENV_RANGE).filter(|v| !v.is_empty()) {
            Some(raw) => raw.parse()?,
            None => PortRange {
                start: MIN_PORT,
                end: MAX_PORT,
            },
        };

        let kill_grace = match lookup(ENV_KILL_GRACE_MS).filter(|v| !v.is_empty()) {
            Some(raw) => Duration::from_millis(raw.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "{ENV_KILL_GRACE_MS} must be a number of milliseconds, got '{raw}'"
                ))
            })?),
            None => DEFAULT_KILL_GRACE,
        };

        Ok(Self {
            registry_path,
            default_range,
            kill_grace,
        })
    }

    /// Explicit flags win over whatever the environment provided.
    pub fn with_overrides(mut self, registry: Option<&Path>, range: Option<PortRange>) -> Self {
        if let Some(path) = registry {
            self.registry_path = path.to_path_buf();
        }
        if let Some(range) = range {
            self.default_range = range;
        }
        self
    }
}

/// Get the default registry path (~/.portkeeper/registry.json)
pub fn default_registry_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portkeeper")
        .join("registry.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.registry_path, default_registry_path());
        assert_eq!(config.default_range, PortRange { start: MIN_PORT, end: MAX_PORT });
        assert_eq!(config.kill_grace, DEFAULT_KILL_GRACE);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = Config::from_lookup(lookup(&[
            (ENV_REGISTRY, "/tmp/ports.json"),
            (ENV_RANGE, "4000-4010"),
            (ENV_KILL_GRACE_MS, "20"),
        ]))
        .unwrap();
        assert_eq!(config.registry_path, PathBuf::from("/tmp/ports.json"));
        assert_eq!(config.default_range, PortRange { start: 4000, end: 4010 });
        assert_eq!(config.kill_grace, Duration::from_millis(20));
    }

    #[test]
    fn flags_override_environment() {
        let config = Config::from_lookup(lookup(&[(ENV_REGISTRY, "/tmp/env.json")]))
            .unwrap()
            .with_overrides(
                Some(Path::new("/tmp/flag.json")),
                Some(PortRange { start: 7000, end: 7001 }),
            );
        assert_eq!(config.registry_path, PathBuf::from("/tmp/flag.json"));
        assert_eq!(config.default_range, PortRange { start: 7000, end: 7001 });
    }

    #[test]
    fn bad_range_in_environment_is_an_error() {
        let err = Config::from_lookup(lookup(&[(ENV_RANGE, "9000-8000")])).unwrap_err();
        assert!(matches!(err, Error::InvalidRange { start: 9000, end: 8000 }));
    }
}
