use std::path::{Path, PathBuf};

use crate::config::AvdctlConfig;
use crate::instance::InstanceId;

const LOCAL_INSTANCE_PREFIX: &str = "local-instance-";
const LOCAL_GOLDFISH_PREFIX: &str = "local-goldfish-instance-";
const LOCK_SUFFIX: &str = ".lock";

pub fn instance_name(id: InstanceId) -> String {
    format!("{LOCAL_INSTANCE_PREFIX}{id}")
}

pub fn goldfish_instance_name(id: InstanceId) -> String {
    format!("{LOCAL_GOLDFISH_PREFIX}{id}")
}

pub fn parse_instance_id(name: &str) -> Option<InstanceId> {
    parse_with_prefix(name, LOCAL_INSTANCE_PREFIX)
}

pub fn parse_goldfish_instance_id(name: &str) -> Option<InstanceId> {
    parse_with_prefix(name, LOCAL_GOLDFISH_PREFIX)
}

// Full-string match: prefix followed by one or more digits, nothing else.
fn parse_with_prefix(name: &str, prefix: &str) -> Option<InstanceId> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Filesystem layout for one cuttlefish-style instance, derived purely from
/// the configuration and the id. Only `log_dir` touches the filesystem.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    pub id: InstanceId,
    pub home: PathBuf,
    pub runtime: PathBuf,
    pub assembly_config: PathBuf,
    pub legacy_config: PathBuf,
    pub lock: PathBuf,
}

impl InstancePaths {
    pub fn new(config: &AvdctlConfig, id: InstanceId) -> Self {
        let name = instance_name(id);
        let home = config.cvd_temp_dir.join(&name);
        let runtime = home.join(&config.runtime_dir_name);
        Self {
            id,
            assembly_config: home
                .join(&config.assembly_dir_name)
                .join(&config.config_file_name),
            legacy_config: runtime.join(&config.config_file_name),
            lock: config
                .cvd_temp_dir
                .join(format!("{name}{LOCK_SUFFIX}")),
            home,
            runtime,
        }
    }

    /// Present config path, preferring the assembly location over the legacy
    /// one directly under the runtime dir.
    pub fn find_config(&self) -> Option<PathBuf> {
        for candidate in [&self.assembly_config, &self.legacy_config] {
            if candidate.is_file() {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Newer launchers keep logs under `<runtime>/instances/cvd-<id>/logs`;
    /// older ones write straight into the runtime dir. Returns whichever
    /// exists, preferring the newer location.
    pub fn log_dir(&self) -> PathBuf {
        let nested = self
            .runtime
            .join("instances")
            .join(format!("cvd-{}", self.id))
            .join("logs");
        if nested.is_dir() {
            nested
        } else {
            self.runtime.clone()
        }
    }

    pub fn cvd_tool_dir(&self, config: &AvdctlConfig) -> PathBuf {
        self.home.join(&config.cvd_bin_dir)
    }
}

/// Filesystem layout for one goldfish instance.
#[derive(Debug, Clone)]
pub struct GoldfishPaths {
    pub id: InstanceId,
    pub home: PathBuf,
    pub lock: PathBuf,
}

impl GoldfishPaths {
    pub fn new(config: &AvdctlConfig, id: InstanceId) -> Self {
        let name = goldfish_instance_name(id);
        Self {
            id,
            home: config.goldfish_temp_dir.join(&name),
            lock: config
                .goldfish_temp_dir
                .join(format!("{name}{LOCK_SUFFIX}")),
        }
    }
}

/// The per-user config a launcher writes when it runs a single instance
/// without an instance home, probed during enumeration.
pub fn default_config_path(config: &AvdctlConfig) -> PathBuf {
    config
        .user_home
        .join(&config.runtime_dir_name)
        .join(&config.config_file_name)
}

pub fn find_default_config(config: &AvdctlConfig) -> Option<PathBuf> {
    let path = default_config_path(config);
    path.is_file().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> AvdctlConfig {
        AvdctlConfig {
            cvd_temp_dir: root.join("cvd"),
            goldfish_temp_dir: root.join("gf"),
            user_home: root.join("home"),
            ..AvdctlConfig::default()
        }
    }

    #[test]
    fn name_round_trip() {
        for id in [1, 2, 10, 999, 1000] {
            assert_eq!(parse_instance_id(&instance_name(id)), Some(id));
            assert_eq!(
                parse_goldfish_instance_id(&goldfish_instance_name(id)),
                Some(id)
            );
        }
    }

    #[test]
    fn parse_rejects_non_matching_names() {
        for name in [
            "",
            "local-instance-",
            "local-instance-1x",
            "local-instance-1 ",
            "xlocal-instance-1",
            "local-goldfish-instance-2",
            "something-else",
        ] {
            assert_eq!(parse_instance_id(name), None, "{name:?}");
        }
        assert_eq!(parse_goldfish_instance_id("local-instance-2"), None);
    }

    #[test]
    fn parse_tolerates_leading_zeros() {
        assert_eq!(parse_instance_id("local-instance-007"), Some(7));
    }

    #[test]
    fn paths_follow_conventions() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        let paths = InstancePaths::new(&config, 3);
        assert_eq!(paths.home, config.cvd_temp_dir.join("local-instance-3"));
        assert_eq!(
            paths.lock,
            config.cvd_temp_dir.join("local-instance-3.lock")
        );
        assert_eq!(
            paths.assembly_config,
            paths.home.join("cuttlefish_assembly/cuttlefish_config.json")
        );
        assert_eq!(
            paths.legacy_config,
            paths.home.join("cuttlefish_runtime/cuttlefish_config.json")
        );

        let gf = GoldfishPaths::new(&config, 2);
        assert_eq!(
            gf.home,
            config.goldfish_temp_dir.join("local-goldfish-instance-2")
        );
        assert_eq!(
            gf.lock,
            config
                .goldfish_temp_dir
                .join("local-goldfish-instance-2.lock")
        );
    }

    #[test]
    fn find_config_prefers_assembly_over_legacy() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        let paths = InstancePaths::new(&config, 1);
        assert_eq!(paths.find_config(), None);

        fs::create_dir_all(paths.legacy_config.parent().unwrap()).unwrap();
        fs::write(&paths.legacy_config, "{}").unwrap();
        assert_eq!(paths.find_config(), Some(paths.legacy_config.clone()));

        fs::create_dir_all(paths.assembly_config.parent().unwrap()).unwrap();
        fs::write(&paths.assembly_config, "{}").unwrap();
        assert_eq!(paths.find_config(), Some(paths.assembly_config.clone()));
    }

    #[test]
    fn log_dir_prefers_nested_layout_and_falls_back() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        let paths = InstancePaths::new(&config, 5);
        assert_eq!(paths.log_dir(), paths.runtime);

        let nested = paths.runtime.join("instances/cvd-5/logs");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(paths.log_dir(), nested);
    }

    #[test]
    fn default_config_probe() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        assert_eq!(find_default_config(&config), None);

        let path = default_config_path(&config);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{}").unwrap();
        assert_eq!(find_default_config(&config), Some(path));
    }
}
