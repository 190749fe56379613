use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::instance::InstanceId;

// Raw on-disk schema. Launchers differ: newer ones nest per-instance data
// under an "instances" table keyed by the id, older ones write the same
// fields flat at the top level. Every field is optional so a partial config
// still yields a record.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    instances: BTreeMap<String, RawInstanceEntry>,
    #[serde(default)]
    x_res: Option<u32>,
    #[serde(default)]
    y_res: Option<u32>,
    #[serde(default)]
    dpi: Option<u32>,
    #[serde(default)]
    cvd_tools_path: Option<PathBuf>,
    #[serde(default)]
    adb_ip_and_port: Option<String>,
    #[serde(default)]
    vnc_server_port: Option<u16>,
    #[serde(default)]
    instance_dir: Option<PathBuf>,
    #[serde(default)]
    virtual_disk_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawInstanceEntry {
    #[serde(default)]
    adb_ip_and_port: Option<String>,
    #[serde(default)]
    vnc_server_port: Option<u16>,
    #[serde(default)]
    instance_dir: Option<PathBuf>,
    #[serde(default)]
    virtual_disk_paths: Vec<PathBuf>,
}

/// Normalized view of one `cuttlefish_config.json`, independent of which
/// schema generation wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub adb_port: Option<u16>,
    pub vnc_port: Option<u16>,
    pub x_res: Option<u32>,
    pub y_res: Option<u32>,
    pub dpi: Option<u32>,
    pub instance_dir: Option<PathBuf>,
    pub virtual_disk_paths: Vec<PathBuf>,
    pub cvd_tools_path: Option<PathBuf>,
    pub config_path: PathBuf,
}

pub fn read(path: &Path) -> Result<InstanceRecord> {
    read_for_instance(path, 1)
}

/// Reads a runtime config, defaulting the id to `candidate_id` when the
/// config does not name one. An id written in the config wins over the
/// candidate: a single-instance config found under the default home can
/// belong to any instance.
pub fn read_for_instance(path: &Path, candidate_id: InstanceId) -> Result<InstanceRecord> {
    let raw = load_raw(path)?;
    Ok(normalize(raw, path, candidate_id))
}

fn load_raw(path: &Path) -> Result<RawConfig> {
    // Whole file first, then one parse: the caller either gets a complete
    // record or an error, never a half-populated one.
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            }
            .into())
        }
        Err(err) => return Err(err.into()),
    };
    let raw = serde_json::from_str(&text).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw)
}

fn normalize(raw: RawConfig, path: &Path, candidate_id: InstanceId) -> InstanceRecord {
    let mut instance_id = candidate_id;
    let mut entry = RawInstanceEntry::default();
    if let Some(found) = raw.instances.get(&candidate_id.to_string()) {
        entry = found.clone();
    } else if let Some((parsed, found)) = raw
        .instances
        .iter()
        .find_map(|(key, entry)| Some((key.parse::<InstanceId>().ok()?, entry)))
    {
        instance_id = parsed;
        entry = found.clone();
    }

    let adb_port = entry
        .adb_ip_and_port
        .as_deref()
        .or(raw.adb_ip_and_port.as_deref())
        .and_then(|value| parse_adb_port(path, value));
    let virtual_disk_paths = if entry.virtual_disk_paths.is_empty() {
        raw.virtual_disk_paths
    } else {
        entry.virtual_disk_paths
    };

    InstanceRecord {
        instance_id,
        adb_port,
        vnc_port: entry.vnc_server_port.or(raw.vnc_server_port),
        x_res: raw.x_res,
        y_res: raw.y_res,
        dpi: raw.dpi,
        instance_dir: entry.instance_dir.or(raw.instance_dir),
        virtual_disk_paths,
        cvd_tools_path: raw.cvd_tools_path,
        config_path: path.to_path_buf(),
    }
}

// "0.0.0.0:6520" carries the port in the tail; an unparsable value is
// treated as absent rather than failing the whole read.
fn parse_adb_port(path: &Path, value: &str) -> Option<u16> {
    let port = value.rsplit_once(':').and_then(|(_, tail)| tail.parse().ok());
    if port.is_none() {
        debug!(
            target: "avdctl",
            "ignoring unparsable adb_ip_and_port {:?} in {}",
            value,
            path.display()
        );
    }
    port
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("cuttlefish_config.json");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn reads_nested_schema() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"{
                "x_res": 1080,
                "y_res": 1920,
                "dpi": 480,
                "cvd_tools_path": "/opt/cvd",
                "instances": {
                    "2": {
                        "adb_ip_and_port": "0.0.0.0:6521",
                        "vnc_server_port": 6445,
                        "instance_dir": "/tmp/avd/local-instance-2/cuttlefish_runtime",
                        "virtual_disk_paths": ["/tmp/overlay.img"]
                    }
                }
            }"#,
        );
        let record = read_for_instance(&path, 2).unwrap();
        assert_eq!(record.instance_id, 2);
        assert_eq!(record.adb_port, Some(6521));
        assert_eq!(record.vnc_port, Some(6445));
        assert_eq!(record.x_res, Some(1080));
        assert_eq!(record.dpi, Some(480));
        assert_eq!(record.cvd_tools_path, Some(PathBuf::from("/opt/cvd")));
        assert_eq!(record.virtual_disk_paths, vec![PathBuf::from("/tmp/overlay.img")]);
    }

    #[test]
    fn config_id_wins_over_candidate() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"{"instances": {"3": {"adb_ip_and_port": "127.0.0.1:6522"}}}"#,
        );
        let record = read_for_instance(&path, 1).unwrap();
        assert_eq!(record.instance_id, 3);
        assert_eq!(record.adb_port, Some(6522));
    }

    #[test]
    fn reads_flat_legacy_schema() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"{
                "x_res": 720,
                "y_res": 1280,
                "dpi": 320,
                "adb_ip_and_port": "127.0.0.1:6520",
                "vnc_server_port": 6444,
                "virtual_disk_paths": ["/tmp/sdcard.img"]
            }"#,
        );
        let record = read_for_instance(&path, 1).unwrap();
        assert_eq!(record.instance_id, 1);
        assert_eq!(record.adb_port, Some(6520));
        assert_eq!(record.vnc_port, Some(6444));
        assert_eq!(record.virtual_disk_paths, vec![PathBuf::from("/tmp/sdcard.img")]);
    }

    #[test]
    fn tolerates_empty_and_unknown_fields() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp, r#"{"future_field": {"nested": true}}"#);
        let record = read_for_instance(&path, 4).unwrap();
        assert_eq!(record.instance_id, 4);
        assert_eq!(record.adb_port, None);
        assert_eq!(record.vnc_port, None);
        assert_eq!(record.x_res, None);
        assert!(record.virtual_disk_paths.is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("absent.json");
        match read(&path) {
            Err(Error::Config(ConfigError::NotFound { path: reported })) => {
                assert_eq!(reported, path)
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_malformed() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp, "{not json");
        match read(&path) {
            Err(Error::Config(ConfigError::Malformed { path: reported, .. })) => {
                assert_eq!(reported, path)
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn unparsable_adb_endpoint_is_ignored() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp, r#"{"adb_ip_and_port": "garbage"}"#);
        let record = read(&path).unwrap();
        assert_eq!(record.adb_port, None);
    }
}
