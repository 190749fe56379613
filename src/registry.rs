use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::adb::AdbTools;
use crate::config::AvdctlConfig;
use crate::dirs::{self, InstancePaths};
use crate::error::{ConfigError, Error, Result};
use crate::instance::{self, Instance, InstanceId, InstanceState, RemoteInstanceData};
use crate::lock::InstanceLock;
use crate::ports;
use crate::runner::CvdRunner;
use crate::runtime_config::{self, InstanceRecord};

/// Filesystem-backed view of the local instances. Nothing is cached; every
/// query re-reads the on-disk state so concurrent creates and deletes are
/// always picked up.
pub struct Registry {
    config: AvdctlConfig,
    runner: CvdRunner,
    adb: AdbTools,
}

/// Outcome of one deletion inside `delete_all`.
pub struct DeleteReport {
    pub id: InstanceId,
    pub result: Result<()>,
}

impl Registry {
    pub fn new(config: AvdctlConfig) -> Self {
        let runner = CvdRunner::new(config.clone());
        let adb = AdbTools::new(&config);
        Self {
            config,
            runner,
            adb,
        }
    }

    /// Best-effort enumeration of the cuttlefish-style instances. Candidates
    /// with an unreadable config are skipped, never an error for the caller.
    pub fn list(&self) -> Result<Vec<Instance>> {
        let mut by_id = BTreeMap::new();
        for (candidate_id, config_path) in self.instance_configs()? {
            let record = match runtime_config::read_for_instance(&config_path, candidate_id) {
                Ok(record) => record,
                Err(err) => {
                    debug!(target: "avdctl", "skipping {}: {err}", config_path.display());
                    continue;
                }
            };
            by_id
                .entry(record.instance_id)
                .or_insert_with(|| self.build_local(&record));
        }
        info!(target: "avdctl", "found {} local instances", by_id.len());
        Ok(by_id.into_values().collect())
    }

    /// Goldfish instances leave no config behind, so they are enumerated from
    /// adb: every serial matching the emulator convention maps back to an id.
    pub fn list_goldfish(&self) -> Vec<Instance> {
        let devices = match self.adb.devices() {
            Ok(devices) => devices,
            Err(err) => {
                warn!(target: "avdctl", "cannot list adb devices: {err:#}");
                return Vec::new();
            }
        };
        let mut instances = Vec::new();
        for device in devices {
            let Some(id) = ports::goldfish_id_for_serial(&self.config, &device.serial) else {
                continue;
            };
            let info = device.is_connected().then_some(device);
            match instance::goldfish_instance(&self.config, id, None, info) {
                Ok(instance) => instances.push(instance),
                Err(err) => debug!(target: "avdctl", "skipping goldfish id {id}: {err}"),
            }
        }
        instances
    }

    /// Single-target lookup with precise error propagation: a missing config
    /// is `ConfigError::NotFound`, a broken one `ConfigError::Malformed`.
    pub fn get(&self, id: InstanceId) -> Result<Instance> {
        validate_id(id)?;
        let record = self.record_for(id)?;
        Ok(self.build_local(&record))
    }

    /// Completes a remote description with what this host can observe: ssh
    /// tunnels in the process table supply the forwarded ports, and adb
    /// supplies the device details behind the forwarded adb endpoint. Fields
    /// the caller already filled in are left alone.
    pub fn remote(&self, mut data: RemoteInstanceData) -> Instance {
        if let Some(ip) = data.ip.clone() {
            if data.forwarded.is_none() {
                data.forwarded = self.runner.forwarded_ports(
                    &ip,
                    self.config.base_adb_port,
                    self.config.base_vnc_port,
                );
            }
            if data.webrtc_forward_port.is_none() {
                data.webrtc_forward_port = self.runner.webrtc_forward_port(&ip);
            }
            if data.device.is_none() {
                if let Some(adb_port) = data.forwarded.as_ref().and_then(|ports| ports.adb) {
                    data.device = self.adb.device_for_serial(&format!("127.0.0.1:{adb_port}"));
                }
            }
        }
        instance::remote_instance(data)
    }

    /// Stops one instance and removes its home directory, holding the
    /// instance lock for the whole operation. The adb cleanup and the lock
    /// release happen no matter how the stop went; the home directory
    /// survives a failed stop so the state stays inspectable.
    pub fn delete(&self, id: InstanceId) -> Result<()> {
        validate_id(id)?;
        let paths = InstancePaths::new(&self.config, id);
        let lock = InstanceLock::new(&paths.lock);
        let _guard = lock.acquire(self.config.lock_timeout)?;

        let record = self.record_for(id)?;
        let stop_result = self.runner.stop(&record);

        // The fixed adb port goes to the next instance right away; a stale
        // device entry would attach to the wrong one.
        if let Some(port) = record.adb_port {
            self.adb.disconnect_with_retry(&format!("0.0.0.0:{port}"));
        }

        stop_result?;
        if paths.home.exists() {
            fs::remove_dir_all(&paths.home)?;
            debug!(target: "avdctl", "removed {}", paths.home.display());
        }
        info!(target: "avdctl", "deleted local instance {id}");
        Ok(())
    }

    /// Deletes every id independently; one failure never stops the rest.
    pub fn delete_all(&self, ids: &[InstanceId]) -> Vec<DeleteReport> {
        ids.iter()
            .map(|&id| {
                let result = self.delete(id);
                if let Err(err) = &result {
                    warn!(target: "avdctl", "failed to delete instance {id}: {err}");
                }
                DeleteReport { id, result }
            })
            .collect()
    }

    /// Candidate (id, config path) pairs: the single-instance config under
    /// the user home counts as id 1, then every subdirectory of the parent
    /// temp dir whose name matches the instance naming convention.
    fn instance_configs(&self) -> Result<Vec<(InstanceId, PathBuf)>> {
        let mut pairs = Vec::new();
        if let Some(path) = dirs::find_default_config(&self.config) {
            pairs.push((1, path));
        }
        let entries = match fs::read_dir(&self.config.cvd_temp_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(pairs),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(id) = dirs::parse_instance_id(&name) else {
                continue;
            };
            ids.push(id);
        }
        ids.sort_unstable();
        for id in ids {
            if let Some(path) = InstancePaths::new(&self.config, id).find_config() {
                pairs.push((id, path));
            }
        }
        Ok(pairs)
    }

    fn record_for(&self, id: InstanceId) -> Result<InstanceRecord> {
        let paths = InstancePaths::new(&self.config, id);
        if let Some(path) = paths.find_config() {
            return runtime_config::read_for_instance(&path, id);
        }
        // A single-instance launcher writes its config under the user home;
        // that config can describe any id.
        if let Some(path) = dirs::find_default_config(&self.config) {
            let record = runtime_config::read_for_instance(&path, 1)?;
            if record.instance_id == id {
                return Ok(record);
            }
        }
        Err(ConfigError::NotFound {
            path: paths.assembly_config,
        }
        .into())
    }

    /// Combines the config record with everything probed live: the status
    /// probe picks Configured vs Running, the fleet report contributes
    /// display and webrtc port, adb contributes device details.
    fn build_local(&self, record: &InstanceRecord) -> Instance {
        let state = if self.runner.probe_status(record) {
            InstanceState::Running
        } else {
            InstanceState::Configured
        };
        let fleet = self.runner.query_fleet(record);
        let (display, webrtc_port) = match &fleet {
            Some(info) => (info.display_label(), info.webrtc_port_number()),
            None => (None, None),
        };
        let device = record
            .adb_port
            .and_then(|port| self.adb.device_for_serial(&format!("0.0.0.0:{port}")));
        instance::from_local_record(&self.config, record, state, display, webrtc_port, device)
    }
}

fn validate_id(id: InstanceId) -> Result<()> {
    if id < 1 {
        return Err(Error::InvalidArgument(format!(
            "instance id must be >= 1, got {id}"
        )));
    }
    Ok(())
}
