use std::env;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AvdctlConfig;
use crate::error::{Error, Result};
use crate::instance::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvdType {
    Cuttlefish,
    Goldfish,
}

/// Ports derived from an instance id. The webrtc port is never derived here;
/// it is resolved dynamically from the fleet query and stays `None` until
/// that lookup answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortSet {
    pub console: Option<u16>,
    pub adb: u16,
    pub vnc: Option<u16>,
    pub webrtc: Option<u16>,
}

pub fn allocate_ports(config: &AvdctlConfig, id: InstanceId, avd_type: AvdType) -> Result<PortSet> {
    if id < 1 {
        return Err(Error::InvalidArgument(format!(
            "instance id must be >= 1, got {id}"
        )));
    }
    match avd_type {
        AvdType::Goldfish => {
            // The emulator insists on an even console port; adb is the odd
            // port right above it.
            let offset = (id - 1).checked_mul(2).ok_or_else(|| port_overflow(id))?;
            let console = offset_port(config.base_console_port, offset, id)?;
            let adb = console.checked_add(1).ok_or_else(|| port_overflow(id))?;
            Ok(PortSet {
                console: Some(console),
                adb,
                vnc: None,
                webrtc: None,
            })
        }
        AvdType::Cuttlefish => {
            let adb = offset_port(config.base_adb_port, id - 1, id)?;
            let vnc = offset_port(config.base_vnc_port, id - 1, id)?;
            Ok(PortSet {
                console: None,
                adb,
                vnc: Some(vnc),
                webrtc: None,
            })
        }
    }
}

fn offset_port(base: u16, offset: u64, id: InstanceId) -> Result<u16> {
    u64::from(base)
        .checked_add(offset)
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| port_overflow(id))
}

fn port_overflow(id: InstanceId) -> Error {
    Error::InvalidArgument(format!("instance id {id} maps past the end of the port range"))
}

pub fn goldfish_serial(console_port: u16) -> String {
    format!("emulator-{console_port}")
}

/// Maps an `emulator-<console_port>` serial back to the instance id it was
/// allocated for. Serials that do not carry the emulator prefix or whose
/// port sits below the console base yield `None`.
pub fn goldfish_id_for_serial(config: &AvdctlConfig, serial: &str) -> Option<InstanceId> {
    let digits = serial.strip_prefix("emulator-")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port: u16 = digits.parse().ok()?;
    if port < config.base_console_port {
        return None;
    }
    Some(u64::from(port - config.base_console_port) / 2 + 1)
}

/// Number of goldfish instances adb is willing to track, from
/// ADB_LOCAL_TRANSPORT_MAX_PORT. Unset, unparsable, or out-of-range values
/// fall back to the configured cap.
pub fn goldfish_max_instances(config: &AvdctlConfig) -> u64 {
    let raw = env::var("ADB_LOCAL_TRANSPORT_MAX_PORT").ok();
    goldfish_max_instances_from(config, raw.as_deref())
}

fn goldfish_max_instances_from(config: &AvdctlConfig, raw: Option<&str>) -> u64 {
    let max_port = match raw.map(str::parse::<u16>) {
        Some(Ok(port)) if port >= config.base_console_port => port,
        Some(other) => {
            debug!(target: "avdctl", "ignoring ADB_LOCAL_TRANSPORT_MAX_PORT {:?}", other);
            config.adb_transport_max_port
        }
        None => config.adb_transport_max_port,
    };
    (u64::from(max_port) + 1 - u64::from(config.base_console_port)) / 2
}
