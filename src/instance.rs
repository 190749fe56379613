use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adb::AdbDevice;
use crate::config::AvdctlConfig;
use crate::dirs::{goldfish_instance_name, instance_name, GoldfishPaths, InstancePaths};
use crate::error::Result;
use crate::ports::{allocate_ports, goldfish_serial, AvdType};
use crate::runtime_config::InstanceRecord;

pub type InstanceId = u64;

const LOCAL_ZONE: &str = "local";
const UNABLE_TO_CALCULATE: &str = "Unable to calculate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Local,
    LocalGoldfish,
    Remote,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Local => "cuttlefish",
            InstanceKind::LocalGoldfish => "goldfish",
            InstanceKind::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    #[default]
    Unknown,
    Configured,
    Running,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Unknown => "unknown",
            InstanceState::Configured => "configured",
            InstanceState::Running => "running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoConnect {
    Webrtc,
    Vnc,
    Adb,
}

impl AutoConnect {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoConnect::Webrtc => "webrtc",
            AutoConnect::Vnc => "vnc",
            AutoConnect::Adb => "adb",
        }
    }
}

/// Local ports an ssh tunnel forwards to a remote device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardedPorts {
    pub adb: Option<u16>,
    pub vnc: Option<u16>,
}

/// One virtual device as the registry reports it. A single struct covers all
/// kinds; fields a kind cannot know stay `None`.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<InstanceId>,
    pub name: String,
    pub kind: InstanceKind,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adb_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webrtc_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webrtc_forward_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_connect: Option<AutoConnect>,
    pub device_serial: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<AdbDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub virtual_disk_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_tunnel_connected: Option<bool>,
}

impl Instance {
    pub fn fullname(&self) -> String {
        format!(
            "device serial: {} ({}) elapsed time: {}",
            self.device_serial,
            self.name,
            self.elapsed_time.as_deref().unwrap_or("unknown")
        )
    }

    /// Multi-line report for the text output, one `label: value` line per
    /// known field.
    pub fn summary(&self) -> String {
        const INDENT: &str = "   ";
        let mut lines = vec![format!(" name: {}", self.name)];
        if let Some(ip) = &self.ip {
            lines.push(format!("{INDENT} IP: {ip}"));
        }
        if let Some(created_at) = &self.created_at {
            lines.push(format!("{INDENT} create time: {created_at}"));
        }
        if let Some(elapsed) = &self.elapsed_time {
            lines.push(format!("{INDENT} elapsed time: {elapsed}"));
        }
        lines.push(format!("{INDENT} status: {}", self.state.as_str()));
        lines.push(format!("{INDENT} avd type: {}", self.kind.as_str()));
        if let Some(display) = &self.display {
            lines.push(format!("{INDENT} display: {display}"));
        }
        if let Some(vnc_port) = self.vnc_port {
            lines.push(format!("{INDENT} vnc: 127.0.0.1:{vnc_port}"));
        }
        if let Some(zone) = &self.zone {
            lines.push(format!("{INDENT} zone: {zone}"));
        }
        if let Some(auto_connect) = self.auto_connect {
            lines.push(format!("{INDENT} autoconnect: {}", auto_connect.as_str()));
        }
        if let Some(webrtc_port) = self.webrtc_port {
            lines.push(format!("{INDENT} webrtc port: {webrtc_port}"));
        }
        if let Some(forward_port) = self.webrtc_forward_port {
            lines.push(format!("{INDENT} webrtc forward port: {forward_port}"));
        }
        match (self.adb_port, &self.device_info) {
            (Some(adb_port), Some(info)) => {
                // The bind address doubles as the serial host for local
                // devices that listen on the wildcard address.
                let serial_ip = if self.ip.as_deref() == Some("0.0.0.0") {
                    "0.0.0.0"
                } else {
                    "127.0.0.1"
                };
                lines.push(format!("{INDENT} adb serial: {serial_ip}:{adb_port}"));
                if let Some(product) = &info.product {
                    lines.push(format!("{INDENT} product: {product}"));
                }
                if let Some(model) = &info.model {
                    lines.push(format!("{INDENT} model: {model}"));
                }
                if let Some(device) = &info.device {
                    lines.push(format!("{INDENT} device: {device}"));
                }
                if let Some(transport_id) = &info.transport_id {
                    lines.push(format!("{INDENT} transport_id: {transport_id}"));
                }
            }
            _ => lines.push(format!("{INDENT} adb serial: disconnected")),
        }
        if let Some(instance_dir) = &self.instance_dir {
            lines.push(format!(
                "{INDENT} instance home: {}",
                instance_dir.display()
            ));
        }
        lines.join("\n")
    }
}

/// Builds the local cuttlefish view from its runtime config record plus the
/// probed state and whatever dynamic data the caller gathered. Ports come
/// from the config file, never recomputed.
pub fn from_local_record(
    config: &AvdctlConfig,
    record: &InstanceRecord,
    state: InstanceState,
    display_override: Option<String>,
    webrtc_port: Option<u16>,
    device: Option<AdbDevice>,
) -> Instance {
    let id = record.instance_id;
    let device_serial = match record.adb_port {
        Some(port) => format!("0.0.0.0:{port}"),
        None => "unknown".to_string(),
    };
    let display = display_override
        .or_else(|| display_string(record.x_res, record.y_res, record.dpi));
    let instance_dir = record
        .instance_dir
        .clone()
        .or_else(|| Some(InstancePaths::new(config, id).runtime));
    Instance {
        id: Some(id),
        name: instance_name(id),
        kind: InstanceKind::Local,
        state,
        ip: Some("0.0.0.0".to_string()),
        adb_port: record.adb_port,
        vnc_port: record.vnc_port,
        webrtc_port,
        webrtc_forward_port: None,
        display,
        created_at: None,
        elapsed_time: None,
        auto_connect: auto_connect(webrtc_port, record.vnc_port, record.adb_port),
        device_serial,
        device_info: device,
        zone: Some(LOCAL_ZONE.to_string()),
        instance_dir,
        virtual_disk_paths: record.virtual_disk_paths.clone(),
        ssh_tunnel_connected: None,
    }
}

/// Builds the goldfish view from its id. Ports and serial follow the console
/// port convention; the id must be in the allocatable range.
pub fn goldfish_instance(
    config: &AvdctlConfig,
    id: InstanceId,
    created_at: Option<String>,
    device: Option<AdbDevice>,
) -> Result<Instance> {
    let ports = allocate_ports(config, id, AvdType::Goldfish)?;
    let console_port = ports.console.unwrap_or(config.base_console_port);
    let device_serial = goldfish_serial(console_port);
    let elapsed_time = created_at.as_deref().map(elapsed_time_label);
    let state = if device.is_some() {
        InstanceState::Running
    } else {
        InstanceState::Unknown
    };
    Ok(Instance {
        id: Some(id),
        name: goldfish_instance_name(id),
        kind: InstanceKind::LocalGoldfish,
        state,
        ip: Some("127.0.0.1".to_string()),
        adb_port: Some(ports.adb),
        vnc_port: None,
        webrtc_port: None,
        webrtc_forward_port: None,
        display: None,
        created_at,
        elapsed_time,
        auto_connect: Some(AutoConnect::Adb),
        device_serial,
        device_info: device,
        zone: Some(LOCAL_ZONE.to_string()),
        instance_dir: Some(GoldfishPaths::new(config, id).home),
        virtual_disk_paths: Vec::new(),
        ssh_tunnel_connected: None,
    })
}

/// Caller-gathered facts about a remote device; the registry never talks to
/// a cloud API itself.
#[derive(Debug, Clone, Default)]
pub struct RemoteInstanceData {
    pub name: String,
    pub ip: Option<String>,
    pub create_time: Option<String>,
    pub status: Option<String>,
    pub display: Option<String>,
    pub zone_url: Option<String>,
    pub webrtc_port: Option<u16>,
    pub webrtc_forward_port: Option<u16>,
    pub forwarded: Option<ForwardedPorts>,
    pub device: Option<AdbDevice>,
}

/// Builds the remote view. The serial reflects connectivity: the forwarded
/// adb endpoint when a device answers, "not connected" when it does not, and
/// "terminated" when the instance no longer has an address at all.
pub fn remote_instance(data: RemoteInstanceData) -> Instance {
    let forwarded = data.forwarded.unwrap_or_default();
    let elapsed_time = data.create_time.as_deref().map(elapsed_time_label);
    let (device_serial, ssh_tunnel_connected) = if data.ip.is_some() {
        let serial = match (forwarded.adb, &data.device) {
            (Some(adb_port), Some(_)) => format!("127.0.0.1:{adb_port}"),
            _ => "not connected".to_string(),
        };
        (serial, forwarded.adb.is_some())
    } else {
        ("terminated".to_string(), false)
    };
    let state = match data.status.as_deref() {
        Some(status) if status.eq_ignore_ascii_case("running") => InstanceState::Running,
        _ => InstanceState::Unknown,
    };
    // A forwarded webrtc port counts as a webrtc endpoint even when the
    // remote port itself was never reported.
    let webrtc_endpoint = data.webrtc_port.or(data.webrtc_forward_port);
    Instance {
        id: None,
        name: data.name,
        kind: InstanceKind::Remote,
        state,
        ip: data.ip,
        adb_port: forwarded.adb,
        vnc_port: forwarded.vnc,
        webrtc_port: data.webrtc_port,
        webrtc_forward_port: data.webrtc_forward_port,
        display: data.display,
        created_at: data.create_time,
        elapsed_time,
        auto_connect: auto_connect(webrtc_endpoint, forwarded.vnc, forwarded.adb),
        device_serial,
        device_info: data.device,
        zone: data.zone_url.as_deref().and_then(zone_from_url),
        instance_dir: None,
        virtual_disk_paths: Vec::new(),
        ssh_tunnel_connected: Some(ssh_tunnel_connected),
    }
}

// First populated endpoint wins, richest first.
pub fn auto_connect(
    webrtc_port: Option<u16>,
    vnc_port: Option<u16>,
    adb_port: Option<u16>,
) -> Option<AutoConnect> {
    if webrtc_port.is_some() {
        Some(AutoConnect::Webrtc)
    } else if vnc_port.is_some() {
        Some(AutoConnect::Vnc)
    } else if adb_port.is_some() {
        Some(AutoConnect::Adb)
    } else {
        None
    }
}

pub fn display_string(x_res: Option<u32>, y_res: Option<u32>, dpi: Option<u32>) -> Option<String> {
    match (x_res, y_res, dpi) {
        (Some(x), Some(y), Some(dpi)) => Some(format!("{x}x{y} ({dpi})")),
        _ => None,
    }
}

/// "us-central1-c" from a resource URL ending in `/zones/us-central1-c`.
pub fn zone_from_url(zone_url: &str) -> Option<String> {
    match zone_url.rsplit_once("/zones/") {
        Some((_, zone)) if !zone.is_empty() => Some(zone.to_string()),
        _ => {
            debug!(target: "avdctl", "no zone name in {:?}", zone_url);
            None
        }
    }
}

/// Human elapsed-time label for a creation timestamp. Accepts RFC 3339 and
/// the bare `YYYY-mm-dd HH:MM:SS` form (interpreted as local time); anything
/// else degrades to a fixed marker instead of failing the listing.
pub fn elapsed_time_label(created_at: &str) -> String {
    if let Ok(created) = DateTime::parse_from_rfc3339(created_at) {
        return format_elapsed(Utc::now().signed_duration_since(created.with_timezone(&Utc)));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(created_at, "%Y-%m-%d %H:%M:%S") {
        if let Some(created) = Local.from_local_datetime(&naive).single() {
            return format_elapsed(Local::now().signed_duration_since(created));
        }
    }
    debug!(target: "avdctl", "cannot parse create time {:?}", created_at);
    UNABLE_TO_CALCULATE.to_string()
}

fn format_elapsed(delta: chrono::Duration) -> String {
    let total_secs = delta.num_seconds().max(0);
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours}:{minutes:02}:{seconds:02}")
    }
}
