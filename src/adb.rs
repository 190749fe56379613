use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AvdctlConfig;

/// adb reports this state for a device that answers commands.
const STATE_DEVICE: &str = "device";

const DISCONNECT_ATTEMPTS: u32 = 6;
const DISCONNECT_POLL: Duration = Duration::from_millis(500);

/// One row of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdbDevice {
    pub serial: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
}

impl AdbDevice {
    pub fn is_connected(&self) -> bool {
        self.state == STATE_DEVICE
    }
}

/// Parses the output of `adb devices -l`: a header line, then one device per
/// line as `<serial> <state> [key:value ...]`. Unrecognized key:value fields
/// are ignored so newer adb versions keep parsing.
pub fn parse_devices_output(output: &str) -> Vec<AdbDevice> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("List of devices"))
        .filter_map(parse_device_line)
        .collect()
}

fn parse_device_line(line: &str) -> Option<AdbDevice> {
    let mut fields = line.split_whitespace();
    let serial = fields.next()?.to_string();
    let state = fields.next()?.to_string();
    let mut device = AdbDevice {
        serial,
        state,
        product: None,
        model: None,
        device: None,
        transport_id: None,
    };
    for field in fields {
        let Some((key, value)) = field.split_once(':') else {
            continue;
        };
        match key {
            "product" => device.product = Some(value.to_string()),
            "model" => device.model = Some(value.to_string()),
            "device" => device.device = Some(value.to_string()),
            "transport_id" => device.transport_id = Some(value.to_string()),
            _ => {}
        }
    }
    Some(device)
}

/// Thin wrapper over the host adb binary. Every call shells out; adb itself
/// owns the device state.
#[derive(Debug, Clone)]
pub struct AdbTools {
    adb_bin: String,
}

impl AdbTools {
    pub fn new(config: &AvdctlConfig) -> Self {
        Self {
            adb_bin: config.adb_bin.clone(),
        }
    }

    pub fn devices(&self) -> Result<Vec<AdbDevice>> {
        let output = Command::new(&self.adb_bin)
            .args(["devices", "-l"])
            .output()
            .with_context(|| format!("running {} devices -l", self.adb_bin))?;
        if !output.status.success() {
            bail!(
                "{} devices -l returned {}: {}",
                self.adb_bin,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(parse_devices_output(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Connected entry for a serial. Probe failures degrade to `None`; a
    /// device stuck in `offline` or `unauthorized` does not count.
    pub fn device_for_serial(&self, serial: &str) -> Option<AdbDevice> {
        match self.devices() {
            Ok(devices) => devices
                .into_iter()
                .find(|device| device.serial == serial && device.is_connected()),
            Err(err) => {
                debug!(target: "avdctl", "adb probe for {serial} failed: {err:#}");
                None
            }
        }
    }

    /// Emulator serials need `adb emu kill`; TCP endpoints use
    /// `adb disconnect`.
    pub fn disconnect(&self, serial: &str) -> Result<()> {
        let mut command = Command::new(&self.adb_bin);
        if serial.starts_with("emulator-") {
            command.args(["-s", serial, "emu", "kill"]);
        } else {
            command.args(["disconnect", serial]);
        }
        let output = command
            .output()
            .with_context(|| format!("disconnecting {serial}"))?;
        if !output.status.success() {
            bail!(
                "adb disconnect {} returned {}: {}",
                serial,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Disconnects and waits until the serial is gone from the device list.
    /// The adb port is handed to the next instance right after a delete, so a
    /// lingering entry would attach to the wrong device.
    pub fn disconnect_with_retry(&self, serial: &str) -> bool {
        for attempt in 1..=DISCONNECT_ATTEMPTS {
            if let Err(err) = self.disconnect(serial) {
                debug!(
                    target: "avdctl",
                    "adb disconnect {serial} attempt {attempt}: {err:#}"
                );
            }
            if !self.serial_is_listed(serial) {
                return true;
            }
            thread::sleep(DISCONNECT_POLL);
        }
        warn!(
            target: "avdctl",
            "adb device {serial} is still listed after {DISCONNECT_ATTEMPTS} disconnect attempts"
        );
        false
    }

    fn serial_is_listed(&self, serial: &str) -> bool {
        self.devices()
            .map(|devices| devices.iter().any(|device| device.serial == serial))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES_OUTPUT: &str = "List of devices attached\n\
        0.0.0.0:6520           device product:cf_x86_64_phone model:Cuttlefish_x86_64 device:vsoc_x86_64 transport_id:1\n\
        emulator-5554          device product:sdk_gphone_x86_64 model:sdk_gphone_x86_64 device:generic_x86_64 transport_id:2\n\
        192.168.1.7:5555       offline transport_id:3\n\n";

    #[test]
    fn parses_long_listing() {
        let devices = parse_devices_output(DEVICES_OUTPUT);
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].serial, "0.0.0.0:6520");
        assert_eq!(devices[0].state, "device");
        assert_eq!(devices[0].product.as_deref(), Some("cf_x86_64_phone"));
        assert_eq!(devices[0].model.as_deref(), Some("Cuttlefish_x86_64"));
        assert_eq!(devices[0].device.as_deref(), Some("vsoc_x86_64"));
        assert_eq!(devices[0].transport_id.as_deref(), Some("1"));
        assert!(devices[0].is_connected());

        assert_eq!(devices[1].serial, "emulator-5554");
        assert!(devices[1].is_connected());

        assert_eq!(devices[2].serial, "192.168.1.7:5555");
        assert_eq!(devices[2].state, "offline");
        assert!(devices[2].product.is_none());
        assert!(!devices[2].is_connected());
    }

    #[test]
    fn ignores_unknown_fields() {
        let devices =
            parse_devices_output("List of devices attached\nX1A8 device usb:1-4 features:abc\n");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "X1A8");
        assert!(devices[0].product.is_none());
    }

    #[test]
    fn empty_listing_is_empty() {
        assert!(parse_devices_output("List of devices attached\n\n").is_empty());
        assert!(parse_devices_output("").is_empty());
    }
}
