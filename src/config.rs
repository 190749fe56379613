use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AvdctlConfig {
    /// Parent temp directory holding per-instance cuttlefish homes and locks.
    pub cvd_temp_dir: PathBuf,
    /// Parent temp directory holding goldfish instance dirs and locks.
    pub goldfish_temp_dir: PathBuf,
    /// Home directory probed for the default single-instance config.
    pub user_home: PathBuf,
    pub runtime_dir_name: String,
    pub assembly_dir_name: String,
    pub config_file_name: String,
    pub cvd_bin_dir: PathBuf,
    pub cvd_bin: String,
    pub cvd_status_bin: String,
    pub stop_cvd_bin: String,
    pub cvd_server_process: String,
    /// Substring in `cvd stop` output that triggers the stop_cvd fallback.
    pub stop_error_marker: String,
    pub command_timeout: Duration,
    pub lock_timeout: Duration,
    pub adb_bin: String,
    pub base_console_port: u16,
    pub base_adb_port: u16,
    pub base_vnc_port: u16,
    /// Fixed signaling-server port an ssh tunnel forwards webrtc traffic to.
    pub webrtc_sig_port: u16,
    pub adb_transport_max_port: u16,
}

impl Default for AvdctlConfig {
    fn default() -> Self {
        let temp = env::temp_dir();
        Self {
            cvd_temp_dir: temp.join("avdctl_cvd_temp"),
            goldfish_temp_dir: temp.join("avdctl_gf_temp"),
            user_home: env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/root")),
            runtime_dir_name: "cuttlefish_runtime".to_string(),
            assembly_dir_name: "cuttlefish_assembly".to_string(),
            config_file_name: "cuttlefish_config.json".to_string(),
            cvd_bin_dir: PathBuf::from("host_bins/bin"),
            cvd_bin: "cvd".to_string(),
            cvd_status_bin: "cvd_status".to_string(),
            stop_cvd_bin: "stop_cvd".to_string(),
            cvd_server_process: "cvd_server".to_string(),
            stop_error_marker: "cvd_internal_stop E".to_string(),
            command_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(30),
            adb_bin: "adb".to_string(),
            base_console_port: 5554,
            base_adb_port: 6520,
            // Kept a full id block away from the adb base so no two ids can
            // ever collide; the historical 6444 base sits only 76 slots under
            // the adb base and is still accepted as an override.
            base_vnc_port: 7520,
            webrtc_sig_port: 8443,
            adb_transport_max_port: 5585,
        }
    }
}
