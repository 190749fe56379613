use std::ffi::OsString;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AvdctlConfig;
use crate::dirs::InstancePaths;
use crate::error::{DeleteError, ProcessError, StopFailure};
use crate::instance::ForwardedPorts;
use crate::runtime_config::InstanceRecord;

const ENV_CUTTLEFISH_CONFIG_FILE: &str = "CUTTLEFISH_CONFIG_FILE";
const ENV_CUTTLEFISH_INSTANCE: &str = "CUTTLEFISH_INSTANCE";
const ENV_CVD_HOME: &str = "HOME";
const ENV_ANDROID_SOONG_HOST_OUT: &str = "ANDROID_SOONG_HOST_OUT";

const PS_BIN: &str = "ps";
// -ww keeps the full command line; lstart,cmd matches what the scan expects.
const PS_ARGS: [&str; 2] = ["-wweo", "lstart,cmd"];

const WAIT_POLL: Duration = Duration::from_millis(200);

/// What one finished subprocess left behind. `code` is `None` when the
/// process was killed by a signal.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Runs a command with captured output, killing it at the deadline. The
/// pipes are drained on their own threads so a chatty tool cannot fill the
/// pipe buffer and wedge the wait loop.
fn run_with_timeout(
    mut command: Command,
    label: &str,
    timeout: Duration,
) -> Result<CommandOutcome, ProcessError> {
    debug!(target: "avdctl", "running {label}");
    let started = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: label.to_string(),
            source,
        })?;
    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let deadline = started + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                if let Err(err) = child.kill() {
                    warn!(target: "avdctl", "failed to kill {label}: {err}");
                }
                let _ = child.wait();
                // Readers are not joined here: an orphaned grandchild can
                // keep the pipe open well past the deadline.
                return Err(ProcessError::TimedOut {
                    command: label.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(WAIT_POLL),
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessError::Wait {
                    command: label.to_string(),
                    source,
                });
            }
        }
    };

    let stdout = join_reader(stdout_reader);
    let stderr = join_reader(stderr_reader);
    debug!(
        target: "avdctl",
        "{label} finished in {} ms with code {:?}",
        started.elapsed().as_millis(),
        status.code()
    );
    Ok(CommandOutcome {
        code: status.code(),
        stdout,
        stderr,
    })
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Option<thread::JoinHandle<String>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// One device block as `cvd fleet` reports it. The tool prints ports as JSON
/// strings, so they stay strings here and are parsed on demand.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetInfo {
    #[serde(default)]
    pub adb_serial: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub displays: Vec<String>,
    #[serde(default)]
    pub web_access: Option<String>,
    #[serde(default)]
    pub webrtc_port: Option<String>,
}

impl FleetInfo {
    /// Joined display list, `None` when the tool reported none.
    pub fn display_label(&self) -> Option<String> {
        if self.displays.is_empty() {
            None
        } else {
            Some(self.displays.join(", "))
        }
    }

    pub fn webrtc_port_number(&self) -> Option<u16> {
        self.webrtc_port.as_deref().and_then(|port| port.parse().ok())
    }
}

/// `cvd fleet` prefixes its JSON with client/server version warnings, so
/// decoding starts at the first `{`. No `{` means no fleet report.
fn parse_fleet_output(output: &str) -> Option<FleetInfo> {
    let start = output.find('{')?;
    match serde_json::from_str(&output[start..]) {
        Ok(info) => Some(info),
        Err(err) => {
            warn!(target: "avdctl", "cannot decode fleet output: {err}");
            None
        }
    }
}

/// A process counts as running when some `ps` line has nonempty text on both
/// sides of `<name> `. Text scraping, but `ps` is the only portable source.
fn process_listed(ps_output: &str, process: &str) -> bool {
    let pattern = format!("(.+)({} )(.+)", regex::escape(process));
    match Regex::new(&pattern) {
        Ok(matcher) => ps_output.lines().any(|line| matcher.is_match(line)),
        Err(err) => {
            warn!(target: "avdctl", "bad process pattern {pattern:?}: {err}");
            false
        }
    }
}

/// Finds an ssh tunnel whose `-L` arguments forward local ports to the
/// instance's fixed adb and vnc ports, in that order, on a line mentioning
/// the instance address.
fn scan_ssh_tunnel(
    ps_output: &str,
    ip: &str,
    adb_target: u16,
    vnc_target: u16,
) -> Option<ForwardedPorts> {
    let pattern = format!(
        r"((.*\s*-L\s)(?P<adb>\d+):127\.0\.0\.1:{adb_target})((.*\s*-L\s)(?P<vnc>\d+):127\.0\.0\.1:{vnc_target})(.+{})",
        regex::escape(ip)
    );
    let matcher = match Regex::new(&pattern) {
        Ok(matcher) => matcher,
        Err(err) => {
            warn!(target: "avdctl", "bad tunnel pattern {pattern:?}: {err}");
            return None;
        }
    };
    for line in ps_output.lines() {
        let Some(captures) = matcher.captures(line) else {
            continue;
        };
        let adb = captures.name("adb").and_then(|m| m.as_str().parse().ok());
        let vnc = captures.name("vnc").and_then(|m| m.as_str().parse().ok());
        if adb.is_some() {
            return Some(ForwardedPorts { adb, vnc });
        }
    }
    None
}

/// Local port an ssh tunnel forwards to the fixed webrtc signaling port on
/// the instance at `ip`.
fn scan_webrtc_tunnel(ps_output: &str, ip: &str, webrtc_target: u16) -> Option<u16> {
    let pattern = format!(
        r"(.*\s*-L\s)(?P<webrtc>\d+):127\.0\.0\.1:{webrtc_target}(.+{})",
        regex::escape(ip)
    );
    let matcher = match Regex::new(&pattern) {
        Ok(matcher) => matcher,
        Err(err) => {
            warn!(target: "avdctl", "bad webrtc pattern {pattern:?}: {err}");
            return None;
        }
    };
    ps_output.lines().find_map(|line| {
        matcher
            .captures(line)
            .and_then(|captures| captures.name("webrtc"))
            .and_then(|m| m.as_str().parse().ok())
    })
}

/// Boundary to the device runtime binaries. Every call shells out under the
/// instance environment; nothing is cached between calls.
#[derive(Debug, Clone)]
pub struct CvdRunner {
    config: AvdctlConfig,
}

impl CvdRunner {
    pub fn new(config: AvdctlConfig) -> Self {
        Self { config }
    }

    /// Environment the runtime tools use to find this instance.
    fn cvd_env(&self, record: &InstanceRecord) -> Vec<(&'static str, OsString)> {
        let paths = InstancePaths::new(&self.config, record.instance_id);
        let mut env = vec![
            (
                ENV_CUTTLEFISH_CONFIG_FILE,
                record.config_path.clone().into_os_string(),
            ),
            (ENV_CVD_HOME, paths.home.into_os_string()),
            (
                ENV_CUTTLEFISH_INSTANCE,
                record.instance_id.to_string().into(),
            ),
        ];
        if let Some(parent) = record
            .cvd_tools_path
            .as_deref()
            .and_then(Path::parent)
        {
            env.push((
                ENV_ANDROID_SOONG_HOST_OUT,
                parent.to_path_buf().into_os_string(),
            ));
        }
        env
    }

    /// Asks `cvd fleet` about this instance. Any failure means the fleet
    /// report is unavailable, never an error for the caller.
    pub fn query_fleet(&self, record: &InstanceRecord) -> Option<FleetInfo> {
        let paths = InstancePaths::new(&self.config, record.instance_id);
        let cvd_bin = paths.cvd_tool_dir(&self.config).join(&self.config.cvd_bin);
        if !cvd_bin.exists() {
            warn!(target: "avdctl", "cvd tool doesn't exist: {}", cvd_bin.display());
            return None;
        }
        if !self.is_process_running(&self.config.cvd_server_process) {
            warn!(
                target: "avdctl",
                "the {} process is not running", self.config.cvd_server_process
            );
            return None;
        }
        let label = format!("{} fleet", cvd_bin.display());
        let mut command = Command::new(&cvd_bin);
        command.arg("fleet").envs(self.cvd_env(record));
        match run_with_timeout(command, &label, self.config.command_timeout) {
            Ok(outcome) => parse_fleet_output(&outcome.stdout),
            Err(err) => {
                warn!(target: "avdctl", "failed to query fleet: {err}");
                None
            }
        }
    }

    /// Distinguishes a running instance from a merely configured one via
    /// `cvd_status` (exit 0 means running). A missing tool degrades to
    /// not-running.
    pub fn probe_status(&self, record: &InstanceRecord) -> bool {
        let Some(tools_dir) = record.cvd_tools_path.as_deref() else {
            debug!(
                target: "avdctl",
                "no cvd tools path in {}", record.config_path.display()
            );
            return false;
        };
        let status_bin = tools_dir.join(&self.config.cvd_status_bin);
        if !status_bin.exists() {
            warn!(
                target: "avdctl",
                "cvd status tool doesn't exist: {}", status_bin.display()
            );
            return false;
        }
        let label = status_bin.display().to_string();
        let mut command = Command::new(&status_bin);
        command.envs(self.cvd_env(record));
        match run_with_timeout(command, &label, self.config.command_timeout) {
            Ok(outcome) if outcome.success() => true,
            Ok(outcome) => {
                debug!(
                    target: "avdctl",
                    "instance {} is not active: {}",
                    record.instance_id,
                    outcome.combined().trim()
                );
                false
            }
            Err(err) => {
                warn!(target: "avdctl", "failed to run {}: {err}", self.config.cvd_status_bin);
                false
            }
        }
    }

    /// Two-tier stop: `cvd stop` first, then `stop_cvd` when the primary
    /// attempt fails, times out, or its output carries the configured error
    /// marker. Both outcomes travel in the error so the caller sees exactly
    /// what happened.
    pub fn stop(&self, record: &InstanceRecord) -> Result<(), DeleteError> {
        let id = record.instance_id;
        let bin_dir = InstancePaths::new(&self.config, id).cvd_tool_dir(&self.config);
        let primary = match self.run_stop(record, &bin_dir.join(&self.config.cvd_bin), true) {
            Ok(()) => return Ok(()),
            Err(failure) => failure,
        };
        debug!(
            target: "avdctl",
            "cvd stop failed for instance {id} ({primary}), trying {}",
            self.config.stop_cvd_bin
        );
        match self.run_stop(record, &bin_dir.join(&self.config.stop_cvd_bin), false) {
            Ok(()) => Ok(()),
            Err(fallback) => Err(DeleteError {
                id,
                primary,
                fallback,
            }),
        }
    }

    fn run_stop(
        &self,
        record: &InstanceRecord,
        tool: &Path,
        with_stop_arg: bool,
    ) -> Result<(), StopFailure> {
        let label = if with_stop_arg {
            format!("{} stop", tool.display())
        } else {
            tool.display().to_string()
        };
        let mut command = Command::new(tool);
        if with_stop_arg {
            command.arg("stop");
        }
        command.envs(self.cvd_env(record));
        let outcome = run_with_timeout(command, &label, self.config.command_timeout)?;
        if !outcome.success() {
            return Err(StopFailure::Process(ProcessError::Failed {
                command: label,
                code: outcome.code,
                output: outcome.combined().trim().to_string(),
            }));
        }
        let combined = outcome.combined();
        if combined.contains(&self.config.stop_error_marker) {
            debug!(target: "avdctl", "stop reported an error: {}", combined.trim());
            return Err(StopFailure::Marker {
                marker: self.config.stop_error_marker.clone(),
            });
        }
        Ok(())
    }

    /// Scans the process table for a process name.
    pub fn is_process_running(&self, name: &str) -> bool {
        match self.ps_output() {
            Some(output) => process_listed(&output, name),
            None => false,
        }
    }

    /// Local ports an ssh tunnel forwards to the fixed adb/vnc ports of the
    /// instance at `ip`, if such a tunnel is up.
    pub fn forwarded_ports(
        &self,
        ip: &str,
        adb_target: u16,
        vnc_target: u16,
    ) -> Option<ForwardedPorts> {
        self.ps_output()
            .and_then(|output| scan_ssh_tunnel(&output, ip, adb_target, vnc_target))
    }

    /// Local port an ssh tunnel forwards to the webrtc signaling server of
    /// the instance at `ip`, if such a tunnel is up.
    pub fn webrtc_forward_port(&self, ip: &str) -> Option<u16> {
        self.ps_output()
            .and_then(|output| scan_webrtc_tunnel(&output, ip, self.config.webrtc_sig_port))
    }

    fn ps_output(&self) -> Option<String> {
        let mut command = Command::new(PS_BIN);
        command.args(PS_ARGS);
        match run_with_timeout(command, PS_BIN, self.config.command_timeout) {
            Ok(outcome) if outcome.success() => Some(outcome.stdout),
            Ok(outcome) => {
                debug!(target: "avdctl", "ps failed: {}", outcome.combined().trim());
                None
            }
            Err(err) => {
                debug!(target: "avdctl", "failed to run ps: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::instance::InstanceId;

    fn test_config(root: &Path) -> AvdctlConfig {
        AvdctlConfig {
            cvd_temp_dir: root.join("cvd"),
            goldfish_temp_dir: root.join("gf"),
            user_home: root.join("home"),
            command_timeout: Duration::from_secs(10),
            ..AvdctlConfig::default()
        }
    }

    fn test_record(config: &AvdctlConfig, id: InstanceId) -> InstanceRecord {
        let paths = InstancePaths::new(config, id);
        InstanceRecord {
            instance_id: id,
            adb_port: Some(6520),
            vnc_port: Some(6444),
            x_res: None,
            y_res: None,
            dpi: None,
            instance_dir: None,
            virtual_disk_paths: Vec::new(),
            cvd_tools_path: None,
            config_path: paths.assembly_config,
        }
    }

    fn write_script(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    fn stop_setup(root: &Path) -> (AvdctlConfig, InstanceRecord, std::path::PathBuf) {
        let config = test_config(root);
        let record = test_record(&config, 1);
        let bin_dir = InstancePaths::new(&config, 1).cvd_tool_dir(&config);
        (config, record, bin_dir)
    }

    #[test]
    fn stop_uses_primary_when_it_succeeds() {
        let temp = TempDir::new().unwrap();
        let (config, record, bin_dir) = stop_setup(temp.path());
        let fallback_witness = temp.path().join("fallback_ran");
        write_script(&bin_dir.join("cvd"), "echo stopped");
        write_script(
            &bin_dir.join("stop_cvd"),
            &format!("touch {}", fallback_witness.display()),
        );

        let runner = CvdRunner::new(config);
        assert!(runner.stop(&record).is_ok());
        assert!(!fallback_witness.exists());
    }

    #[test]
    fn stop_falls_back_on_error_marker() {
        let temp = TempDir::new().unwrap();
        let (config, record, bin_dir) = stop_setup(temp.path());
        let fallback_witness = temp.path().join("fallback_ran");
        write_script(&bin_dir.join("cvd"), "echo 'cvd_internal_stop E failed'");
        write_script(
            &bin_dir.join("stop_cvd"),
            &format!("touch {}", fallback_witness.display()),
        );

        let runner = CvdRunner::new(config);
        assert!(runner.stop(&record).is_ok());
        assert!(fallback_witness.exists());
    }

    #[test]
    fn stop_falls_back_on_nonzero_exit() {
        let temp = TempDir::new().unwrap();
        let (config, record, bin_dir) = stop_setup(temp.path());
        write_script(&bin_dir.join("cvd"), "echo broken >&2\nexit 1");
        write_script(&bin_dir.join("stop_cvd"), "exit 0");

        let runner = CvdRunner::new(config);
        assert!(runner.stop(&record).is_ok());
    }

    #[test]
    fn stop_reports_both_failures() {
        let temp = TempDir::new().unwrap();
        let (config, record, bin_dir) = stop_setup(temp.path());
        write_script(&bin_dir.join("cvd"), "exit 2");
        write_script(&bin_dir.join("stop_cvd"), "exit 3");

        let runner = CvdRunner::new(config);
        let err = runner.stop(&record).unwrap_err();
        assert_eq!(err.id, 1);
        assert!(matches!(err.primary, StopFailure::Process(_)));
        assert!(matches!(err.fallback, StopFailure::Process(_)));
    }

    #[test]
    fn run_with_timeout_kills_slow_commands() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 5"]);
        let started = Instant::now();
        let err = run_with_timeout(command, "sh -c sleep", Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn run_with_timeout_captures_both_streams() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2"]);
        let outcome = run_with_timeout(command, "sh", Duration::from_secs(10)).unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
    }

    #[test]
    fn fleet_parser_skips_noise_prefix() {
        let output = "WARNING: version mismatch\n{\"status\":\"Running\",\"webrtc_port\":\"8443\",\
                      \"displays\":[\"720 x 1280 ( 320 )\"]}";
        let info = parse_fleet_output(output).unwrap();
        assert_eq!(info.status.as_deref(), Some("Running"));
        assert_eq!(info.webrtc_port_number(), Some(8443));
        assert_eq!(info.display_label().as_deref(), Some("720 x 1280 ( 320 )"));
    }

    #[test]
    fn fleet_parser_returns_none_without_json() {
        assert!(parse_fleet_output("no devices").is_none());
        assert!(parse_fleet_output("").is_none());
        assert!(parse_fleet_output("garbage { not json").is_none());
    }

    #[test]
    fn fleet_parser_tolerates_extra_fields() {
        let info = parse_fleet_output("{\"instance_name\":\"cvd-1\",\"unexpected\":42}").unwrap();
        assert_eq!(info.instance_name.as_deref(), Some("cvd-1"));
        assert!(info.webrtc_port_number().is_none());
        assert!(info.display_label().is_none());
    }

    #[test]
    fn process_scan_needs_text_on_both_sides() {
        let ps = "Mon Aug 17 10:21:00 2026 /usr/bin/cvd_server --daemon\n\
                  Mon Aug 17 10:22:03 2026 grep cvd_server";
        assert!(process_listed(ps, "cvd_server"));
        // No text after the name on any line.
        assert!(!process_listed("Mon Aug 17 10:21:00 2026 cvd_server", "cvd_server"));
        assert!(!process_listed(ps, "launch_cvd"));
        assert!(!process_listed("", "cvd_server"));
    }

    #[test]
    fn tunnel_scan_extracts_forwarded_ports() {
        let ps = "Mon Aug 17 09:00:00 2026 ssh -i key \
                  -L 58167:127.0.0.1:6520 -L 58168:127.0.0.1:6444 -N -f -l vsoc-01 10.0.0.5";
        let ports = scan_ssh_tunnel(ps, "10.0.0.5", 6520, 6444).unwrap();
        assert_eq!(ports.adb, Some(58167));
        assert_eq!(ports.vnc, Some(58168));

        assert!(scan_ssh_tunnel(ps, "10.0.0.9", 6520, 6444).is_none());
        assert!(scan_ssh_tunnel("no tunnels here", "10.0.0.5", 6520, 6444).is_none());
    }

    #[test]
    fn webrtc_scan_picks_the_signaling_forward() {
        let ps = "Mon Aug 17 09:00:00 2026 ssh -i key \
                  -L 15551:127.0.0.1:15551 -L 12345:127.0.0.1:8443 -N -f -l vsoc-01 1.1.1.1";
        assert_eq!(scan_webrtc_tunnel(ps, "1.1.1.1", 8443), Some(12345));
        assert_eq!(scan_webrtc_tunnel(ps, "2.2.2.2", 8443), None);
        assert_eq!(scan_webrtc_tunnel(ps, "1.1.1.1", 8444), None);
        assert_eq!(scan_webrtc_tunnel("", "1.1.1.1", 8443), None);
    }
}
