use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Result;
use avdctl::{allocate_ports, AvdType, AvdctlConfig, InstanceId, Registry};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "avdctl", about = "Local virtual device instance registry", version)]
struct Cli {
    /// Parent temp directory holding cuttlefish instance homes and locks.
    #[arg(long, env = "AVDCTL_CVD_TEMP_DIR")]
    cvd_temp_dir: Option<PathBuf>,
    /// Parent temp directory for goldfish instances.
    #[arg(long, env = "AVDCTL_GOLDFISH_TEMP_DIR")]
    goldfish_temp_dir: Option<PathBuf>,
    /// Timeout for runtime tool invocations, in seconds.
    #[arg(long, env = "AVDCTL_COMMAND_TIMEOUT_SECS")]
    command_timeout_secs: Option<u64>,
    /// Timeout for instance lock acquisition, in seconds.
    #[arg(long, env = "AVDCTL_LOCK_TIMEOUT_SECS")]
    lock_timeout_secs: Option<u64>,
    /// Substring of stop output that triggers the stop_cvd fallback.
    #[arg(long, env = "AVDCTL_STOP_ERROR_MARKER")]
    stop_error_marker: Option<String>,
    #[arg(long, env = "AVDCTL_ADB_BIN")]
    adb_bin: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List local cuttlefish and goldfish instances.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one local cuttlefish instance.
    Get {
        id: InstanceId,
        #[arg(long)]
        json: bool,
    },
    /// Stop local cuttlefish instances and remove their directories.
    Delete {
        #[arg(required = true)]
        ids: Vec<InstanceId>,
    },
    /// Print the ports an instance id maps to.
    Ports {
        id: InstanceId,
        #[arg(long, value_enum, default_value = "cuttlefish")]
        avd_type: AvdTypeArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AvdTypeArg {
    Cuttlefish,
    Goldfish,
}

impl From<AvdTypeArg> for AvdType {
    fn from(arg: AvdTypeArg) -> Self {
        match arg {
            AvdTypeArg::Cuttlefish => AvdType::Cuttlefish,
            AvdTypeArg::Goldfish => AvdType::Goldfish,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,avdctl=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(cli) {
        eprintln!("avdctl: {err:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli);
    match cli.command {
        Commands::List { json } => {
            let registry = Registry::new(config);
            let mut instances = registry.list()?;
            instances.extend(registry.list_goldfish());
            if json {
                println!("{}", serde_json::to_string_pretty(&instances)?);
            } else if instances.is_empty() {
                println!("no local instances found");
            } else {
                for (index, instance) in instances.iter().enumerate() {
                    if index > 0 {
                        println!();
                    }
                    println!("[{}]{}", index + 1, instance.summary());
                }
            }
        }
        Commands::Get { id, json } => {
            let registry = Registry::new(config);
            let instance = registry.get(id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&instance)?);
            } else {
                println!("{}", instance.summary());
            }
        }
        Commands::Delete { ids } => {
            let registry = Registry::new(config);
            let reports = registry.delete_all(&ids);
            let mut failures = 0;
            for report in &reports {
                match &report.result {
                    Ok(()) => println!("instance {} deleted", report.id),
                    Err(err) => {
                        failures += 1;
                        eprintln!("failed to delete instance {}: {err}", report.id);
                    }
                }
            }
            if failures > 0 {
                eprintln!("{failures} of {} deletions failed", reports.len());
                process::exit(1);
            }
        }
        Commands::Ports { id, avd_type } => {
            let ports = allocate_ports(&config, id, avd_type.into())?;
            println!("{}", serde_json::to_string_pretty(&ports)?);
        }
    }
    Ok(())
}

fn build_config(cli: &Cli) -> AvdctlConfig {
    let mut config = AvdctlConfig::default();
    if let Some(dir) = &cli.cvd_temp_dir {
        config.cvd_temp_dir = dir.clone();
    }
    if let Some(dir) = &cli.goldfish_temp_dir {
        config.goldfish_temp_dir = dir.clone();
    }
    if let Some(secs) = cli.command_timeout_secs {
        config.command_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.lock_timeout_secs {
        config.lock_timeout = Duration::from_secs(secs);
    }
    if let Some(marker) = &cli.stop_error_marker {
        config.stop_error_marker = marker.clone();
    }
    if let Some(adb_bin) = &cli.adb_bin {
        config.adb_bin = adb_bin.clone();
    }
    config
}
