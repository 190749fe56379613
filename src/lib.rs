mod adb;
mod config;
pub mod dirs;
mod error;
mod instance;
mod lock;
mod ports;
mod registry;
mod runner;
pub mod runtime_config;

pub use adb::{AdbDevice, AdbTools};
pub use config::AvdctlConfig;
pub use error::{ConfigError, DeleteError, Error, ProcessError, Result, StopFailure};
pub use instance::{
    goldfish_instance, remote_instance, AutoConnect, ForwardedPorts, Instance, InstanceId,
    InstanceKind, InstanceState, RemoteInstanceData,
};
pub use lock::{InstanceLock, LockGuard};
pub use ports::{allocate_ports, goldfish_max_instances, goldfish_serial, AvdType, PortSet};
pub use registry::{DeleteReport, Registry};
pub use runner::{CvdRunner, FleetInfo};
pub use runtime_config::InstanceRecord;
