use serde_derive::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize)]
pub struct Device {
    /// `host[:port]` of the physical gateway.
    pub target: String,
}

#[derive(Serialize, Deserialize)]
pub struct VirtualDevice {
    pub port: u16,
    pub allow_admin_commands: bool,
}

#[derive(Serialize, Deserialize)]
pub struct Storage {
    pub snapshot_path: String,
}

#[derive(Serialize, Deserialize)]
pub struct RunnerConfig {
    pub device: Device,
    pub virtual_device: VirtualDevice,
    pub storage: Storage,
    pub log_level: String,
}

impl Default for RunnerConfig {
    fn default() -> RunnerConfig {
        RunnerConfig {
            device: Device {
                target: format!("localhost:{}", meshwork::DEFAULT_DEVICE_PORT),
            },
            virtual_device: VirtualDevice {
                port: meshwork::DEFAULT_DEVICE_PORT,
                allow_admin_commands: false,
            },
            storage: Storage {
                snapshot_path: "meshwork-state.json".into(),
            },
            log_level: "info".into(),
        }
    }
}

impl RunnerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> RunnerConfig {
        serdeconv::from_toml_file(path).expect("Error loading runner configuration file")
    }
}
