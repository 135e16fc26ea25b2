//! Process-environment configuration read once at initialisation.
//!
//! Everything else (automation intervals, filters, triggers, retention)
//! lives in the settings table and is read at runtime.

use crate::DEFAULT_DEVICE_PORT;
use std::env;

pub const ENV_DEVICE: &str = "MESHWORK_DEVICE";
pub const ENV_VDEV_PORT: &str = "MESHWORK_VDEV_PORT";
pub const ENV_VDEV_ALLOW_ADMIN: &str = "MESHWORK_VDEV_ALLOW_ADMIN";
pub const ENV_DISABLE_VERSION_CHECK: &str = "MESHWORK_DISABLE_VERSION_CHECK";

#[derive(Clone, Debug, PartialEq)]
pub struct CoreConfig {
    /// Physical gateway dial target, `host[:port]`.
    pub device_target: String,
    /// Virtual device listener port.
    pub vdev_port: u16,
    /// Whether virtual clients may issue admin records.
    pub vdev_allow_admin: bool,
    pub version_check_disabled: bool,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            device_target: format!("localhost:{}", DEFAULT_DEVICE_PORT),
            vdev_port: DEFAULT_DEVICE_PORT,
            vdev_allow_admin: false,
            version_check_disabled: false,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> CoreConfig {
        let default = CoreConfig::default();

        CoreConfig {
            device_target: env::var(ENV_DEVICE).unwrap_or(default.device_target),
            vdev_port: env::var(ENV_VDEV_PORT)
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(default.vdev_port),
            vdev_allow_admin: env_flag(ENV_VDEV_ALLOW_ADMIN),
            version_check_disabled: env_flag(ENV_DISABLE_VERSION_CHECK),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}
