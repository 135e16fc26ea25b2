//! Admin message envelope and the constructors the session layer uses.
//!
//! Admin payloads ride inside a `Data` on the admin portnum; remote targets
//! additionally require a session passkey obtained through a
//! get-config(SESSIONKEY) round trip.

use super::{Channel, Config, DeviceMetadata, ModuleConfig, Position, User};
use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct AdminMessage {
    #[prost(enumeration = "ConfigType", optional, tag = "5")]
    pub get_config_request: Option<i32>,
    #[prost(message, optional, tag = "6")]
    pub get_config_response: Option<Config>,
    #[prost(uint32, optional, tag = "7")]
    pub get_module_config_request: Option<u32>,
    #[prost(message, optional, tag = "8")]
    pub get_module_config_response: Option<ModuleConfig>,
    #[prost(bool, tag = "12")]
    pub get_device_metadata_request: bool,
    #[prost(message, optional, tag = "13")]
    pub get_device_metadata_response: Option<DeviceMetadata>,
    #[prost(message, optional, tag = "32")]
    pub set_owner: Option<User>,
    #[prost(message, optional, tag = "33")]
    pub set_channel: Option<Channel>,
    #[prost(message, optional, tag = "34")]
    pub set_config: Option<Config>,
    #[prost(message, optional, tag = "35")]
    pub set_module_config: Option<ModuleConfig>,
    #[prost(uint32, optional, tag = "38")]
    pub remove_by_nodenum_value: Option<u32>,
    #[prost(uint32, optional, tag = "39")]
    pub set_favorite_node_value: Option<u32>,
    #[prost(uint32, optional, tag = "40")]
    pub remove_favorite_node_value: Option<u32>,
    #[prost(message, optional, tag = "41")]
    pub set_fixed_position: Option<Position>,
    #[prost(bool, tag = "42")]
    pub remove_fixed_position: bool,
    #[prost(fixed32, optional, tag = "43")]
    pub set_time_only: Option<u32>,
    #[prost(uint32, optional, tag = "47")]
    pub set_ignored_node_value: Option<u32>,
    #[prost(uint32, optional, tag = "48")]
    pub remove_ignored_node_value: Option<u32>,
    #[prost(bool, tag = "64")]
    pub begin_edit_settings: bool,
    #[prost(bool, tag = "65")]
    pub commit_edit_settings: bool,
    #[prost(int32, optional, tag = "97")]
    pub reboot_seconds: Option<i32>,
    #[prost(int32, optional, tag = "100")]
    pub nodedb_reset_value: Option<i32>,
    #[prost(bytes = "vec", tag = "101")]
    pub session_passkey: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ConfigType {
    DeviceConfig = 0,
    PositionConfig = 1,
    PowerConfig = 2,
    NetworkConfig = 3,
    DisplayConfig = 4,
    LoraConfig = 5,
    BluetoothConfig = 6,
    SecurityConfig = 7,
    SessionkeyConfig = 8,
}

impl AdminMessage {
    #[inline]
    pub fn get_config(config_type: ConfigType) -> AdminMessage {
        AdminMessage {
            get_config_request: Some(config_type as i32),
            ..AdminMessage::default()
        }
    }

    /// The passkey fetch is a get-config round trip against the session-key
    /// config type; the reply carries `session_passkey`.
    #[inline]
    pub fn get_session_key() -> AdminMessage {
        Self::get_config(ConfigType::SessionkeyConfig)
    }

    #[inline]
    pub fn get_module_config(module_type: u32) -> AdminMessage {
        AdminMessage {
            get_module_config_request: Some(module_type),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn get_device_metadata() -> AdminMessage {
        AdminMessage {
            get_device_metadata_request: true,
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn set_config(config: Config) -> AdminMessage {
        AdminMessage {
            set_config: Some(config),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn set_module_config(config: ModuleConfig) -> AdminMessage {
        AdminMessage {
            set_module_config: Some(config),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn set_channel(channel: Channel) -> AdminMessage {
        AdminMessage {
            set_channel: Some(channel),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn set_owner(user: User) -> AdminMessage {
        AdminMessage {
            set_owner: Some(user),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn set_fixed_position(position: Position) -> AdminMessage {
        AdminMessage {
            set_fixed_position: Some(position),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn remove_fixed_position() -> AdminMessage {
        AdminMessage {
            remove_fixed_position: true,
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn set_time(epoch_secs: u32) -> AdminMessage {
        AdminMessage {
            set_time_only: Some(epoch_secs),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn reboot(seconds: i32) -> AdminMessage {
        AdminMessage {
            reboot_seconds: Some(seconds),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn nodedb_reset() -> AdminMessage {
        AdminMessage {
            nodedb_reset_value: Some(1),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn set_favorite_node(node_num: u32) -> AdminMessage {
        AdminMessage {
            set_favorite_node_value: Some(node_num),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn remove_favorite_node(node_num: u32) -> AdminMessage {
        AdminMessage {
            remove_favorite_node_value: Some(node_num),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn set_ignored_node(node_num: u32) -> AdminMessage {
        AdminMessage {
            set_ignored_node_value: Some(node_num),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn remove_ignored_node(node_num: u32) -> AdminMessage {
        AdminMessage {
            remove_ignored_node_value: Some(node_num),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn remove_by_nodenum(node_num: u32) -> AdminMessage {
        AdminMessage {
            remove_by_nodenum_value: Some(node_num),
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn begin_edit_settings() -> AdminMessage {
        AdminMessage {
            begin_edit_settings: true,
            ..AdminMessage::default()
        }
    }

    #[inline]
    pub fn commit_edit_settings() -> AdminMessage {
        AdminMessage {
            commit_edit_settings: true,
            ..AdminMessage::default()
        }
    }

    /// Attaches the session passkey required by remote targets.
    #[inline]
    pub fn with_passkey(mut self, passkey: &[u8]) -> AdminMessage {
        self.session_passkey = passkey.to_vec();
        self
    }

    /// True when the message only reads state on the target.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.get_config_request.is_some()
            || self.get_module_config_request.is_some()
            || self.get_device_metadata_request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_request_shape() {
        let msg = AdminMessage::get_session_key();

        assert_eq!(
            msg.get_config_request,
            Some(ConfigType::SessionkeyConfig as i32)
        );
        assert!(msg.is_read_only());
    }

    #[test]
    fn test_passkey_attachment_roundtrip() {
        let msg = AdminMessage::set_time(1_700_000_000).with_passkey(&[1, 2, 3, 4]);
        let decoded = AdminMessage::decode(&msg.encode_to_vec()[..]).unwrap();

        assert_eq!(decoded.set_time_only, Some(1_700_000_000));
        assert_eq!(decoded.session_passkey, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_edit_brackets_distinct() {
        assert!(AdminMessage::begin_edit_settings().begin_edit_settings);
        assert!(!AdminMessage::begin_edit_settings().commit_edit_settings);
        assert!(AdminMessage::commit_edit_settings().commit_edit_settings);
    }
}
