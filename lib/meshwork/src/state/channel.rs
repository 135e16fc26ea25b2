//! Channel table, indices 0..7.

use crate::proto;
use serde_derive::{Deserialize, Serialize};

pub const CHANNEL_COUNT: usize = 8;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub index: u8,
    /// Stored verbatim as received; empty is allowed for the primary.
    pub name: String,
    pub psk: Vec<u8>,
    /// 0 disabled, 1 primary, 2 secondary.
    pub role: i32,
    pub uplink_enabled: bool,
    pub downlink_enabled: bool,
    /// Position precision granted to this channel, 0..32.
    pub position_precision: Option<u32>,
}

impl ChannelEntry {
    pub fn disabled(index: u8) -> ChannelEntry {
        ChannelEntry {
            index,
            name: String::new(),
            psk: Vec::new(),
            role: proto::ChannelRole::Disabled as i32,
            uplink_enabled: false,
            downlink_enabled: false,
            position_precision: None,
        }
    }

    pub fn from_proto(channel: &proto::Channel) -> Option<ChannelEntry> {
        let index = validate_channel_index(channel.index).ok()?;
        let settings = channel.settings.clone().unwrap_or_default();

        Some(ChannelEntry {
            index,
            name: settings.name,
            psk: settings.psk,
            role: channel.role,
            uplink_enabled: settings.uplink_enabled,
            downlink_enabled: settings.downlink_enabled,
            position_precision: settings
                .module_settings
                .map(|m| m.position_precision),
        })
    }

    pub fn to_proto(&self) -> proto::Channel {
        proto::Channel {
            index: i32::from(self.index),
            settings: Some(proto::ChannelSettings {
                psk: self.psk.clone(),
                name: self.name.clone(),
                id: 0,
                uplink_enabled: self.uplink_enabled,
                downlink_enabled: self.downlink_enabled,
                module_settings: self.position_precision.map(|precision| {
                    proto::ModuleSettings {
                        position_precision: precision,
                        is_client_muted: false,
                    }
                }),
            }),
            role: self.role,
        }
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.role == proto::ChannelRole::Disabled as i32
    }
}

/// Channel indices live in 0..7.
pub fn validate_channel_index(index: i32) -> crate::Result<u8> {
    if (0..CHANNEL_COUNT as i32).contains(&index) {
        Ok(index as u8)
    } else {
        Err(crate::Error::validation(format!(
            "channel index {} outside 0..{}",
            index,
            CHANNEL_COUNT - 1
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_validation() {
        assert_eq!(validate_channel_index(0).unwrap(), 0);
        assert_eq!(validate_channel_index(7).unwrap(), 7);
        assert!(validate_channel_index(8).is_err());
        assert!(validate_channel_index(-1).is_err());
    }

    #[test]
    fn test_from_proto_stores_name_verbatim() {
        let channel = proto::Channel {
            index: 0,
            settings: Some(proto::ChannelSettings {
                name: String::new(),
                psk: vec![1],
                ..proto::ChannelSettings::default()
            }),
            role: proto::ChannelRole::Primary as i32,
        };

        let entry = ChannelEntry::from_proto(&channel).unwrap();

        assert_eq!(entry.name, "");
        assert_eq!(entry.psk, vec![1]);
        assert!(!entry.is_disabled());
    }

    #[test]
    fn test_proto_roundtrip_preserves_precision() {
        let mut entry = ChannelEntry::disabled(3);
        entry.role = proto::ChannelRole::Secondary as i32;
        entry.name = "field".into();
        entry.position_precision = Some(13);

        let back = ChannelEntry::from_proto(&entry.to_proto()).unwrap();

        assert_eq!(back, entry);
    }

    #[test]
    fn test_out_of_range_proto_rejected() {
        let channel = proto::Channel {
            index: 9,
            ..proto::Channel::default()
        };

        assert!(ChannelEntry::from_proto(&channel).is_none());
    }
}
