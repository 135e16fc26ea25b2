#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Address that targets every node on the mesh.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// A mesh participant, identified by a 32-bit unsigned number.
pub type NodeNum = u32;

pub mod encoding;
pub mod logging;
pub mod time;
pub mod util;

/// Canonical textual id for a node: `!` followed by the zero-padded
/// lowercase hex node number.
#[inline]
pub fn node_id(num: NodeNum) -> String {
    format!("!{:08x}", num)
}

/// Parses a textual node id back into a node number.
#[inline]
pub fn parse_node_id(id: &str) -> Option<NodeNum> {
    let hex = id.strip_prefix('!')?;

    if hex.len() != 8 {
        return None;
    }

    NodeNum::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_format() {
        assert_eq!(node_id(0x12345678), "!12345678");
        assert_eq!(node_id(0xff), "!000000ff");
    }

    #[test]
    fn test_parse_node_id() {
        assert_eq!(parse_node_id("!12345678"), Some(0x12345678));
        assert_eq!(parse_node_id("!000000ff"), Some(0xff));
        assert_eq!(parse_node_id("12345678"), None);
        assert_eq!(parse_node_id("!1234"), None);
        assert_eq!(parse_node_id("!zzzzzzzz"), None);
    }

    #[test]
    fn test_roundtrip() {
        for num in &[0u32, 1, 0xdead_beef, BROADCAST_ADDR] {
            assert_eq!(parse_node_id(&node_id(*num)), Some(*num));
        }
    }
}
