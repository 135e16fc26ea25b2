//! Shareable channel-set URLs.
//!
//! The textual form is `<scheme>://<base>/#?<base64url(ChannelSet)>`. Only
//! the fragment payload is meaningful here; encode produces the bare
//! fragment and decode accepts a full URL, a fragment, or the naked
//! base64.

use crate::error::{Error, Result};
use crate::proto::ChannelSet;
use ferrite::encoding::base64url;
use prost::Message;

/// Encodes a channel set into the URL fragment payload.
pub fn encode_channel_set(set: &ChannelSet) -> String {
    base64url::encode(&set.encode_to_vec())
}

/// Decodes a channel set from a URL, a `#?`-fragment, or bare base64.
pub fn decode_channel_set(input: &str) -> Result<ChannelSet> {
    let fragment = match input.find('#') {
        Some(hash) => &input[hash + 1..],
        None => input,
    };

    let payload = fragment.strip_prefix('?').unwrap_or(fragment).trim();

    if payload.is_empty() {
        return Err(Error::validation("empty channel-set payload"));
    }

    let raw = base64url::decode(payload)
        .map_err(|err| Error::validation(format!("bad channel-set base64: {}", err)))?;

    Ok(ChannelSet::decode(&raw[..])?)
}
