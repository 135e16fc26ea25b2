//! Base64 plumbing shared by config files and the channel-set URL format.

use serde::{de, Deserialize, Deserializer, Serializer};

/// Standard-alphabet base64 with padding.
pub mod base64 {
    pub use ::base64::DecodeError;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode(data: &str) -> Result<Vec<u8>, DecodeError> {
        ::base64::decode(data)
    }
}

/// URL-safe alphabet without padding, as used in channel-set fragments.
pub mod base64url {
    pub use ::base64::DecodeError;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode_config(data, ::base64::URL_SAFE_NO_PAD)
    }

    /// Decodes URL-safe base64, tolerating trailing padding and the
    /// standard alphabet (some encoders emit `+`/`/` in fragments).
    pub fn decode(data: &str) -> Result<Vec<u8>, DecodeError> {
        let trimmed = data.trim_end_matches('=');

        ::base64::decode_config(trimmed, ::base64::URL_SAFE_NO_PAD)
            .or_else(|_| ::base64::decode_config(trimmed, ::base64::STANDARD_NO_PAD))
    }
}

/// Deserializes a base64 string into a byte vector.
pub fn deserialize_b64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    base64::decode(&s).map_err(de::Error::custom)
}

/// Serializes a byte vector as a base64 string.
pub fn serialize_b64<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&base64::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64url_no_padding() {
        let encoded = base64url::encode(&[0xfb, 0xef, 0xff]);

        assert!(!encoded.contains('='));
        assert_eq!(base64url::decode(&encoded).unwrap(), vec![0xfb, 0xef, 0xff]);
    }

    #[test]
    fn test_base64url_accepts_padded_standard() {
        // "-_" is the url-safe spelling of "+/"
        assert_eq!(
            base64url::decode("--__").unwrap(),
            base64::decode("++//").unwrap()
        );
        assert_eq!(base64url::decode("AQID").unwrap(), vec![1, 2, 3]);
        assert_eq!(base64url::decode("AQID=").unwrap(), vec![1, 2, 3]);
    }
}
