//! Serde helpers for the JSON wire format.
//!
//! Fixed-size keys, digests and signatures travel as lowercase hex strings,
//! opaque payloads as standard base64.

/// `#[serde(with = "hex_array")]` for `[u8; N]` fields.
pub mod hex_array {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        let normalized = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(&value);

        let mut output = [0u8; N];
        hex::decode_to_slice(normalized, &mut output).map_err(|_| {
            D::Error::custom(format!("expected {N}-byte hex string, got {:?}", value))
        })?;
        Ok(output)
    }
}

/// `#[serde(with = "base64_bytes")]` for `Vec<u8>` payload fields.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        BASE64
            .decode(value.as_bytes())
            .map_err(|err| D::Error::custom(format!("invalid base64 payload: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::hex_array")]
        key: [u8; 4],
        #[serde(with = "super::base64_bytes")]
        payload: Vec<u8>,
    }

    #[test]
    fn encodes_keys_as_hex_and_payloads_as_base64() {
        let sample = Sample {
            key: [0xde, 0xad, 0xbe, 0xef],
            payload: b"hi".to_vec(),
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert_eq!(json, r#"{"key":"deadbeef","payload":"aGk="}"#);
    }

    #[test]
    fn accepts_prefixed_hex_and_rejects_wrong_length() {
        let ok: Sample = serde_json::from_str(r#"{"key":"0xdeadbeef","payload":""}"#).unwrap();
        assert_eq!(ok.key, [0xde, 0xad, 0xbe, 0xef]);

        let short = serde_json::from_str::<Sample>(r#"{"key":"dead","payload":""}"#);
        assert!(short.is_err());
    }
}
