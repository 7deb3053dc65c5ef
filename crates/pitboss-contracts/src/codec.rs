//! Serde helpers for byte fields carried in JSON bodies.

/// `Vec<u8>` as a standard base64 string. A missing or `null` field decodes
/// to an empty vector.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) if !s.is_empty() => STANDARD.decode(s).map_err(serde::de::Error::custom),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(default, with = "super::base64_bytes")]
        payload: Vec<u8>,
    }

    #[test]
    fn encodes_as_base64_text() {
        let json = serde_json::to_string(&Holder { payload: b"{\"ok\":true}".to_vec() }).unwrap();
        assert_eq!(json, r#"{"payload":"eyJvayI6dHJ1ZX0="}"#);
    }

    #[test]
    fn missing_and_null_decode_to_empty() {
        let missing: Holder = serde_json::from_str("{}").unwrap();
        assert!(missing.payload.is_empty());
        let null: Holder = serde_json::from_str(r#"{"payload":null}"#).unwrap();
        assert!(null.payload.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Holder>(r#"{"payload":"%%%"}"#).is_err());
    }
}
