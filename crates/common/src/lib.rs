use serde::{Deserialize, Deserializer, Serialize};

pub mod filesec;

pub use filesec::{decrypt_file, encrypt_bytes, encrypt_file, generate_key, sha256_file, sha256_hex};

/// Suffix of a formula archive as it is stored at rest.
pub const ENCRYPTED_ARCHIVE_EXT: &str = "tar.gz.enc";
/// Suffix of a formula archive once decrypted.
pub const ARCHIVE_EXT: &str = "tar.gz";
/// Entry script every formula package must ship at `<uuid>/main.py`.
pub const FORMULA_ENTRY_SCRIPT: &str = "main.py";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyRequest {
    pub formula: String,
    pub checksum: String,
    pub sys_uuid: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub key: String,
}

impl std::fmt::Debug for VerifyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyResponse")
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub formula: String,
    pub sys_uuid: String,
}

/// The `results` object written by a finished formula script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultFields {
    pub formula: String,
    pub sys_uuid: String,
    #[serde(deserialize_with = "string_or_number")]
    pub end_time: String,
    pub exit_code: i64,
    pub exit_status: String,
    #[serde(default)]
    pub exit_msg: String,
}

/// Top-level shape of a result log file: `{"results": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultLog {
    pub results: ResultFields,
}

/// A result ready for upload: the extracted fields plus the whole log, base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormulaResult {
    #[serde(flatten)]
    pub fields: ResultFields,
    pub log: String,
}

/// Accept timestamps written either as strings or as bare numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct StringOrNumber;

    impl<'de> Visitor<'de> for StringOrNumber {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or a number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}

pub fn serialize_message<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn deserialize_message<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_log_accepts_numeric_end_time() {
        let raw = br#"{"results": {"formula": "f1", "sys_uuid": "host-1", "end_time": 1700000000.5,
            "exit_code": 0, "exit_status": "success", "exit_msg": ""}}"#;
        let log: ResultLog = deserialize_message(raw).unwrap();
        assert_eq!(log.results.end_time, "1700000000.5");
        assert_eq!(log.results.exit_code, 0);
    }

    #[test]
    fn result_log_rejects_missing_results_object() {
        let raw = br#"{"formula": "f1"}"#;
        assert!(deserialize_message::<ResultLog>(raw).is_err());
    }

    #[test]
    fn formula_result_flattens_fields() {
        let result = FormulaResult {
            fields: ResultFields {
                formula: "f1".into(),
                sys_uuid: "host-1".into(),
                end_time: "2024-01-01T00:00:00".into(),
                exit_code: 1,
                exit_status: "failed".into(),
                exit_msg: "boom".into(),
            },
            log: "e30=".into(),
        };
        let value: serde_json::Value = serde_json::from_slice(&serialize_message(&result).unwrap()).unwrap();
        assert_eq!(value["formula"], "f1");
        assert_eq!(value["exit_code"], 1);
        assert_eq!(value["log"], "e30=");
    }

    #[test]
    fn verify_response_debug_redacts_key() {
        let resp = VerifyResponse { key: "secret".into() };
        assert!(!format!("{resp:?}").contains("secret"));
    }
}
