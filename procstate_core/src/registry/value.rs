//! Typed parameter values
//!
//! Values are stored as bincode payloads of at most
//! [`MAX_PARAM_LENGTH`](super::MAX_PARAM_LENGTH) bytes. Oversized encodings are
//! rejected like oversized raw values, never truncated.

use super::layout::MAX_PARAM_LENGTH;
use crate::error::{ProcStateError, ProcStateResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode `value` for parameter `key`.
pub fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> ProcStateResult<Vec<u8>> {
    let bytes = bincode::serialize(value)?;
    if bytes.len() > MAX_PARAM_LENGTH {
        log::error!(
            "parameter '{}' value exceeds data limit of {} bytes ({} bytes encoded)",
            key,
            MAX_PARAM_LENGTH,
            bytes.len()
        );
        return Err(ProcStateError::ValueTooLarge {
            key: key.to_string(),
            len: bytes.len(),
            max: MAX_PARAM_LENGTH,
        });
    }
    Ok(bytes)
}

/// Decode a payload written by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ProcStateResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Status {
        mode: String,
        counter: u32,
        active: bool,
    }

    #[test]
    fn struct_value() {
        let status = Status {
            mode: "operational".into(),
            counter: 7,
            active: true,
        };
        let bytes = encode("status", &status).unwrap();
        assert!(bytes.len() <= MAX_PARAM_LENGTH);
        let back: Status = decode(&bytes).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn oversized_value_rejected() {
        let big = "x".repeat(MAX_PARAM_LENGTH);
        let err = encode("big", &big).unwrap_err();
        match err {
            ProcStateError::ValueTooLarge { key, len, max } => {
                assert_eq!(key, "big");
                // string length prefix pushes it over
                assert_eq!(len, MAX_PARAM_LENGTH + 8);
                assert_eq!(max, MAX_PARAM_LENGTH);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn garbage_is_serialization_error() {
        let err = decode::<String>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, ProcStateError::Serialization(_)));
    }
}
