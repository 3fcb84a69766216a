use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// A value that may arrive encrypted from an upstream component (for
/// example the edge proxy sealing verifier PII before it reaches us).
/// The `encrypted` tag is explicit; nothing in the service guesses from
/// the shape of the string whether it holds ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedValue {
    pub encrypted: bool,
    pub value: String,
}

impl SealedValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            encrypted: false,
            value: value.into(),
        }
    }

    pub fn sealed(ciphertext: impl Into<String>) -> Self {
        Self {
            encrypted: true,
            value: ciphertext.into(),
        }
    }

    /// The plaintext, when this value is not sealed. Sealed values are
    /// opaque here; decryption belongs to the component that sealed them.
    pub fn expose_plain(&self) -> Option<&str> {
        if self.encrypted {
            None
        } else {
            Some(&self.value)
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({ "encrypted": self.encrypted, "value": self.value })
    }

    /// Strict parse: a bare string is treated as plaintext, an object
    /// must carry both fields. Anything else is rejected.
    pub fn from_json(value: &Value) -> Result<Self, AppError> {
        match value {
            Value::String(text) => Ok(Self::plain(text.clone())),
            Value::Object(_) => serde_json::from_value(value.clone()).map_err(|_| {
                AppError::Validation(
                    "Sealed value must carry 'encrypted' and 'value' fields.".to_string(),
                )
            }),
            _ => Err(AppError::Validation(
                "Sealed value must be a string or a tagged object.".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::SealedValue;

    #[test]
    fn tag_is_explicit() {
        let plain = SealedValue::plain("181.120.4.18");
        assert_eq!(plain.expose_plain(), Some("181.120.4.18"));

        let sealed = SealedValue::sealed("djEyOmFiYw==");
        assert!(sealed.expose_plain().is_none());
        assert_eq!(sealed.to_json(), json!({"encrypted": true, "value": "djEyOmFiYw=="}));
    }

    #[test]
    fn parses_bare_strings_as_plain() {
        let parsed = SealedValue::from_json(&json!("Mozilla/5.0")).unwrap();
        assert!(!parsed.encrypted);
        assert_eq!(parsed.value, "Mozilla/5.0");
    }

    #[test]
    fn rejects_untagged_objects() {
        assert!(SealedValue::from_json(&json!({"value": "x"})).is_err());
        assert!(SealedValue::from_json(&json!(42)).is_err());

        let tagged = SealedValue::from_json(&json!({"encrypted": true, "value": "x"})).unwrap();
        assert!(tagged.encrypted);
    }
}
