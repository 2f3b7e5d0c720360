//! Payload encoding
//!
//! A payload names a registered function and carries its arguments. The
//! encoded form is the JSON triple `[function, args, kwargs]`, base64 encoded
//! with the standard alphabet so it survives environment variables, shell
//! quoting and YAML without escaping.

mod registry;

pub use registry::{builtin_registry, CallArgs, CallError, FunctionRegistry, TaskFn};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

/// A function call to perform on the worker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    /// Name the function is registered under in the worker's registry.
    pub function: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

impl Payload {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            ..Self::default()
        }
    }

    /// Append a positional argument.
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Encoded form, ready for the payload environment variable.
    pub fn encode(&self) -> String {
        encode(&self.function, &self.args, &self.kwargs)
    }
}

/// Errors for payload decoding
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not a [function, args, kwargs] triple: {0}")]
    Shape(#[from] serde_json::Error),
}

/// Encode a call. Never fails: every component is already JSON.
pub fn encode(function: &str, args: &[Value], kwargs: &Map<String, Value>) -> String {
    let triple = Value::Array(vec![
        Value::String(function.to_string()),
        Value::Array(args.to_vec()),
        Value::Object(kwargs.clone()),
    ]);
    STANDARD.encode(triple.to_string())
}

/// Decode an encoded call.
///
/// `null` args or kwargs decode to empty containers.
pub fn decode(encoded: &str) -> Result<Payload, DecodeError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    let (function, args, kwargs): (String, Option<Vec<Value>>, Option<Map<String, Value>>) =
        serde_json::from_slice(&bytes)?;

    Ok(Payload {
        function,
        args: args.unwrap_or_default(),
        kwargs: kwargs.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_preserves_call() {
        let payload = Payload::new("train")
            .with_arg(3)
            .with_arg("cifar")
            .with_kwarg("lr", 0.1)
            .with_kwarg("tags", json!(["a", "b"]));

        let decoded = decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_zero_argument_payload_decodes_to_empty_containers() {
        let decoded = decode(&Payload::new("noop").encode()).unwrap();
        assert_eq!(decoded.function, "noop");
        assert!(decoded.args.is_empty());
        assert!(decoded.kwargs.is_empty());
    }

    #[test]
    fn test_null_args_and_kwargs_become_empty() {
        let encoded = STANDARD.encode(r#"["noop", null, null]"#);
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.args.is_empty());
        assert!(decoded.kwargs.is_empty());
    }

    #[test]
    fn test_encoded_form_is_shell_safe() {
        let encoded = Payload::new("f").with_kwarg("quote", "it's \"here\"").encode();
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not base64!!"), Err(DecodeError::Base64(_))));

        let wrong_shape = STANDARD.encode(r#"{"function": "f"}"#);
        assert!(matches!(decode(&wrong_shape), Err(DecodeError::Shape(_))));
    }
}
