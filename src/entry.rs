//! Worker entry point.
//!
//! Reads the encoded payload from `REMLAUNCH_PAYLOAD`, decodes it, calls the
//! named function and prints a non-null result to stdout as JSON. Any failure
//! is reported on stderr and turned into a non-zero exit code so the composed
//! launch script, the scheduler or the orchestrator sees it.

use std::io::Write;
use std::process::ExitCode;

use serde_json::Value;

use crate::payload::{decode, CallError, DecodeError, FunctionRegistry};
use crate::PAYLOAD_ENV;

/// Errors for the entry point
#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("REMLAUNCH_PAYLOAD is not set; nothing to run")]
    MissingPayload,

    #[error("failed to decode payload: {0}")]
    Decode(#[from] DecodeError),

    #[error("function failed: {0}")]
    Call(#[from] CallError),

    #[error("failed to write result: {0}")]
    Io(#[from] std::io::Error),
}

impl EntryError {
    /// `1` when the function itself failed, `2` when there was nothing
    /// runnable.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Call(_) | Self::Io(_) => 1,
            Self::MissingPayload | Self::Decode(_) => 2,
        }
    }
}

/// Decode `encoded` and invoke it, writing a non-null result to `out`.
pub fn run<W: Write>(
    registry: &FunctionRegistry,
    encoded: Option<&str>,
    out: &mut W,
) -> Result<Value, EntryError> {
    let encoded = encoded
        .filter(|s| !s.trim().is_empty())
        .ok_or(EntryError::MissingPayload)?;
    let payload = decode(encoded)?;
    tracing::debug!(function = %payload.function, args = payload.args.len(), "invoking payload");

    let result = registry.invoke(&payload)?;
    if !result.is_null() {
        writeln!(out, "{}", result)?;
    }
    Ok(result)
}

/// Run the payload found in the environment against `registry`.
pub fn run_from_env<W: Write>(registry: &FunctionRegistry, out: &mut W) -> Result<Value, EntryError> {
    let encoded = std::env::var(PAYLOAD_ENV).ok();
    run(registry, encoded.as_deref(), out)
}

/// Body of an entry binary: logging to stderr, run, map errors to exit codes.
///
/// Programs that ship their own functions call this from `main` with their
/// registry.
pub fn main_with(registry: FunctionRegistry) -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();

    let stdout = std::io::stdout();
    match run_from_env(&registry, &mut stdout.lock()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("remlaunch-entry: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use serde_json::json;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new()
            .with("add_five", |call| {
                let b: i64 = call.arg(0)?;
                Ok(json!(b + 5))
            })
            .with("quiet", |_| Ok(Value::Null))
            .with("explode", |_| Err(CallError::Failed("exploded".to_string())))
    }

    #[test]
    fn test_add_five_prints_eight() {
        let encoded = Payload::new("add_five").with_arg(3).encode();
        let mut out = Vec::new();
        let result = run(&registry(), Some(&encoded), &mut out).unwrap();
        assert_eq!(result, json!(8));
        assert_eq!(String::from_utf8(out).unwrap(), "8\n");
    }

    #[test]
    fn test_null_result_prints_nothing() {
        let encoded = Payload::new("quiet").encode();
        let mut out = Vec::new();
        run(&registry(), Some(&encoded), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_missing_payload_fails_loudly() {
        let mut out = Vec::new();
        let err = run(&registry(), None, &mut out).unwrap_err();
        assert!(matches!(err, EntryError::MissingPayload));
        assert_eq!(err.exit_code(), 2);

        let err = run(&registry(), Some("  "), &mut out).unwrap_err();
        assert!(matches!(err, EntryError::MissingPayload));
    }

    #[test]
    fn test_function_failure_is_exit_code_one() {
        let encoded = Payload::new("explode").encode();
        let err = run(&registry(), Some(&encoded), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, EntryError::Call(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
