//! Worker-side function registry.
//!
//! Functions are looked up by name; only the name and a JSON argument bundle
//! cross the wire.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::Payload;

/// A registered function.
pub type TaskFn = dyn Fn(&CallArgs<'_>) -> Result<Value, CallError> + Send + Sync;

/// Errors raised while invoking a payload
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("no function registered under '{0}'")]
    UnknownFunction(String),

    #[error("missing argument {0}")]
    MissingArgument(String),

    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// Borrowed view of a payload's arguments with typed accessors.
#[derive(Debug, Clone, Copy)]
pub struct CallArgs<'a> {
    args: &'a [Value],
    kwargs: &'a Map<String, Value>,
}

impl<'a> CallArgs<'a> {
    pub fn new(args: &'a [Value], kwargs: &'a Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn args(&self) -> &'a [Value] {
        self.args
    }

    pub fn kwargs(&self) -> &'a Map<String, Value> {
        self.kwargs
    }

    /// Positional argument `index`, deserialized.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, CallError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| CallError::MissingArgument(format!("#{}", index)))?;
        serde_json::from_value(value.clone()).map_err(|e| CallError::InvalidArgument {
            name: format!("#{}", index),
            reason: e.to_string(),
        })
    }

    /// Keyword argument `name`, deserialized; `None` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CallError> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                CallError::InvalidArgument {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            }),
        }
    }
}

/// Maps function names to callables.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Box<TaskFn>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&CallArgs<'_>) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Box::new(function));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&CallArgs<'_>) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.register(name, function);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Call the payload's function with its arguments.
    pub fn invoke(&self, payload: &Payload) -> Result<Value, CallError> {
        let function = self
            .functions
            .get(&payload.function)
            .ok_or_else(|| CallError::UnknownFunction(payload.function.clone()))?;
        function(&CallArgs::new(&payload.args, &payload.kwargs))
    }
}

/// Registry with the functions the stock entry binary ships:
///
/// - `echo`: joins its positional arguments with spaces
/// - `add`: sums numeric positional and keyword arguments
/// - `sleep`: sleeps for `#0` seconds
/// - `fail`: fails with the message in `#0`
pub fn builtin_registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with("echo", |call| {
            let words: Vec<String> = call
                .args()
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Ok(Value::String(words.join(" ")))
        })
        .with("add", |call| {
            let values = call.args().iter().chain(call.kwargs().values());
            let mut int_sum: i64 = 0;
            let mut float_sum: f64 = 0.0;
            let mut any_float = false;
            for (i, value) in values.enumerate() {
                if let Some(n) = value.as_i64() {
                    int_sum += n;
                    float_sum += n as f64;
                } else if let Some(f) = value.as_f64() {
                    any_float = true;
                    float_sum += f;
                } else {
                    return Err(CallError::InvalidArgument {
                        name: format!("#{}", i),
                        reason: format!("expected a number, got {}", value),
                    });
                }
            }
            Ok(if any_float {
                Value::from(float_sum)
            } else {
                Value::from(int_sum)
            })
        })
        .with("sleep", |call| {
            let secs: f64 = call.arg(0)?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(CallError::InvalidArgument {
                    name: "#0".to_string(),
                    reason: "seconds must be a non-negative number".to_string(),
                });
            }
            std::thread::sleep(Duration::from_secs_f64(secs));
            Ok(Value::Null)
        })
        .with("fail", |call| {
            let message = call
                .arg::<String>(0)
                .unwrap_or_else(|_| "requested failure".to_string());
            Err(CallError::Failed(message))
        })
}
