//! Script exceptions.
//!
//! A callable that throws leaves an exception pending on its context. The
//! engine holds at most one pending exception per context until someone
//! takes and clears it.

use crate::value::Value;
use std::fmt;

/// An exception raised by script code.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    name: String,
    message: String,
    value: Value,
}

impl Exception {
    /// Create an exception with an explicit error name.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            name: name.into(),
            value: Value::String(message.clone()),
            message,
        }
    }

    /// A plain `Error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// An engine-side failure that did not come from script code.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("InternalError", message)
    }

    /// A thrown non-error value.
    pub fn thrown(value: Value) -> Self {
        Self {
            name: "Uncaught".to_string(),
            message: value.to_string(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The thrown value itself.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for Exception {}
