use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::storage::StorageError;

/// An error raised by handler code, either reported through a completion or
/// thrown synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: capture_stack(),
        }
    }

    /// Builds an error out of a caught panic. Payloads that are not strings
    /// degrade to a generic message.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "handler panicked with a non-string payload".to_string()
        };
        Self::named("Panic", message)
    }

    /// Handlers may report arbitrary JSON as their error. Objects carrying a
    /// `message` keep their name/message/stack; anything else is stringified.
    pub fn from_value(value: &serde_json::Value) -> Self {
        if let Some(object) = value.as_object() {
            if let Some(message) = object.get("message").and_then(|v| v.as_str()) {
                let name = object
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Error");
                return Self {
                    name: name.to_string(),
                    message: message.to_string(),
                    stack: object
                        .get("stack")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                };
            }
        }
        let message = match value {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Self {
            name: "Error".to_string(),
            message,
            stack: None,
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<&str> for ScriptError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ScriptError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Value> for ScriptError {
    fn from(value: serde_json::Value) -> Self {
        Self::from_value(&value)
    }
}

impl From<StorageError> for ScriptError {
    fn from(err: StorageError) -> Self {
        Self::named("StorageError", err.to_string())
    }
}

impl From<serde_json::Error> for ScriptError {
    fn from(err: serde_json::Error) -> Self {
        Self::named("SyntaxError", err.to_string())
    }
}

fn capture_stack() -> Option<String> {
    let backtrace = Backtrace::capture();
    (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string())
}

/// Failure to turn handler source into a callable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub code: u16,
    pub message: String,
    pub details: Option<String>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(400, message)
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Every failure that can end a request. Each variant maps onto one HTTP
/// status through [`Fault::to_body`].
#[derive(Debug, Clone, Error)]
pub enum Fault {
    #[error("Malformed x-wt-params header: {0}")]
    MalformedEnvelope(String),

    #[error("Request body exceeds the size limit of {limit} bytes.")]
    SizeLimit { limit: usize },

    #[error("Failed to read request body: {0}")]
    BodyRead(String),

    #[error("Handler declares {arity} parameter(s); supported signatures take 1, 2 or 3.")]
    InvalidSignature { arity: usize },

    #[error("{0}")]
    Handler(ScriptError),

    #[error("{0}")]
    Serialization(String),

    #[error("{0}")]
    Unhandled(ScriptError),

    #[error("{0}")]
    Compile(CompileError),

    #[error("{0}")]
    Server(String),
}

impl Fault {
    pub fn code(&self) -> u16 {
        match self {
            Fault::MalformedEnvelope(_) => 400,
            Fault::SizeLimit { .. } => 413,
            Fault::BodyRead(_) => 400,
            Fault::InvalidSignature { .. } => 500,
            Fault::Handler(_) => 400,
            Fault::Serialization(_) => 400,
            Fault::Unhandled(_) => 500,
            Fault::Compile(err) => err.code,
            Fault::Server(_) => 500,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Fault::MalformedEnvelope(_) => "Malformed x-wt-params header.",
            Fault::SizeLimit { .. } => "Request body exceeds the size limit.",
            Fault::BodyRead(_) => "Failed to read request body.",
            Fault::InvalidSignature { .. } => "Unsupported handler signature.",
            Fault::Handler(_) => "Script returned an error.",
            Fault::Serialization(_) => "Error when JSON serializing the result of the handler.",
            Fault::Unhandled(_) => "Script generated an unhandled synchronous exception.",
            Fault::Compile(_) => "Failed to compile the handler.",
            Fault::Server(_) => "Server error",
        }
    }

    fn name(&self) -> Option<&'static str> {
        match self {
            Fault::MalformedEnvelope(_) => Some("MalformedEnvelopeError"),
            Fault::SizeLimit { .. } => Some("PayloadTooLargeError"),
            Fault::BodyRead(_) => Some("BadRequestError"),
            Fault::InvalidSignature { .. } => Some("InvalidSignatureError"),
            Fault::Serialization(_) => Some("SerializationError"),
            Fault::Compile(_) => Some("CompileError"),
            Fault::Handler(_) | Fault::Unhandled(_) | Fault::Server(_) => None,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let code = self.code();
        let error = self.description().to_string();
        match self {
            Fault::Handler(source) | Fault::Unhandled(source) => ErrorBody {
                code,
                error,
                details: source.to_string(),
                name: Some(source.name.clone()),
                message: Some(source.message.clone()),
                stack: source.stack.clone(),
            },
            Fault::Compile(source) => ErrorBody {
                code,
                error,
                details: source
                    .details
                    .clone()
                    .unwrap_or_else(|| source.message.clone()),
                name: self.name().map(str::to_string),
                message: Some(source.message.clone()),
                stack: None,
            },
            Fault::Server(details) => ErrorBody {
                code,
                error,
                details: details.clone(),
                name: None,
                message: None,
                stack: None,
            },
            other => ErrorBody {
                code,
                error,
                details: other.to_string(),
                name: other.name().map(str::to_string),
                message: Some(other.to_string()),
                stack: None,
            },
        }
    }
}

impl From<EnvelopeError> for Fault {
    fn from(err: EnvelopeError) -> Self {
        Fault::MalformedEnvelope(err.to_string())
    }
}

impl From<CompileError> for Fault {
    fn from(err: CompileError) -> Self {
        Fault::Compile(err)
    }
}

/// Uniform JSON shape of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub error: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorBody {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl From<&Fault> for ErrorBody {
    fn from(fault: &Fault) -> Self {
        fault.to_body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_fault_maps_to_bad_request() {
        let body = Fault::Handler(ScriptError::new("nope")).to_body();
        assert_eq!(body.code, 400);
        assert_eq!(body.error, "Script returned an error.");
        assert_eq!(body.details, "Error: nope");
        assert_eq!(body.message.as_deref(), Some("nope"));
    }

    #[test]
    fn unhandled_exception_maps_to_server_error() {
        let body = Fault::Unhandled(ScriptError::new("boom")).to_body();
        assert_eq!(body.code, 500);
        assert!(body.error.contains("unhandled synchronous exception"));
    }

    #[test]
    fn uncoded_faults_default_to_server_error() {
        let body = Fault::Server("worker vanished".into()).to_body();
        assert_eq!(body.code, 500);
        assert_eq!(body.error, "Server error");
        assert_eq!(body.details, "worker vanished");
        let json = body.to_json().expect("json");
        assert!(!json.contains("\"name\""));
    }

    #[test]
    fn size_limit_uses_payload_too_large() {
        let body = Fault::SizeLimit { limit: 16 }.to_body();
        assert_eq!(body.code, 413);
        assert!(body.details.contains("16"));
        assert_eq!(body.name.as_deref(), Some("PayloadTooLargeError"));
    }

    #[test]
    fn compile_fault_keeps_its_own_code() {
        let fault = Fault::from(CompileError::with_code(422, "bad source").with_details("line 1"));
        let body = fault.to_body();
        assert_eq!(body.code, 422);
        assert_eq!(body.details, "line 1");
    }

    #[test]
    fn panic_payloads_degrade_to_strings() {
        let from_str = ScriptError::from_panic(&"boom");
        assert_eq!(from_str.message, "boom");

        let from_string = ScriptError::from_panic(&String::from("kaboom"));
        assert_eq!(from_string.message, "kaboom");

        let opaque = ScriptError::from_panic(&42_u32);
        assert!(opaque.message.contains("non-string"));
    }

    #[test]
    fn json_values_become_script_errors() {
        let err = ScriptError::from_value(&serde_json::json!({
            "name": "TypeError",
            "message": "bad input",
        }));
        assert_eq!(err.to_string(), "TypeError: bad input");

        let err = ScriptError::from_value(&serde_json::json!([1, 2]));
        assert_eq!(err.message, "[1,2]");

        let err = ScriptError::from_value(&serde_json::json!("plain"));
        assert_eq!(err.message, "plain");
    }
}
