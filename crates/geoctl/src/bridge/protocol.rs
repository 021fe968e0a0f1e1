//! Distinguished wire values for the worker protocol.
//!
//! Requests and responses are opaque JSON as far as the transport is
//! concerned; only a handful of values carry protocol meaning:
//!
//! - `"abort"` — the worker terminates with exit status 1 and sends no
//!   response line.
//! - `null` — cooperative termination: the worker writes one closing line,
//!   closes its output, and exits 0.
//! - `"closing"` — the closing acknowledgement written by the worker on
//!   termination (or on end of input).
//! - `"success"` — marker prefixed to echo-mode mock responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request string that makes the worker exit abnormally without responding.
pub const ABORT: &str = "abort";

/// Closing acknowledgement written by the worker before a clean exit.
pub const CLOSING: &str = "closing";

/// Success marker used by the echo-mode mock worker.
pub const SUCCESS: &str = "success";

pub fn abort_request() -> Value {
    Value::String(ABORT.to_owned())
}

/// The cooperative termination request: a bare JSON `null` line.
pub fn termination_request() -> Value {
    Value::Null
}

pub fn closing_line() -> Value {
    Value::String(CLOSING.to_owned())
}

pub fn is_abort(value: &Value) -> bool {
    value.as_str() == Some(ABORT)
}

pub fn is_termination(value: &Value) -> bool {
    value.is_null()
}

pub fn is_closing(value: &Value) -> bool {
    value.as_str() == Some(CLOSING)
}

/// Echo-mode response shape: `["success", payload]`.
pub fn success_response(payload: Value) -> Value {
    Value::Array(vec![Value::String(SUCCESS.to_owned()), payload])
}

/// One expected request and the response scripted for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Exact payload the controller is expected to send.
    pub request: Value,
    /// Payload the mock answers with when the request matches.
    pub response: Value,
}

/// Prescripted request/response pairs for the scripted mock worker.
///
/// Steps are consumed in order; the scripted responder fails the worker
/// loudly on the first request that does not match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
