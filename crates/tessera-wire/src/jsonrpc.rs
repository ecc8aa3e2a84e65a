use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

/// A validated inbound call. `id == None` marks a notification, which never
/// gets a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: Option<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    /// Serialized as `null` when the failing request's id could not be read.
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: &RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error.to_error_object()),
        }
    }

    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────

/// Protocol-level failure. Every variant maps to a JSON-RPC error object; the
/// connection that produced it stays open.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("connection not initialized; send `initialize` first")]
    NotInitialized,
    #[error("query not answered within {}ms", .0.as_millis())]
    DerefTimeout(Duration),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub const PARSE: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
    pub const NOT_INITIALIZED: i64 = -32002;
    pub const DEREF_TIMEOUT: i64 = -32001;

    pub fn code(&self) -> i64 {
        match self {
            RpcError::Parse(_) => Self::PARSE,
            RpcError::InvalidRequest(_) => Self::INVALID_REQUEST,
            RpcError::MethodNotFound(_) => Self::METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => Self::INVALID_PARAMS,
            RpcError::NotInitialized => Self::NOT_INITIALIZED,
            RpcError::DerefTimeout(_) => Self::DEREF_TIMEOUT,
            RpcError::Internal(_) => Self::INTERNAL,
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        let data = match self {
            RpcError::DerefTimeout(limit) => Some(json!({ "timeoutMs": limit.as_millis() as u64 })),
            _ => None,
        };
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }
}

// ── Parsing ─────────────────────────────────────────────────────

/// A request that failed validation, with whatever id could be recovered.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub id: Option<RequestId>,
    pub error: RpcError,
}

impl Rejected {
    fn new(id: Option<RequestId>, error: RpcError) -> Self {
        Self { id, error }
    }

    pub fn into_response(self) -> Response {
        Response::failure(self.id, &self.error)
    }
}

/// One decoded frame: either a single message or a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Single(Result<Request, Rejected>),
    Batch(Vec<Result<Request, Rejected>>),
}

pub fn parse_incoming(bytes: &[u8]) -> Incoming {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => return Incoming::Single(Err(Rejected::new(None, RpcError::Parse(e.to_string())))),
    };
    match value {
        Value::Array(items) if items.is_empty() => Incoming::Single(Err(Rejected::new(
            None,
            RpcError::InvalidRequest("empty batch".into()),
        ))),
        Value::Array(items) => Incoming::Batch(items.into_iter().map(parse_request).collect()),
        other => Incoming::Single(parse_request(other)),
    }
}

pub fn parse_request(value: Value) -> Result<Request, Rejected> {
    let Value::Object(mut object) = value else {
        return Err(Rejected::new(
            None,
            RpcError::InvalidRequest("request must be a JSON object".into()),
        ));
    };

    let id = match object.remove("id") {
        None => None,
        Some(Value::String(s)) => Some(RequestId::String(s)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(n) => Some(RequestId::Number(n)),
            None => {
                return Err(Rejected::new(
                    None,
                    RpcError::InvalidRequest(format!("id must be an integer or string, got {n}")),
                ));
            }
        },
        Some(other) => {
            return Err(Rejected::new(
                None,
                RpcError::InvalidRequest(format!("id must be an integer or string, got {other}")),
            ));
        }
    };

    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        _ => {
            return Err(Rejected::new(
                id,
                RpcError::InvalidRequest("`jsonrpc` must be \"2.0\"".into()),
            ));
        }
    }

    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        _ => {
            return Err(Rejected::new(
                id,
                RpcError::InvalidRequest("`method` must be a string".into()),
            ));
        }
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
        Some(_) => {
            return Err(Rejected::new(
                id,
                RpcError::InvalidRequest("`params` must be an object or array".into()),
            ));
        }
    };

    Ok(Request {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    })
}
