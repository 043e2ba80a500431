//! Line-delimited JSON-RPC 2.0 framing.

use serde_json::{json, Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const ERROR_PARSE: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_HANDLER_FAULT: i64 = -32000;

pub const STREAM_NOTIFICATION_METHOD: &str = "tools/stream";

/// A validated request. `id` is `None` for notifications, which are never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: Option<Value>,
    pub method: String,
    pub params: Map<String, Value>,
}

impl JsonRpcRequest {
    /// The id to echo in a response; notifications answer with `null`.
    pub fn response_id(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchError {
    pub id: Value,
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl DispatchError {
    pub fn new(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn into_frame(self) -> Value {
        let mut frame = error_frame(self.id, self.code, self.message);
        if let Some(data) = self.data {
            frame["error"]["data"] = data;
        }
        frame
    }
}

/// One inbound line after JSON decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    Single(Value),
    Batch(Vec<Value>),
}

/// Decodes one non-blank input line. Malformed JSON yields a parse error
/// addressed to `id: null`.
pub fn parse_line(line: &str) -> Result<InboundLine, DispatchError> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Array(items)) => Ok(InboundLine::Batch(items)),
        Ok(value) => Ok(InboundLine::Single(value)),
        Err(error) => Err(DispatchError::new(
            Value::Null,
            ERROR_PARSE,
            format!("Parse error: {error}"),
        )),
    }
}

pub fn parse_request(value: &Value) -> Result<JsonRpcRequest, DispatchError> {
    let Some(object) = value.as_object() else {
        return Err(DispatchError::new(
            Value::Null,
            ERROR_INVALID_REQUEST,
            "jsonrpc request must be an object",
        ));
    };
    let id = object.get("id").cloned();
    let response_id = id.clone().unwrap_or(Value::Null);
    if let Some(version) = object.get("jsonrpc") {
        if version.as_str() != Some(JSONRPC_VERSION) {
            return Err(DispatchError::new(
                response_id,
                ERROR_INVALID_REQUEST,
                format!("jsonrpc must be '{JSONRPC_VERSION}'"),
            ));
        }
    }
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            DispatchError::new(
                response_id.clone(),
                ERROR_INVALID_REQUEST,
                "jsonrpc request must include non-empty method",
            )
        })?;
    let params = match object.get("params") {
        Some(Value::Object(params)) => params.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(_) => {
            return Err(DispatchError::new(
                response_id,
                ERROR_INVALID_PARAMS,
                "jsonrpc request params must be an object",
            ))
        }
    };
    Ok(JsonRpcRequest {
        id,
        method: method.to_string(),
        params,
    })
}

pub fn result_frame(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub fn error_frame(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}

pub fn notification_frame(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}

pub fn is_error_frame(frame: &Value) -> bool {
    frame.get("error").is_some()
}
