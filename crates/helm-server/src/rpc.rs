use helm_hub::HubError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: &str = "PARSE_ERROR";
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Client request: `{ id?, method, params? }`.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// Wire response: `{ id, success, result?, error?: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Failure of a single RPC call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::Internal(_) => INTERNAL_ERROR,
            Self::Hub(e) => e.code(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: &RpcError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(ErrorBody {
                code: error.code().to_string(),
                message: error.to_string(),
            }),
        }
    }

    pub fn from_result(id: Option<Value>, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(e) => Self::failure(id, &e),
        }
    }
}

/// Extract a required string param.
pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::InvalidParams(format!("missing required parameter: {key}")))
}

pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Extract an optional non-negative integer param, rejecting other types.
pub fn optional_u32(params: &Value, key: &str) -> Result<Option<u32>, RpcError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| RpcError::InvalidParams(format!("{key} must be a non-negative integer"))),
    }
}
