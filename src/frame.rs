use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// A single text frame on the signaling channel.
///
/// Requests carry an `id` only when the sender expects a response.
/// Responses are correlated by `request_id`; `error` is set when the
/// remote handler failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Request {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        method: String,
        params: Value,
    },
    Response {
        request_id: String,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawRequest {
    #[serde(default)]
    id: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
}

impl Frame {
    pub fn request(id: Option<String>, method: &str, params: Value) -> Self {
        Frame::Request {
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn response(request_id: String, data: Value) -> Self {
        Frame::Response {
            request_id,
            data,
            error: None,
        }
    }

    pub fn error_response(request_id: String, error: String) -> Self {
        Frame::Response {
            request_id,
            data: Value::Null,
            error: Some(error),
        }
    }

    /// Classifies a raw frame. Anything tagged `"request"` is a request;
    /// anything else carrying a `request_id` is a response.
    pub fn parse(raw: &str) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_str(raw)?;
        let obj = value
            .as_object()
            .ok_or_else(|| RpcError::Malformed("frame is not a JSON object".into()))?;

        if obj.get("type").and_then(Value::as_str) == Some("request") {
            let req: RawRequest = serde_json::from_value(value)?;
            return Ok(Frame::Request {
                id: req.id,
                method: req.method,
                params: req.params,
            });
        }

        match obj.get("request_id") {
            Some(Value::String(request_id)) => Ok(Frame::Response {
                request_id: request_id.clone(),
                data: obj.get("data").cloned().unwrap_or(Value::Null),
                error: obj.get("error").and_then(Value::as_str).map(str::to_owned),
            }),
            Some(other) => Err(RpcError::Malformed(format!(
                "request_id must be a string, got {}",
                other
            ))),
            None => Err(RpcError::Malformed(
                "frame is neither a request nor a response".into(),
            )),
        }
    }

    pub fn encode(&self) -> Result<String, RpcError> {
        Ok(serde_json::to_string(self)?)
    }
}
