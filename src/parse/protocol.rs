//! Frames exchanged with the isolated parse context.
//!
//! Both directions travel as JSON text so nothing but plain data crosses the boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation requested from the parse context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    /// Extract page metadata; payload is [`ExtractPayload`]
    ExtractMetadata,
    /// Liveness probe; answered with `"pong"`
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseRequest {
    pub req_id: u64,
    pub request_type: RequestKind,
    pub payload: Value,
}

/// Reply to a [`ParseRequest`]; `error` set means the request was rejected
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseReply {
    pub req_id: u64,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ParseReply {
    pub fn ok(req_id: u64, payload: Value) -> Self {
        Self {
            req_id,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(req_id: u64, error: impl Into<String>) -> Self {
        Self {
            req_id,
            payload: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractPayload {
    pub html: String,
    /// Page URL, used to resolve relative links such as `og:image`
    pub url: String,
}
