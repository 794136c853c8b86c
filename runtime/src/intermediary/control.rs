//! Administrative control protocol.
//!
//! Messages are JSON objects tagged by `type`:
//!
//! | type           | payload             | reply                              |
//! |----------------|---------------------|------------------------------------|
//! | `SKIP_WAITING` | none                | `{success}`                        |
//! | `CACHE_URLS`   | `data: {urls: [..]}`| `{success, results: [{url, ok}]}`  |
//! | `CLEAR_CACHE`  | none                | `{success}`                        |
//! | `CACHE_STATUS` | none                | `{namespace: entry count}`         |

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use upm_embed::ParseError;

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SkipWaiting,
    CacheUrls { urls: Vec<String> },
    ClearCache,
    CacheStatus,
}

impl ControlMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SkipWaiting => "SKIP_WAITING",
            Self::CacheUrls { .. } => "CACHE_URLS",
            Self::ClearCache => "CLEAR_CACHE",
            Self::CacheStatus => "CACHE_STATUS",
        }
    }

    /// Wire form of this message.
    pub fn to_json(&self) -> Value {
        match self {
            Self::CacheUrls { urls } => serde_json::json!({
                "type": self.type_name(),
                "data": { "urls": urls },
            }),
            _ => serde_json::json!({ "type": self.type_name() }),
        }
    }
}

/// Per-URL outcome of `CACHE_URLS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlResult {
    pub url: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply to a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlReply {
    Ack {
        success: bool,
    },
    Cached {
        success: bool,
        results: Vec<UrlResult>,
    },
    Status(IndexMap<String, usize>),
}

impl ControlReply {
    pub fn ack() -> Self {
        Self::Ack { success: true }
    }
}

/// Parse a JSON control message.
pub fn parse_message(json: &str) -> Result<ControlMessage, ParseError> {
    let v: Value = serde_json::from_str(json)
        .map_err(|e| ParseError::MalformedControlMessage(e.to_string()))?;
    parse_value(&v)
}

pub fn parse_value(v: &Value) -> Result<ControlMessage, ParseError> {
    let kind = v
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ParseError::MalformedControlMessage("missing 'type' field".to_string()))?;

    match kind {
        "SKIP_WAITING" => Ok(ControlMessage::SkipWaiting),
        "CLEAR_CACHE" => Ok(ControlMessage::ClearCache),
        "CACHE_STATUS" => Ok(ControlMessage::CacheStatus),
        "CACHE_URLS" => {
            let urls = v
                .get("data")
                .and_then(|d| d.get("urls"))
                .and_then(|u| u.as_array())
                .ok_or_else(|| {
                    ParseError::MalformedControlMessage("CACHE_URLS needs data.urls".to_string())
                })?;
            let urls = urls
                .iter()
                .map(|u| {
                    u.as_str().map(str::to_string).ok_or_else(|| {
                        ParseError::MalformedControlMessage(format!("non-string url: {u}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ControlMessage::CacheUrls { urls })
        }
        other => Err(ParseError::UnknownControlMessage(other.to_string())),
    }
}

/// Format a reply as a JSON string.
pub fn format_reply(reply: &ControlReply) -> String {
    serde_json::to_string(reply).unwrap_or_else(|_| r#"{"success":false}"#.to_string())
}
