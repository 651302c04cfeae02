//! Invocation envelope exchanged between caller and provider.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A call as it travels to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeMessage {
    /// Target operation.
    pub service_id: String,
    /// Key used for consistent-hash selection and result caching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_key: Option<String>,
    /// Named call parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Out-of-band context (trace ids, tenant, ...).
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
}

impl InvokeMessage {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            service_key: None,
            parameters: BTreeMap::new(),
            attachments: BTreeMap::new(),
        }
    }

    /// Key used by the hash selector; falls back to the service id.
    pub fn routing_key(&self) -> &str {
        self.service_key.as_deref().unwrap_or(&self.service_id)
    }
}

/// Application-level error raised by the remote handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub code: i32,
    pub message: String,
}

/// Outcome of a call as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InvokeResult {
    Ok(serde_json::Value),
    Err(RemoteFault),
}

impl InvokeResult {
    pub fn ok(value: impl Into<serde_json::Value>) -> Self {
        Self::Ok(value.into())
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::Err(RemoteFault {
            code,
            message: message.into(),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}
