//! Request context that travels with jobs and worker messages.
//!
//! A [`RequestContext`] is live: it holds a monotonic clock reading and is
//! only meaningful inside the process that created it. Anything crossing the
//! queue or the worker bridge carries a [`SerializedRequestContext`] instead,
//! produced by [`RequestContext::serialize`] and turned back into a live
//! context on the receiving side with [`RequestContext::deserialize`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

use super::tracing::current_trace_id;

/// Live, process-local request context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub trace_id: Option<String>,
    pub extra: HashMap<String, String>,
    received_at: DateTime<Utc>,
    started: Instant,
}

/// Plain representation of a [`RequestContext`], safe to put in job data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedRequestContext {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// New context with a random request id and the current trace id.
    pub fn new() -> Self {
        Self::with_request_id(Uuid::new_v4().to_string())
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: None,
            user_id: None,
            trace_id: current_trace_id(),
            extra: HashMap::new(),
            received_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Time since this context was created or reconstructed in this process.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn serialize(&self) -> SerializedRequestContext {
        SerializedRequestContext {
            request_id: self.request_id.clone(),
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            trace_id: self.trace_id.clone(),
            extra: self.extra.clone(),
            received_at: self.received_at,
        }
    }

    /// Rebuild a live context. The local clock restarts; `received_at` keeps
    /// the original wall-clock time.
    pub fn deserialize(serialized: SerializedRequestContext) -> Self {
        Self {
            request_id: serialized.request_id,
            tenant_id: serialized.tenant_id,
            user_id: serialized.user_id,
            trace_id: serialized.trace_id,
            extra: serialized.extra,
            received_at: serialized.received_at,
            started: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_keeps_identity() {
        let ctx = RequestContext::with_request_id("req-1")
            .with_tenant("acme")
            .with_user("u-7")
            .with_extra("locale", "de");

        let json = serde_json::to_value(ctx.serialize()).unwrap();
        assert_eq!(json["request_id"], "req-1");
        assert_eq!(json["tenant_id"], "acme");
        assert!(json.get("trace_id").is_none());

        let restored = RequestContext::deserialize(serde_json::from_value(json).unwrap());
        assert_eq!(restored.request_id, "req-1");
        assert_eq!(restored.user_id.as_deref(), Some("u-7"));
        assert_eq!(restored.extra.get("locale").map(String::as_str), Some("de"));
        assert_eq!(restored.received_at(), ctx.received_at());
    }

    #[test]
    fn test_new_contexts_are_distinct() {
        assert_ne!(RequestContext::new().request_id, RequestContext::new().request_id);
    }
}
