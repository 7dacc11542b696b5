//! EKS audit events
//!
//! Cluster lifecycle events arrive as EventBridge envelopes wrapping a
//! CloudTrail record:
//!
//! ```json
//! {
//!   "detail": {
//!     "eventSource": "eks.amazonaws.com",
//!     "eventName": "CreateCluster",
//!     "requestParameters": { "name": "my-cluster" }
//!   }
//! }
//! ```
//!
//! A bare `detail` object is accepted too. Only the cluster name is required;
//! the event name is needed only when the event has to be routed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Event source of EKS API calls
pub const EKS_EVENT_SOURCE: &str = "eks.amazonaws.com";

/// Lifecycle transition an audit event reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleKind {
    /// `CreateCluster`
    Created,
    /// `DeleteCluster`
    Deleted,
}

impl LifecycleKind {
    /// Audit event name of this transition
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Created => "CreateCluster",
            Self::Deleted => "DeleteCluster",
        }
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct RequestParameters {
    name: String,
}

/// An EKS cluster lifecycle audit event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_name: Option<String>,
    request_parameters: RequestParameters,
}

impl AuditEvent {
    /// Build an event for the given transition
    pub fn new(kind: LifecycleKind, cluster: impl Into<String>) -> Self {
        Self {
            event_source: Some(EKS_EVENT_SOURCE.to_string()),
            event_name: Some(kind.event_name().to_string()),
            request_parameters: RequestParameters {
                name: cluster.into(),
            },
        }
    }

    /// Parse an envelope or bare detail object
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let detail = match value {
            serde_json::Value::Object(mut map) if map.contains_key("detail") => map
                .remove("detail")
                .unwrap_or(serde_json::Value::Null),
            other => other,
        };

        let event: Self = serde_json::from_value(detail)
            .map_err(|e| Error::event(format!("malformed audit event: {}", e)))?;

        if let Some(source) = &event.event_source {
            if source != EKS_EVENT_SOURCE {
                return Err(Error::event(format!(
                    "unexpected event source {}, expected {}",
                    source, EKS_EVENT_SOURCE
                )));
            }
        }
        if event.request_parameters.name.is_empty() {
            return Err(Error::event("audit event carries an empty cluster name"));
        }

        Ok(event)
    }

    /// Parse an event from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::event(format!("audit event is not JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Name of the cluster the event refers to
    pub fn cluster_name(&self) -> &str {
        &self.request_parameters.name
    }

    /// Raw event name, if present
    pub fn event_name(&self) -> Option<&str> {
        self.event_name.as_deref()
    }

    /// Lifecycle transition the event reports
    pub fn kind(&self) -> Result<LifecycleKind> {
        match self.event_name.as_deref() {
            Some("CreateCluster") => Ok(LifecycleKind::Created),
            Some("DeleteCluster") => Ok(LifecycleKind::Deleted),
            Some(other) => Err(Error::event(format!("unsupported event name {}", other))),
            None => Err(Error::event("audit event has no eventName")),
        }
    }
}
