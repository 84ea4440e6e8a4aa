//! Explicit request context.
//!
//! Correlation data travels as a value through registration and submit
//! paths instead of thread-local ambient state, so every tracing event can
//! carry the correlation id regardless of which task executes it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-request context carried through control-plane operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Correlation id propagated from the caller, or generated at the edge.
    pub correlation_id: String,
    /// When the request entered the control plane.
    pub received_at: DateTime<Utc>,
    /// Free-form attributes (caller identity, client version, ...).
    pub attributes: HashMap<String, String>,
}

impl RequestContext {
    /// Context with a fresh correlation id.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    /// Context continuing an existing correlation id.
    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            received_at: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    /// Attach an attribute, returning the context for chaining.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
