//! Events emitted by the lifecycle engine.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::resource::ResourceSpec;

/// Outcome of a retrieval or renewal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Failure,
}

/// A change notification published to downstream subscribers.
///
/// The payload is a snapshot of the secret data at emission time; mutating
/// it cannot affect engine state.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub kind: EventKind,
    pub resource: Arc<ResourceSpec>,
    pub payload: Option<Map<String, Value>>,
}

impl ResourceEvent {
    pub fn is_success(&self) -> bool {
        self.kind == EventKind::Success
    }
}
