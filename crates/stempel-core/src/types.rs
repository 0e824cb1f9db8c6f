// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Stempel watermark service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix applied to a source name to derive its output location.
///
/// Deferred requests write to this deterministic name so that redelivering
/// the same message overwrites one destination instead of accumulating
/// duplicates, and so clients can poll for the result without a callback.
pub const DESTINATION_PREFIX: &str = "watermarked_";

/// Output location name for a given source name.
pub fn destination_name(source_name: &str) -> String {
    format!("{DESTINATION_PREFIX}{source_name}")
}

/// Unique identifier correlating one inbound request across log events,
/// whether it completes inline or through the overflow queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inbound watermark request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkRequest {
    /// Name of the stored source document.
    pub source_name: String,
    /// Text to overlay on every page.
    pub overlay_text: String,
    /// Correlation ID for log events.
    pub correlation_id: RequestId,
}

impl WatermarkRequest {
    pub fn new(source_name: impl Into<String>, overlay_text: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            overlay_text: overlay_text.into(),
            correlation_id: RequestId::new(),
        }
    }

    /// Output location for this request.
    pub fn destination_name(&self) -> String {
        destination_name(&self.source_name)
    }
}

/// Wire record for a request deferred to the overflow queue.
///
/// One self-describing JSON document per message. Processing must be
/// idempotent: the deterministic destination name is recomputed from
/// `source_name` on every delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRequest {
    pub source_name: String,
    pub overlay_text: String,
}

impl From<&WatermarkRequest> for DeferredRequest {
    fn from(request: &WatermarkRequest) -> Self {
        Self {
            source_name: request.source_name.clone(),
            overlay_text: request.overlay_text.clone(),
        }
    }
}

/// Lifecycle phases of a watermark request.
///
/// `DeferredQueued → Processing` may repeat across redeliveries before the
/// request reaches `Completed`. Recorded in structured log events at each
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPhase {
    /// Received, not yet admitted or deferred.
    Submitted,
    /// Holds an admission slot and streams inline.
    AdmittedInteractive,
    /// Serialized onto the overflow queue.
    DeferredQueued,
    /// A pipeline run is executing for this request.
    Processing,
    /// Output fully written and flushed.
    Completed,
    /// Pipeline run aborted; queued requests will be redelivered.
    Failed,
}

/// Lifecycle states of the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Not accepting connections.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
}
