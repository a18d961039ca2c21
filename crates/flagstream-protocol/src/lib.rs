// flagstream-protocol: wire types and framing shared by the relay service.
//
// Three concerns live here, all frozen by upstream compatibility:
// - the SSE event payload schemas served to SDKs and consumed from upstream,
// - the analytics event schema (versions 1 through 4),
// - the SSE line-protocol decoder used by the upstream streaming client.

pub mod events;
pub mod sse;
pub mod stream;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event schema versions
// ---------------------------------------------------------------------------

/// Payloads at or above this schema version are forwarded verbatim; older
/// payloads go through the summarizer.
pub const SUMMARY_EVENTS_SCHEMA_VERSION: u32 = 3;

/// The schema version the relay emits for summarized output.
pub const CURRENT_EVENTS_SCHEMA_VERSION: u32 = 4;

// ---------------------------------------------------------------------------
// Header names
// ---------------------------------------------------------------------------

/// Integer schema version of an incoming event payload; absent means 1.
pub const EVENT_SCHEMA_HEADER: &str = "X-LaunchDarkly-Event-Schema";

/// Opaque tag string partitioning event delivery; preserved when proxying.
pub const TAGS_HEADER: &str = "X-LaunchDarkly-Tags";

/// Unique payload id set by SDKs; exposed through CORS for JS clients.
pub const PAYLOAD_ID_HEADER: &str = "X-LaunchDarkly-Payload-ID";

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// The JSON body used for all non-2xx handler responses,
/// e.g. `{"message":"body may not be empty"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorEnvelope {
            message: message.into(),
        }
    }
}
