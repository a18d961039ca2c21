// SSE event payload schemas for the streaming endpoints.
//
// Server streams carry `put`/`patch`/`delete` events whose data fields are
// the JSON objects below.  Client eval streams carry the same event names
// but with per-user evaluated flag state; client ping streams carry a bare
// `ping` whose data is a single space.

use flagstream_core::model::AllData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Server stream payloads (/all and /flags)
// ---------------------------------------------------------------------------

/// `put` data on the all-data stream: `{"path":"/","data":{"flags":{...},"segments":{...}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllPutData {
    pub path: String,
    pub data: AllData,
}

impl AllPutData {
    pub fn new(data: AllData) -> Self {
        AllPutData {
            path: "/".to_owned(),
            data,
        }
    }
}

/// `patch` data on server streams: `{"path":"/flags/{key}","data":<item>}`.
///
/// On the flags-only stream the path omits the kind prefix (`/{key}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchData {
    pub path: String,
    pub data: serde_json::Value,
}

/// `delete` data on server streams: `{"path":"/flags/{key}","version":N}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteData {
    pub path: String,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Client eval stream payloads (/eval and /meval)
// ---------------------------------------------------------------------------

/// Evaluated state of one flag for one user, as served on eval streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFlagState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_events: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
}

/// `put` data on eval streams: flag key -> evaluated state.
pub type EvalPutData = HashMap<String, ClientFlagState>;

/// `delete` data on eval streams: `{"key":"flag-key","version":N}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalDeleteData {
    pub key: String,
    pub version: u64,
}

/// The data field of a `ping` event.  Always a single space.
pub const PING_DATA: &str = " ";
