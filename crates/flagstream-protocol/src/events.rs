// Analytics event schema.
//
// Input payloads are JSON arrays of kind-tagged objects.  Schema 1 and 2
// payloads are parsed into these types for summarization; schema 3+ payloads
// are never parsed (forwarded verbatim).  Output payloads add `index` and
// `summary` events on top of the translated input kinds.

use flagstream_core::user::User;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Input events (schema 1 / 2)
// ---------------------------------------------------------------------------

/// One event as received from a legacy SDK.  Unknown kinds fail to parse and
/// are skipped by the caller rather than failing the whole payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InputEvent {
    Feature(FeatureEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    Alias(AliasEvent),
}

/// A feature evaluation event.  Schema 1 events lack `variation` and may
/// lack `version`; schema 2 events may carry `trackEvents` and
/// `debugEventsUntilDate` inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEvent {
    pub creation_date: u64,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub default: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_events: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyEvent {
    pub creation_date: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEvent {
    pub creation_date: u64,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasEvent {
    pub creation_date: u64,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_context_kind: Option<String>,
}

// ---------------------------------------------------------------------------
// Output events (current schema)
// ---------------------------------------------------------------------------

/// One event as delivered upstream after summarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputEvent {
    Feature(FeatureEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    Alias(AliasEvent),
    Index(IndexEvent),
    Summary(SummaryEvent),
}

/// Emitted once per deduplication window per user, carrying the full user
/// object so feature events can reference users by key alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEvent {
    pub creation_date: u64,
    pub user: User,
}

/// Aggregated feature-evaluation counts for one flush window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEvent {
    pub start_date: u64,
    pub end_date: u64,
    pub features: HashMap<String, FlagSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagSummary {
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub default: serde_json::Value,
    pub counters: Vec<FlagCounter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagCounter {
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Set when the flag was unknown to the store at translation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown: Option<bool>,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_feature_event_parses_without_variation() {
        let event: InputEvent = serde_json::from_str(
            r#"{"kind":"feature","creationDate":1000,"key":"f","user":{"key":"u"},"value":"a"}"#,
        )
        .unwrap();
        match event {
            InputEvent::Feature(f) => {
                assert_eq!(f.key, "f");
                assert_eq!(f.variation, None);
                assert_eq!(f.version, None);
                assert_eq!(f.value, json!("a"));
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_fails_to_parse_alone() {
        let result = serde_json::from_str::<InputEvent>(
            r#"{"kind":"diagnostic","creationDate":1,"foo":"bar"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn output_events_tag_with_kind() {
        let index = OutputEvent::Index(IndexEvent {
            creation_date: 5,
            user: User::with_key("u"),
        });
        let value = serde_json::to_value(&index).unwrap();
        assert_eq!(value["kind"], "index");
        assert_eq!(value["user"]["key"], "u");

        let summary = OutputEvent::Summary(SummaryEvent {
            start_date: 1,
            end_date: 2,
            features: HashMap::from([(
                "f".to_owned(),
                FlagSummary {
                    default: json!("d"),
                    counters: vec![FlagCounter {
                        value: json!("a"),
                        variation: Some(0),
                        version: Some(3),
                        unknown: None,
                        count: 7,
                    }],
                },
            )]),
        });
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["kind"], "summary");
        assert_eq!(value["features"]["f"]["counters"][0]["count"], 7);
        assert!(value["features"]["f"]["counters"][0].get("unknown").is_none());
    }
}
