// Flag and segment value types, mirroring the upstream JSON schema.
//
// All field names serialize in camelCase to stay wire-compatible with the
// upstream provider.  Every field except `key` is defaulted so that deleted
// tombstones (`{"key":..,"version":..,"deleted":true}`) round-trip cleanly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Data kinds
// ---------------------------------------------------------------------------

/// The two item namespaces held by a replicated store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Flags,
    Segments,
}

impl DataKind {
    /// The path segment used in upstream `patch`/`delete` event paths,
    /// e.g. `/flags/my-flag`.
    pub fn path_component(self) -> &'static str {
        match self {
            DataKind::Flags => "flags",
            DataKind::Segments => "segments",
        }
    }

    /// Parse an upstream event path of the form `/flags/{key}` or
    /// `/segments/{key}`.  Returns `None` for `/` or unrecognized prefixes.
    pub fn parse_path(path: &str) -> Option<(DataKind, &str)> {
        if let Some(key) = path.strip_prefix("/flags/") {
            Some((DataKind::Flags, key))
        } else if let Some(key) = path.strip_prefix("/segments/") {
            Some((DataKind::Segments, key))
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Feature flags
// ---------------------------------------------------------------------------

/// A single feature flag as replicated from upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub variations: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_events: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl FeatureFlag {
    /// A tombstone recording that `key` was deleted at `version`.
    pub fn tombstone(key: &str, version: u64) -> Self {
        FeatureFlag {
            key: key.to_owned(),
            version,
            on: false,
            salt: String::new(),
            prerequisites: Vec::new(),
            targets: Vec::new(),
            rules: Vec::new(),
            fallthrough: VariationOrRollout::default(),
            off_variation: None,
            variations: Vec::new(),
            track_events: None,
            debug_events_until_date: None,
            deleted: true,
        }
    }
}

/// A prerequisite: the named flag must evaluate to the given variation
/// before this flag's own rules are considered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
}

/// An individual-user target: any listed user key gets `variation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: usize,
}

/// One flag rule: all clauses must match (AND), then the variation or
/// rollout applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
}

/// Either a fixed variation index or a weighted rollout.  When both are
/// present the fixed variation wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

/// A weighted rollout across variations.  Weights are in units of 0.001%
/// (i.e. out of 100000); a sum under 100000 leaves an unassigned remainder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    #[serde(default)]
    pub weight: u32,
}

// ---------------------------------------------------------------------------
// Clauses
// ---------------------------------------------------------------------------

/// Clause operators.  `values` are OR'd within one clause; clauses are AND'd
/// within one rule.  Unknown operators deserialize to `Unknown` and never
/// match, so newer upstream data degrades instead of failing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default)]
    pub attribute: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    #[serde(default)]
    pub negate: bool,
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// A user segment.  `included`/`excluded` are explicit user-key lists that
/// short-circuit the rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl Segment {
    /// A tombstone recording that `key` was deleted at `version`.
    pub fn tombstone(key: &str, version: u64) -> Self {
        Segment {
            key: key.to_owned(),
            version,
            included: Vec::new(),
            excluded: Vec::new(),
            salt: String::new(),
            rules: Vec::new(),
            deleted: true,
        }
    }
}

/// One segment rule: all clauses must match; an optional weight then
/// admits only the matching fraction of users (bucketed like a rollout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
}

// ---------------------------------------------------------------------------
// Store items
// ---------------------------------------------------------------------------

/// A versioned item held by the replicated store: either kind, including
/// tombstones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreItem {
    Flag(FeatureFlag),
    Segment(Segment),
}

impl StoreItem {
    pub fn key(&self) -> &str {
        match self {
            StoreItem::Flag(f) => &f.key,
            StoreItem::Segment(s) => &s.key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(f) => f.version,
            StoreItem::Segment(s) => s.version,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            StoreItem::Flag(f) => f.deleted,
            StoreItem::Segment(s) => s.deleted,
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            StoreItem::Flag(_) => DataKind::Flags,
            StoreItem::Segment(_) => DataKind::Segments,
        }
    }

    /// A tombstone of the matching kind.
    pub fn tombstone(kind: DataKind, key: &str, version: u64) -> Self {
        match kind {
            DataKind::Flags => StoreItem::Flag(FeatureFlag::tombstone(key, version)),
            DataKind::Segments => StoreItem::Segment(Segment::tombstone(key, version)),
        }
    }
}

/// A full dataset as carried by upstream `put` events and store `init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, FeatureFlag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}
