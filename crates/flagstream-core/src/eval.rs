// Flag evaluation for client-side eval streams.
//
// Evaluation order: off -> prerequisites -> individual targets -> rules in
// order -> fallthrough.  Anything malformed (out-of-range variation index,
// missing prerequisite flag) falls back to the off variation; evaluation
// never panics and never recurses into a prerequisite cycle.

use crate::bucket::bucket_user;
use crate::model::{Clause, FeatureFlag, Operator, Segment, VariationOrRollout};
use crate::user::User;
use serde_json::Value;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Read access to related flags and segments during evaluation.
///
/// Implemented by the relay's replicated store; tests implement it over
/// plain maps.
pub trait DataProvider {
    fn flag(&self, key: &str) -> Option<FeatureFlag>;
    fn segment(&self, key: &str) -> Option<Segment>;
}

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// The outcome of evaluating one flag for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    /// The variation value, if any variation was selected.
    pub value: Option<Value>,
    /// The index of the selected variation.
    pub variation_index: Option<usize>,
}

impl EvalResult {
    fn empty() -> Self {
        EvalResult {
            value: None,
            variation_index: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Evaluate `flag` for `user`, resolving prerequisites and segments through
/// `provider`.
pub fn evaluate(flag: &FeatureFlag, user: &User, provider: &dyn DataProvider) -> EvalResult {
    let mut seen = HashSet::new();
    evaluate_internal(flag, user, provider, &mut seen)
}

fn evaluate_internal(
    flag: &FeatureFlag,
    user: &User,
    provider: &dyn DataProvider,
    seen: &mut HashSet<String>,
) -> EvalResult {
    if !flag.on {
        return off_result(flag);
    }
    if !seen.insert(flag.key.clone()) {
        // Prerequisite cycle; treat like a failed prerequisite.
        return off_result(flag);
    }

    for prereq in &flag.prerequisites {
        let met = match provider.flag(&prereq.key) {
            Some(p) if !p.deleted && p.on => {
                let result = evaluate_internal(&p, user, provider, seen);
                result.variation_index == Some(prereq.variation)
            }
            _ => false,
        };
        if !met {
            seen.remove(&flag.key);
            return off_result(flag);
        }
    }
    seen.remove(&flag.key);

    for target in &flag.targets {
        if target.values.iter().any(|v| v == &user.key) {
            return variation_result(flag, Some(target.variation));
        }
    }

    for rule in &flag.rules {
        if rule
            .clauses
            .iter()
            .all(|c| clause_matches(c, user, provider))
        {
            let index = resolve_variation_or_rollout(&rule.variation_or_rollout, flag, user);
            return variation_result(flag, index);
        }
    }

    let index = resolve_variation_or_rollout(&flag.fallthrough, flag, user);
    variation_result(flag, index)
}

// ---------------------------------------------------------------------------
// Variation selection
// ---------------------------------------------------------------------------

fn off_result(flag: &FeatureFlag) -> EvalResult {
    variation_result(flag, flag.off_variation)
}

fn variation_result(flag: &FeatureFlag, index: Option<usize>) -> EvalResult {
    match index {
        Some(i) => match flag.variations.get(i) {
            Some(value) => EvalResult {
                value: Some(value.clone()),
                variation_index: Some(i),
            },
            None => EvalResult::empty(),
        },
        None => EvalResult::empty(),
    }
}

/// A fixed variation wins over a rollout.  A rollout whose weights don't
/// cover the user's bucket selects nothing (the caller falls back to off).
fn resolve_variation_or_rollout(
    vr: &VariationOrRollout,
    flag: &FeatureFlag,
    user: &User,
) -> Option<usize> {
    if let Some(v) = vr.variation {
        return Some(v);
    }
    let rollout = vr.rollout.as_ref()?;
    let bucket = bucket_user(user, &flag.key, &flag.salt, rollout.bucket_by.as_deref());
    let mut cumulative = 0.0;
    for wv in &rollout.variations {
        cumulative += f64::from(wv.weight) / 100_000.0;
        if bucket < cumulative {
            return Some(wv.variation);
        }
    }
    flag.off_variation
}

// ---------------------------------------------------------------------------
// Clause matching
// ---------------------------------------------------------------------------

fn clause_matches(clause: &Clause, user: &User, provider: &dyn DataProvider) -> bool {
    if clause.op == Operator::SegmentMatch {
        let matched = clause.values.iter().any(|v| match v.as_str() {
            Some(segment_key) => provider
                .segment(segment_key)
                .is_some_and(|s| !s.deleted && segment_contains(&s, user)),
            None => false,
        });
        return matched != clause.negate;
    }

    let Some(attr_value) = user.attribute(&clause.attribute) else {
        return false;
    };

    // Array-valued attributes match if any element matches any clause value.
    let matched = match &attr_value {
        Value::Array(elements) => elements
            .iter()
            .any(|e| clause.values.iter().any(|v| apply_op(clause.op, e, v))),
        single => clause.values.iter().any(|v| apply_op(clause.op, single, v)),
    };
    matched != clause.negate
}

fn apply_op(op: Operator, attr: &Value, clause_value: &Value) -> bool {
    match op {
        Operator::In => attr == clause_value,
        Operator::StartsWith => str_op(attr, clause_value, |a, c| a.starts_with(c)),
        Operator::EndsWith => str_op(attr, clause_value, |a, c| a.ends_with(c)),
        Operator::Contains => str_op(attr, clause_value, |a, c| a.contains(c)),
        Operator::Matches => str_op(attr, clause_value, |a, c| {
            regex::Regex::new(c).map(|re| re.is_match(a)).unwrap_or(false)
        }),
        Operator::LessThan => num_op(attr, clause_value, |a, c| a < c),
        Operator::LessThanOrEqual => num_op(attr, clause_value, |a, c| a <= c),
        Operator::GreaterThan => num_op(attr, clause_value, |a, c| a > c),
        Operator::GreaterThanOrEqual => num_op(attr, clause_value, |a, c| a >= c),
        Operator::Before => date_op(attr, clause_value, |a, c| a < c),
        Operator::After => date_op(attr, clause_value, |a, c| a > c),
        Operator::SegmentMatch | Operator::Unknown => false,
    }
}

fn str_op(attr: &Value, clause_value: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (attr.as_str(), clause_value.as_str()) {
        (Some(a), Some(c)) => f(a, c),
        _ => false,
    }
}

fn num_op(attr: &Value, clause_value: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (attr.as_f64(), clause_value.as_f64()) {
        (Some(a), Some(c)) => f(a, c),
        _ => false,
    }
}

/// Dates are either RFC 3339 strings or unix-millisecond numbers.
fn date_op(attr: &Value, clause_value: &Value, f: impl Fn(i64, i64) -> bool) -> bool {
    match (date_millis(attr), date_millis(clause_value)) {
        (Some(a), Some(c)) => f(a, c),
        _ => false,
    }
}

fn date_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Segment membership
// ---------------------------------------------------------------------------

/// Explicit includes win, then explicit excludes, then rules.  Segment
/// rules may carry a weight that admits only a bucketed fraction of the
/// matching users.
pub fn segment_contains(segment: &Segment, user: &User) -> bool {
    if segment.included.iter().any(|k| k == &user.key) {
        return true;
    }
    if segment.excluded.iter().any(|k| k == &user.key) {
        return false;
    }
    for rule in &segment.rules {
        // Segment rules cannot reference other segments, so clause matching
        // here uses a provider that resolves nothing.
        let all_match = rule
            .clauses
            .iter()
            .all(|c| clause_matches(c, user, &NoData));
        if !all_match {
            continue;
        }
        match rule.weight {
            None => return true,
            Some(weight) => {
                let bucket =
                    bucket_user(user, &segment.key, &segment.salt, rule.bucket_by.as_deref());
                if bucket < f64::from(weight) / 100_000.0 {
                    return true;
                }
            }
        }
    }
    false
}

struct NoData;

impl DataProvider for NoData {
    fn flag(&self, _key: &str) -> Option<FeatureFlag> {
        None
    }
    fn segment(&self, _key: &str) -> Option<Segment> {
        None
    }
}
