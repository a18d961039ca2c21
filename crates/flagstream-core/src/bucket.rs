// Deterministic rollout bucketing.
//
// The bucket value for a user is SHA-1("{key}.{salt}.{idValue}") where
// idValue is the bucketing attribute (default "key"), with ".{secondary}"
// appended when the user has a secondary key.  The first 15 hex characters
// of the digest (60 bits) divided by 0xFFFFFFFFFFFFFFF give a value in
// [0, 1).  This must stay bit-exact with the upstream SDKs.

use crate::user::User;
use serde_json::Value;
use sha1::{Digest, Sha1};

/// Scale factor: 2^60 - 1, i.e. fifteen f's.
const LONG_SCALE: f64 = 0xFFFF_FFFF_FFFF_FFF_u64 as f64;

/// Compute the rollout bucket for `user` in [0, 1).
///
/// Returns 0.0 when the bucketing attribute is absent or not a string or
/// integer, so such users always land in the first bucket.
pub fn bucket_user(user: &User, key: &str, salt: &str, bucket_by: Option<&str>) -> f64 {
    let attr = bucket_by.unwrap_or("key");
    let Some(id_value) = bucketable_value(user.attribute(attr).as_ref()) else {
        return 0.0;
    };

    let mut input = format!("{}.{}.{}", key, salt, id_value);
    if let Some(secondary) = &user.secondary {
        input.push('.');
        input.push_str(secondary);
    }

    let digest = Sha1::digest(input.as_bytes());
    let hex = hex::encode(digest);
    // 15 hex chars always parse as u64; the digest is 40 chars long.
    let n = u64::from_str_radix(&hex[..15], 16).unwrap_or(0);
    n as f64 / LONG_SCALE
}

/// Strings bucket as themselves; integers bucket as their decimal string.
/// Anything else is not bucketable.
fn bucketable_value(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) if n.is_i64() => Some(n.to_string()),
        _ => None,
    }
}
