// User context presented by client-side SDKs for evaluation and bucketing.
//
// Built-in attributes are looked up before `custom`; an attribute absent
// from both resolves to nothing (clauses then don't match).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A user as sent by mobile/JS SDKs (base64 path segment or REPORT body).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<bool>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
}

impl User {
    pub fn with_key(key: impl Into<String>) -> Self {
        User {
            key: key.into(),
            ..User::default()
        }
    }

    /// Resolve an attribute by name: built-ins first, then `custom`.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        let builtin = match name {
            "key" => Some(Value::String(self.key.clone())),
            "secondary" => self.secondary.clone().map(Value::String),
            "ip" => self.ip.clone().map(Value::String),
            "country" => self.country.clone().map(Value::String),
            "email" => self.email.clone().map(Value::String),
            "firstName" => self.first_name.clone().map(Value::String),
            "lastName" => self.last_name.clone().map(Value::String),
            "avatar" => self.avatar.clone().map(Value::String),
            "name" => self.name.clone().map(Value::String),
            "anonymous" => self.anonymous.map(Value::Bool),
            _ => None,
        };
        builtin.or_else(|| self.custom.get(name).cloned())
    }
}
