//! Credential types.
//!
//! Each environment carries up to three credentials, one per SDK family.
//! The credential value doubles as the lookup key for environment routing,
//! so values must be unique across environments of the same type.

use std::fmt;

/// One credential, tagged with its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Credential {
    /// Server-side SDK key, sent in `Authorization`.
    SdkKey(String),
    /// Mobile SDK key, sent in `Authorization`.
    MobileKey(String),
    /// Browser environment ID, bound in the URL path.
    EnvironmentId(String),
}

impl Credential {
    pub fn value(&self) -> &str {
        match self {
            Credential::SdkKey(v) | Credential::MobileKey(v) | Credential::EnvironmentId(v) => v,
        }
    }

    pub fn is_sdk_key(&self) -> bool {
        matches!(self, Credential::SdkKey(_))
    }

    /// Redacted form for logs and the status resource: all but the last
    /// four characters are masked.
    pub fn masked(&self) -> String {
        let value = self.value();
        if value.len() <= 4 {
            return "****".to_owned();
        }
        format!("****{}", &value[value.len() - 4..])
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Credential::SdkKey(_) => "sdk-key",
            Credential::MobileKey(_) => "mobile-key",
            Credential::EnvironmentId(_) => "environment-id",
        };
        write!(f, "{} {}", label, self.masked())
    }
}

/// Strip the legacy `api_key ` prefix some SDKs still send in
/// `Authorization`.  Bare credentials pass through unchanged.
pub fn strip_auth_scheme(header_value: &str) -> &str {
    header_value
        .strip_prefix("api_key ")
        .unwrap_or(header_value)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_keeps_only_the_tail() {
        let credential = Credential::SdkKey("sdk-12345678".to_owned());
        assert_eq!(credential.masked(), "****5678");
        assert_eq!(Credential::SdkKey("abc".to_owned()).masked(), "****");
    }

    #[test]
    fn strip_auth_scheme_accepts_both_legacy_and_bare_forms() {
        assert_eq!(strip_auth_scheme("sdk-key-1"), "sdk-key-1");
        assert_eq!(strip_auth_scheme("api_key sdk-key-1"), "sdk-key-1");
        assert_eq!(strip_auth_scheme("api_key  padded "), "padded");
    }

    #[test]
    fn display_never_leaks_the_full_value() {
        let credential = Credential::MobileKey("mob-secret-key".to_owned());
        let rendered = credential.to_string();
        assert!(!rendered.contains("mob-secret"));
        assert!(rendered.contains("-key") || rendered.contains("****"));
    }
}
