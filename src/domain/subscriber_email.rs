use serde::Deserialize;
use std::fmt;
use validator::validate_email;

/// A syntactically valid address, trimmed and lower-cased so it can be used as
/// a lookup key for subscribers and suppressions.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String")]
pub struct SubscriberEmail(String);

impl SubscriberEmail {
    pub fn parse(s: String) -> Result<SubscriberEmail, String> {
        let normalized = normalize(&s);
        if validate_email(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(format!("`{s}` email has invalid format"))
        }
    }
}

/// Canonical form used for every email comparison in the engine.
pub fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

impl AsRef<str> for SubscriberEmail {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for SubscriberEmail {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}
