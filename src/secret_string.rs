use serde::Deserialize;
use std::fmt;

/// Registry password that prints as "<REDACTED, length N>" through Debug and Display, so credential
/// sets can be logged as a whole.
#[derive(Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Access the raw secret if explicitly needed
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    fn fmt_redacted_secret(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        SecretString(s.to_owned())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}
