//! Key layout for stored objects.
//!
//! Keys are plain concatenation: `prefix + "/" + name`. No normalization is
//! applied, callers are expected to pass validated names.

/// Builds backend keys for one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyScheme {
    prefix: String,
}

impl KeyScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The key of a single object.
    pub fn key_for(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// The key prefix covering every object of the resource.
    pub fn list_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// Recovers the object name from a key produced by [`KeyScheme::key_for`].
    pub fn name_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?.strip_prefix('/')
    }
}
