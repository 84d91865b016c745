//! Effective key derivation.

/// Separator placed between a namespace prefix and the caller's key.
pub const PREFIX_SEPARATOR: char = ':';

/// The identifier a counter row is stored under.
///
/// A caller-supplied prefix namespaces the key so that the same base key
/// can be limited independently by different policies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EffectiveKey(String);

impl EffectiveKey {
    /// Build the effective key from a base key and an optional prefix.
    pub fn new(key: &str, prefix: Option<&str>) -> Self {
        match prefix {
            Some(prefix) => Self(format!("{}{}{}", prefix, PREFIX_SEPARATOR, key)),
            None => Self(key.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EffectiveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
