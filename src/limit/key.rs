//! Counter key construction.

/// Separator between the kind and the identifier.
pub const KIND_SEPARATOR: char = ':';

/// A key that uniquely identifies a period counter.
///
/// Rendered as `{prefix}{kind}:{identifier}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// Namespace shared by every counter of one limiter
    pub prefix: String,
    /// The class of event being counted, e.g. `sms` or `login`
    pub kind: String,
    /// Who or what the event is counted against
    pub identifier: String,
}

impl LimitKey {
    /// Create a new limit key.
    pub fn new(prefix: &str, kind: &str, identifier: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            kind: kind.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// The store key for this counter.
    pub fn to_store_key(&self) -> String {
        format!(
            "{}{}{}{}",
            self.prefix, self.kind, KIND_SEPARATOR, self.identifier
        )
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_key_rendering() {
        let key = LimitKey::new("periodlimit:", "sms", "+15550100");
        assert_eq!(key.to_store_key(), "periodlimit:sms:+15550100");
        assert_eq!(key.to_string(), key.to_store_key());
    }

    #[test]
    fn test_limit_key_without_prefix() {
        let key = LimitKey::new("", "login", "alice");
        assert_eq!(key.to_store_key(), "login:alice");
    }

    #[test]
    fn test_limit_key_equality() {
        let key1 = LimitKey::new("p:", "kind", "id");
        let key2 = LimitKey::new("p:", "kind", "id");
        let key3 = LimitKey::new("p:", "kind", "other");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }
}
