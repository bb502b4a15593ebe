use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = chat_common::id::prefixed_ulid("srv");
/// assert!(id.starts_with("srv_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types that represent a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const SERVER: &str = "srv";
    pub const CONNECTION: &str = "conn";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ulid_format() {
        let id = prefixed_ulid("conn");
        assert!(id.starts_with("conn_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 5 + 26);
    }

    #[test]
    fn test_uniqueness() {
        let a = prefixed_ulid(prefix::SERVER);
        let b = prefixed_ulid(prefix::SERVER);
        assert_ne!(a, b);
    }

    #[test]
    fn test_prefixed_id_trait_uses_prefix() {
        struct ServerId;
        impl PrefixedId for ServerId {
            const PREFIX: &'static str = prefix::SERVER;
        }
        assert!(ServerId::generate().starts_with("srv_"));
    }
}
