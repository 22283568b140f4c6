//! Short random identifiers for naming shared memory segments

/// Length of a generated identifier in hex characters
pub const ID_LEN: usize = 16;

/// Generate a fresh 16-character lowercase hex identifier.
///
/// Carries 64 bits of randomness. Collisions are not detected; callers
/// accept the negligible probability and use the identifier only for
/// grouping segment names.
pub fn new_id() -> String {
    format!("{:016x}", fastrand::u64(..))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_ids_differ() {
        // 64 bits of entropy: a repeat here means the generator is broken
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }
}
