//! Id generation helpers.

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a short prefixed id, e.g. `client_a1b2c3d4`.
///
/// Used for synthetic client ids and run ids where a full UUID is noisier
/// than the context needs.
#[must_use]
pub fn short_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_shape() {
        let id = short_id("client");
        assert!(id.starts_with("client_"));
        assert_eq!(id.len(), "client_".len() + 8);
    }

    #[test]
    fn test_short_ids_are_unique() {
        let a = short_id("run");
        let b = short_id("run");
        assert_ne!(a, b);
    }
}
