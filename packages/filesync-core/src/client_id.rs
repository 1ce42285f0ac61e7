//! Client identity.
//!
//! By default the client id is derived from the username, so every device a
//! user logs into presents the same id and version-vector entries line up
//! across installations. Installations that want per-device granularity set
//! `client.device_unique=true` in the config, which switches to a random id
//! persisted alongside the config file.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Namespace prefix hashed together with the username.
const CLIENT_ID_PREFIX: &str = "filesync_user_";

/// Derive the deterministic client id for a username.
///
/// `SHA-256("filesync_user_" + lower(trim(username)))`, formatted like a
/// UUID from the first 16 digest bytes. Case and surrounding whitespace in
/// the username do not change the result.
pub fn derive_client_id(username: &str) -> String {
    let normalized = username.trim().to_lowercase();
    let digest = Sha256::digest(format!("{}{}", CLIENT_ID_PREFIX, normalized).as_bytes());
    format_uuid_like(&digest)
}

/// Random per-installation client id, used when no user is logged in or
/// when device-unique ids are requested.
pub fn random_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format the first 16 bytes of a digest as `8-4-4-4-12` hex groups.
fn format_uuid_like(digest: &[u8]) -> String {
    let hex = hex::encode(&digest[..16]);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_user_same_id() {
        assert_eq!(derive_client_id("alice"), derive_client_id("alice"));
    }

    #[test]
    fn test_normalization() {
        let canonical = derive_client_id("alice");
        assert_eq!(derive_client_id("  Alice "), canonical);
        assert_eq!(derive_client_id("ALICE"), canonical);
    }

    #[test]
    fn test_different_users_differ() {
        assert_ne!(derive_client_id("alice"), derive_client_id("bob"));
    }

    #[test]
    fn test_uuid_shape() {
        let id = derive_client_id("alice");
        let groups: Vec<&str> = id.split('-').collect();
        assert_eq!(groups.len(), 5);
        assert_eq!(groups[0].len(), 8);
        assert_eq!(groups[1].len(), 4);
        assert_eq!(groups[2].len(), 4);
        assert_eq!(groups[3].len(), 4);
        assert_eq!(groups[4].len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(random_client_id(), random_client_id());
    }
}
