use std::fmt;

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 16;

/// Opaque peer identity: a random `[A-Za-z0-9]{8,}` string (here, fixed at 16
/// characters for a comfortable collision margin). Unique per process; a
/// vanished peer's id is never immediately reused (see [`crate::registry::PeerRegistry`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Generates a fresh random id. Does not check for collisions; the
    /// registry is responsible for rejecting (and retrying) on collision.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..ID_LEN).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for PeerId {
    type Error = InvalidPeerId;

    /// Parses a peer id as received over the wire, validating the
    /// `[A-Za-z0-9]{8,}` shape from SPEC_FULL.md §6.
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.len() >= 8 && value.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(value.to_owned()))
        } else {
            Err(InvalidPeerId)
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("peer id does not match [A-Za-z0-9]{{8,}}")]
pub struct InvalidPeerId;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_match_wire_shape() {
        for _ in 0..64 {
            let id = PeerId::generate();
            assert!(id.as_str().len() >= 8);
            assert!(id.as_str().bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..10_000).map(|_| PeerId::generate()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn rejects_short_id() {
        assert!(PeerId::try_from("short").is_err());
    }

    #[test]
    fn rejects_non_alphanumeric() {
        assert!(PeerId::try_from("abc-123-def").is_err());
    }

    #[test]
    fn accepts_valid_id() {
        assert!(PeerId::try_from("Zzzzzzzz").is_ok());
    }
}
