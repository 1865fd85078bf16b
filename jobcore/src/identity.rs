//! Job token generation.

use crate::types::JobId;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Number of hex characters of randomness in a job id (64 bits).
const RANDOM_HEX_LEN: usize = 16;

/// Generate a new job id: `<unix-seconds>-<16 random hex chars>`.
///
/// The time prefix keeps directory listings roughly chronological; uniqueness comes from the
/// v4 UUID. The store still refuses to publish over an existing id, so a collision surfaces as
/// a retry rather than two jobs sharing a directory.
pub fn generate() -> JobId {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let random = Uuid::new_v4().simple().to_string();
    JobId::from_parts(secs, &random[..RANDOM_HEX_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_parse_back() {
        let id = generate();
        assert_eq!(JobId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn concurrent_generation_is_unique() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..500).map(|_| generate()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate job id");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
