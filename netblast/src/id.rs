use rand::Rng;
use std::collections::HashSet;

/// Opaque worker identifier: a 64-bit-entropy lowercase hex token.
pub type WorkerId = String;

/// Draws a fresh worker id that is not in `seen`, and records it there.
/// Ids are never removed from `seen`, so they are unique for the lifetime
/// of the manager.
pub fn fresh_worker_id(seen: &mut HashSet<WorkerId>) -> WorkerId {
    let mut rng = rand::thread_rng();
    loop {
        let id = format!("{:016x}", rng.gen::<u64>());
        if seen.insert(id.clone()) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format() {
        let mut seen = HashSet::new();
        let id = fresh_worker_id(&mut seen);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn unique() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            fresh_worker_id(&mut seen);
        }
        assert_eq!(seen.len(), 10_000);
    }
}
