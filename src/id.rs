use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

/// Source of stanza ids for reply correlation.
///
/// Ids must be unique among requests that are outstanding at the same time.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Result<String>;
}

/// `prefix_001`, `prefix_002`, ... for the lifetime of the generator.
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new("id")
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> Result<String> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(format!("{}_{:03}", self.prefix, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIds::default();
        assert_eq!(ids.next_id().unwrap(), "id_001");
        assert_eq!(ids.next_id().unwrap(), "id_002");
    }

    #[test]
    fn test_sequential_ids_are_unique_across_threads() {
        let ids = std::sync::Arc::new(SequentialIds::new("t"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..100).map(|_| ids.next_id().unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
