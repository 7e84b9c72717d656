//! Inbound duplicate suppression.
//!
//! The relay delivers at-least-once, and our own emits can echo back, so the
//! session remembers every message ID it has sent or accepted. The set is
//! cleared wholesale on a fixed interval: a duplicate arriving after a clear
//! is processed again, but the set never grows without bound.

use std::collections::HashSet;

use crate::protocol::MessageId;

/// Recently seen message IDs.
#[derive(Default)]
pub struct DedupSet {
    seen: HashSet<MessageId>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ID. Returns `false` if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.seen.insert(id)
    }

    /// Forget everything. Returns how many IDs were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.seen.len();
        self.seen.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_insert_wins() {
        let mut set = DedupSet::new();
        assert!(set.is_empty());

        assert!(set.insert(MessageId::from("a")));
        assert!(!set.insert(MessageId::from("a")));
        assert!(set.insert(MessageId::from("b")));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_clear_forgets_ids() {
        let mut set = DedupSet::new();
        set.insert(MessageId::from("a"));
        set.insert(MessageId::from("b"));

        assert_eq!(set.clear(), 2);
        assert!(set.is_empty());

        // Same ID is accepted again after truncation
        assert!(set.insert(MessageId::from("a")));
    }
}
