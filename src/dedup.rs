//! Message deduplication ledger.
//!
//! Conversation messages can reach the client over three concurrent paths:
//! the transport data channel (push), the polling fallback, and the chat
//! response stream. The ledger is the single owned set of already-surfaced
//! message ids; each path has its own admission policy so a message is
//! surfaced exactly once while still letting a later complete version
//! overwrite an earlier partial one.

use std::collections::HashSet;

/// Set of message ids already surfaced to subscribers for the current
/// session. Cleared whenever a new session starts.
#[derive(Debug, Default)]
pub struct DedupLedger {
    seen: HashSet<String>,
}

impl DedupLedger {
    pub fn new() -> Self {
        DedupLedger::default()
    }

    /// Admission policy for the data-channel push path.
    ///
    /// An incomplete (still-streaming) message with an already-seen id is
    /// suppressed so partial duplicates are never re-shown. A complete
    /// message is always admitted and its id (re)marked, so a final version
    /// can still overwrite an earlier partial one.
    pub fn admit_push(&mut self, id: &str, is_complete: bool) -> bool {
        if !is_complete && self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        true
    }

    /// Admission policy for the polling fallback: admit only ids never seen
    /// on any path, then mark them.
    pub fn admit_poll(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    /// Admission policy for known-complete messages (chat stream completion
    /// and locally synthesized user messages): always admit and mark.
    pub fn admit_complete(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string());
        true
    }

    /// Whether an id has already been surfaced.
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Forget everything. Called at the start of every new session.
    pub fn clear(&mut self) {
        self.seen.clear();
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
    fn test_push_suppresses_partial_duplicates() {
        let mut ledger = DedupLedger::new();
        assert!(ledger.admit_push("m1", false), "first partial is surfaced");
        assert!(!ledger.admit_push("m1", false), "repeat partial suppressed");
        assert!(
            ledger.admit_push("m1", true),
            "complete version overwrites a seen partial"
        );
        assert!(
            !ledger.admit_push("m1", false),
            "no partial re-emission after a complete version"
        );
    }

    #[test]
    fn test_push_complete_always_admitted() {
        let mut ledger = DedupLedger::new();
        assert!(ledger.admit_push("m1", true));
        assert!(ledger.admit_push("m1", true), "corrections pass through");
    }

    #[test]
    fn test_poll_is_exactly_once_against_push() {
        let mut ledger = DedupLedger::new();
        // Push wins the race: the poll duplicate must be suppressed.
        assert!(ledger.admit_push("m1", true));
        assert!(!ledger.admit_poll("m1"));

        // Poll wins the race for a different id.
        assert!(ledger.admit_poll("m2"));
        assert!(!ledger.admit_poll("m2"));
    }

    #[test]
    fn test_complete_marks_for_later_polls() {
        let mut ledger = DedupLedger::new();
        assert!(ledger.admit_complete("user-1700000000000"));
        assert!(!ledger.admit_poll("user-1700000000000"));
    }

    #[test]
    fn test_clear_resets_session_scope() {
        let mut ledger = DedupLedger::new();
        ledger.admit_push("m1", true);
        ledger.admit_poll("m2");
        assert_eq!(ledger.len(), 2);

        ledger.clear();
        assert!(ledger.is_empty());
        assert!(ledger.admit_poll("m1"), "ids from a prior session pass again");
    }
}
