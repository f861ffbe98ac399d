//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, shipped inside message.rs append payloads
//! what: LogEntry struct, Log wrapper, log-matching modes, follower append, commit marking

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// The term of the leader that appended this entry
    pub term: u64,
    /// Position in the log (0-indexed, contiguous)
    pub index: u64,
    /// Opaque command payload
    pub command: String,
    /// Flips to true once a majority holds the entry, never back
    pub committed: bool,
}

impl LogEntry {
    /// Create a new uncommitted log entry
    pub fn new(term: u64, index: u64, command: impl Into<String>) -> Self {
        Self {
            term,
            index,
            command: command.into(),
            committed: false,
        }
    }
}

/// How a follower treats `prev_log_index`/`prev_log_term` on append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMatching {
    /// Reject appends whose previous entry does not match, truncate conflicts
    #[default]
    Strict,
    /// Append without the consistency check; keep whatever is already there
    Lenient,
}

/// The last position of a log, used by the vote rule.
///
/// An empty log has `index == None` and `term == 0`. `None` orders below
/// every `Some`, which is exactly the "-1" of a 0-indexed empty log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPosition {
    pub index: Option<u64>,
    pub term: u64,
}

impl LogPosition {
    pub fn new(index: Option<u64>, term: u64) -> Self {
        Self { index, term }
    }

    /// Raft's "at least as up to date": higher last term wins, equal terms
    /// compare by last index.
    pub fn is_at_least_as_up_to_date_as(&self, other: &LogPosition) -> bool {
        match self.term.cmp(&other.term) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.index >= other.index,
        }
    }
}

/// Result of offering entries to a follower's log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Entries are in place; the follower's log matches the leader through `match_index`
    Accepted { match_index: Option<u64> },
    /// Nothing changed; `last_index` hints where the leader should resume
    Rejected { last_index: Option<u64> },
}

/// Ordered, contiguous sequence of entries held by one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.entries.last().map(|e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn last_position(&self) -> LogPosition {
        LogPosition::new(self.last_index(), self.last_term())
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// True if this log has an entry at `index` written in `term`
    pub fn holds(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Leader-side append: the new entry always lands at `len()`
    pub fn append_command(&mut self, term: u64, command: impl Into<String>) -> &LogEntry {
        let index = self.entries.len() as u64;
        self.entries.push(LogEntry::new(term, index, command));
        &self.entries[self.entries.len() - 1]
    }

    /// Up to `max` entries starting at `start`
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let start = match usize::try_from(start) {
            Ok(start) if start < self.entries.len() => start,
            _ => return Vec::new(),
        };
        self.entries[start..].iter().take(max).cloned().collect()
    }

    /// True if the entry before an append is present with the expected term
    pub fn matches(&self, prev_index: Option<u64>, prev_term: u64) -> bool {
        match prev_index {
            None => true,
            Some(index) => self.holds(index, prev_term),
        }
    }

    /// Follower-side append.
    ///
    /// Entries at or below `commit_index` are never truncated. Neither mode
    /// leaves a gap: an entry whose index is past the end of the log is
    /// rejected.
    pub fn offer(
        &mut self,
        prev_index: Option<u64>,
        prev_term: u64,
        entries: &[LogEntry],
        mode: LogMatching,
        commit_index: Option<u64>,
    ) -> AppendOutcome {
        if mode == LogMatching::Strict && !self.matches(prev_index, prev_term) {
            return self.rejected();
        }

        for entry in entries {
            let len = self.entries.len() as u64;
            if entry.index > len {
                return self.rejected();
            }
            if entry.index == len {
                self.push_copy(entry);
                continue;
            }
            // index already occupied
            if mode == LogMatching::Lenient || self.holds(entry.index, entry.term) {
                continue;
            }
            if commit_index.is_some_and(|c| entry.index <= c) {
                return self.rejected();
            }
            self.entries.truncate(entry.index as usize);
            self.push_copy(entry);
        }

        let match_index = match entries.last() {
            Some(last) => Some(last.index),
            None if mode == LogMatching::Strict => prev_index,
            None => prev_index.min(self.last_index()),
        };
        AppendOutcome::Accepted { match_index }
    }

    /// Mark entries `0..=through` committed, clamped to the log's end.
    /// Returns the highest index now committed.
    pub fn commit_through(&mut self, through: u64) -> Option<u64> {
        let last = self.last_index()?;
        let through = through.min(last);
        for entry in self.entries.iter_mut().take(through as usize + 1) {
            entry.committed = true;
        }
        Some(through)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn push_copy(&mut self, entry: &LogEntry) {
        self.entries
            .push(LogEntry::new(entry.term, entry.index, entry.command.clone()));
    }

    fn rejected(&self) -> AppendOutcome {
        AppendOutcome::Rejected {
            last_index: self.last_index(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[u64]) -> Log {
        let mut log = Log::new();
        for (i, term) in terms.iter().enumerate() {
            log.append_command(*term, format!("cmd-{i}"));
        }
        log
    }

    #[test]
    fn empty_log_position_is_below_everything() {
        let log = Log::new();
        assert_eq!(log.last_index(), None);
        assert_eq!(log.last_term(), 0);
        assert!(LogPosition::new(Some(0), 0).is_at_least_as_up_to_date_as(&log.last_position()));
    }

    #[test]
    fn leader_append_is_contiguous() {
        let log = log_with_terms(&[1, 1, 2]);
        let indexes: Vec<u64> = log.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(log.iter().all(|e| !e.committed));
    }

    #[test]
    fn strict_rejects_missing_prev() {
        let mut log = log_with_terms(&[1]);
        let entry = LogEntry::new(1, 2, "x");
        let outcome = log.offer(Some(1), 1, &[entry], LogMatching::Strict, None);
        assert_eq!(outcome, AppendOutcome::Rejected { last_index: Some(0) });
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn strict_truncates_uncommitted_conflict() {
        let mut log = log_with_terms(&[1, 1, 1]);
        let entry = LogEntry::new(2, 1, "new");
        let outcome = log.offer(Some(0), 1, &[entry], LogMatching::Strict, Some(0));
        assert_eq!(outcome, AppendOutcome::Accepted { match_index: Some(1) });
        assert_eq!(log.len(), 2);
        assert_eq!(log.term_at(1), Some(2));
    }

    #[test]
    fn strict_never_truncates_committed_entries() {
        let mut log = log_with_terms(&[1, 1]);
        log.commit_through(1);
        let entry = LogEntry::new(2, 1, "new");
        let outcome = log.offer(Some(0), 1, &[entry], LogMatching::Strict, Some(1));
        assert!(matches!(outcome, AppendOutcome::Rejected { .. }));
        assert_eq!(log.term_at(1), Some(1));
    }

    #[test]
    fn lenient_skips_prev_check_but_not_gaps() {
        let mut log = Log::new();
        let outcome = log.offer(Some(4), 9, &[LogEntry::new(1, 0, "a")], LogMatching::Lenient, None);
        assert_eq!(outcome, AppendOutcome::Accepted { match_index: Some(0) });

        let outcome = log.offer(Some(4), 9, &[LogEntry::new(1, 3, "gap")], LogMatching::Lenient, None);
        assert!(matches!(outcome, AppendOutcome::Rejected { .. }));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn heartbeat_match_is_prev_index() {
        let mut log = log_with_terms(&[1, 1]);
        let outcome = log.offer(Some(1), 1, &[], LogMatching::Strict, None);
        assert_eq!(outcome, AppendOutcome::Accepted { match_index: Some(1) });
    }

    #[test]
    fn copies_arrive_uncommitted() {
        let mut leader = log_with_terms(&[1]);
        leader.commit_through(0);
        let mut follower = Log::new();
        let entries = leader.entries_from(0, 10);
        follower.offer(None, 0, &entries, LogMatching::Strict, None);
        assert!(!follower.get(0).map(|e| e.committed).unwrap_or(true));
    }

    #[test]
    fn commit_through_clamps_to_end() {
        let mut log = log_with_terms(&[1, 1]);
        assert_eq!(log.commit_through(7), Some(1));
        assert!(log.iter().all(|e| e.committed));
        assert_eq!(Log::new().commit_through(0), None);
    }
}
