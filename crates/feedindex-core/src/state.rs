//! Per-run buffer for export-immediately mode.

use std::collections::{HashSet, VecDeque};

use crate::types::FeedRow;

/// Accumulates serialized rows until a batch is full and remembers the hash
/// of every row it has accepted during the run.
///
/// Rows leave the buffer only through [`take_batch`](Self::take_batch), which
/// hands ownership of up to one batch to the caller. Reading the processed
/// hashes never mutates the buffer.
#[derive(Debug)]
pub struct IndexStateProvider {
    batch_size: usize,
    queue: VecDeque<FeedRow>,
    processed_hashes: HashSet<String>,
}

impl IndexStateProvider {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            queue: VecDeque::new(),
            processed_hashes: HashSet::new(),
        }
    }

    /// Queue rows and record their hashes as processed.
    pub fn push(&mut self, rows: impl IntoIterator<Item = FeedRow>) {
        for row in rows {
            self.processed_hashes.insert(row.feed_hash.clone());
            self.queue.push_back(row);
        }
    }

    /// `true` once at least one full batch is queued.
    pub fn is_batch_full(&self) -> bool {
        self.queue.len() >= self.batch_size
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Take ownership of the oldest queued rows, at most one batch.
    pub fn take_batch(&mut self) -> Option<Vec<FeedRow>> {
        if self.queue.is_empty() {
            return None;
        }
        let n = self.batch_size.min(self.queue.len());
        Some(self.queue.drain(..n).collect())
    }

    pub fn is_processed(&self, hash: &str) -> bool {
        self.processed_hashes.contains(hash)
    }

    pub fn processed_hashes(&self) -> &HashSet<String> {
        &self.processed_hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn row(id: i64) -> FeedRow {
        FeedRow {
            source_id: id,
            identity: BTreeMap::new(),
            feed_data: "{}".into(),
            feed_hash: format!("hash-{id}"),
            is_deleted: false,
            status: 0,
            errors: None,
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn take_batch_hands_out_each_row_once() {
        let mut state = IndexStateProvider::new(2);
        state.push((1..=3).map(row));
        assert!(state.is_batch_full());

        let first = state.take_batch().unwrap();
        assert_eq!(first.iter().map(|r| r.source_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!state.is_batch_full());

        let second = state.take_batch().unwrap();
        assert_eq!(second.len(), 1);
        assert!(state.take_batch().is_none());
    }

    #[test]
    fn processed_hashes_survive_take() {
        let mut state = IndexStateProvider::new(10);
        state.push([row(7)]);
        state.take_batch();
        assert!(state.is_processed("hash-7"));
        assert!(state.is_processed("hash-7"));
        assert_eq!(state.processed_hashes().len(), 1);
        assert_eq!(state.pending(), 0);
    }
}
