use std::collections::HashMap;

use crate::model::RowId;

/// Ordered list of every row id known for the current table.
///
/// Grows by appending; never shrinks outside a table reset. `generation`
/// counts committed transitions.
#[derive(Debug, Clone, Default)]
pub struct RowSequence {
    ids: Vec<RowId>,
    index: HashMap<RowId, usize>,
    generation: u64,
}

impl RowSequence {
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = RowId>,
    {
        let mut sequence = Self::default();
        sequence.append_unique(ids);
        sequence
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[RowId] {
        &self.ids
    }

    pub fn get(&self, index: usize) -> Option<&RowId> {
        self.ids.get(index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ids in the inclusive index range, clamped to the sequence.
    pub fn slice(&self, start: usize, end: usize) -> &[RowId] {
        if start >= self.ids.len() || start > end {
            return &[];
        }
        let end = end.min(self.ids.len() - 1);
        &self.ids[start..=end]
    }

    /// Append ids not already present, returning the ones actually added.
    /// Bumps the generation once when anything was added.
    pub fn append_unique<I>(&mut self, ids: I) -> Vec<RowId>
    where
        I: IntoIterator<Item = RowId>,
    {
        let mut added = Vec::new();
        for id in ids {
            if self.index.contains_key(&id) {
                continue;
            }
            self.index.insert(id.clone(), self.ids.len());
            self.ids.push(id.clone());
            added.push(id);
        }
        if !added.is_empty() {
            self.generation += 1;
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<RowId> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn append_deduplicates_within_and_across_batches() {
        let mut seq = RowSequence::from_ids(ids(&["r1", "r2"]));
        let generation = seq.generation();
        let added = seq.append_unique(ids(&["r2", "r3", "r3", "r4"]));
        assert_eq!(added, ids(&["r3", "r4"]));
        assert_eq!(seq.ids(), ids(&["r1", "r2", "r3", "r4"]).as_slice());
        assert_eq!(seq.generation(), generation + 1);
        assert_eq!(seq.position("r4"), Some(3));
    }

    #[test]
    fn append_without_new_ids_keeps_generation() {
        let mut seq = RowSequence::from_ids(ids(&["r1"]));
        let generation = seq.generation();
        assert!(seq.append_unique(ids(&["r1"])).is_empty());
        assert_eq!(seq.generation(), generation);
    }

    #[test]
    fn slice_is_inclusive_and_clamped() {
        let seq = RowSequence::from_ids(ids(&["a", "b", "c"]));
        assert_eq!(seq.slice(0, 1), ids(&["a", "b"]).as_slice());
        assert_eq!(seq.slice(1, 10), ids(&["b", "c"]).as_slice());
        assert!(seq.slice(3, 4).is_empty());
        assert!(seq.slice(2, 1).is_empty());
    }
}
