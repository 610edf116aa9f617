//! Replicant index: inverted `(key, value) -> uids` postings over resource labels,
//! plus selector evaluation on top of it.

#![forbid(unsafe_code)]

use replicant_core::{LabelSet, Uid};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

pub mod matcher;

pub use matcher::{candidate_set, matches};

/// Inverted label index for one population of resources.
///
/// Postings are nested `key -> value -> uids` so lookups never allocate a
/// composite key.
#[derive(Debug, Default)]
pub struct LabelIndex {
    postings: FxHashMap<String, FxHashMap<String, FxHashSet<Uid>>>,
    // Current labels per resource, used to retract old postings on upsert/remove.
    labels: FxHashMap<Uid, LabelSet>,
    pairs: usize,
    empty: FxHashSet<Uid>,
}

impl LabelIndex {
    pub fn new() -> Self { Self::default() }

    /// Number of indexed resources.
    pub fn len(&self) -> usize { self.labels.len() }
    pub fn is_empty(&self) -> bool { self.labels.is_empty() }
    /// Number of live `(key, value, uid)` postings.
    pub fn pairs(&self) -> usize { self.pairs }

    pub fn contains(&self, uid: &Uid) -> bool { self.labels.contains_key(uid) }
    pub fn labels_of(&self, uid: &Uid) -> Option<&LabelSet> { self.labels.get(uid) }

    /// Replace all postings for `uid` with the pairs in `labels`.
    /// Returns the previous label set, if the resource was already indexed.
    pub fn upsert(&mut self, uid: Uid, labels: &LabelSet) -> Option<LabelSet> {
        if self.labels.get(&uid) == Some(labels) {
            return Some(labels.clone());
        }
        let prev = self.retract(&uid);
        for (k, v) in labels.iter() {
            let inserted = self.postings.entry(k.to_string()).or_default().entry(v.to_string()).or_default().insert(uid);
            if inserted { self.pairs += 1; }
        }
        self.labels.insert(uid, labels.clone());
        trace!(pairs = labels.len(), replaced = prev.is_some(), "label index upsert");
        prev
    }

    /// Drop every posting for `uid`. No-op when absent.
    pub fn remove(&mut self, uid: &Uid) -> Option<LabelSet> { self.retract(uid) }

    /// Resources currently carrying exactly `key=value`.
    pub fn candidates_for(&self, key: &str, value: &str) -> &FxHashSet<Uid> {
        self.postings.get(key).and_then(|vals| vals.get(value)).unwrap_or(&self.empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uid, &LabelSet)> + '_ { self.labels.iter() }

    fn retract(&mut self, uid: &Uid) -> Option<LabelSet> {
        let prev = self.labels.remove(uid)?;
        for (k, v) in prev.iter() {
            let Some(vals) = self.postings.get_mut(k) else { continue };
            if let Some(set) = vals.get_mut(v) {
                if set.remove(uid) { self.pairs -= 1; }
                if set.is_empty() { vals.remove(v); }
            }
            if vals.is_empty() { self.postings.remove(k); }
        }
        Some(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u8) -> Uid { let mut u = [0u8; 16]; u[15] = n; u }

    #[test]
    fn upsert_replaces_prior_entries() {
        let mut idx = LabelIndex::new();
        idx.upsert(uid(1), &LabelSet::from_pairs([("app", "web"), ("tier", "front")]));
        idx.upsert(uid(1), &LabelSet::from_pairs([("app", "api")]));
        assert!(idx.candidates_for("app", "web").is_empty());
        assert!(idx.candidates_for("tier", "front").is_empty());
        assert!(idx.candidates_for("app", "api").contains(&uid(1)));
        assert_eq!(idx.pairs(), 1);
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut idx = LabelIndex::new();
        let l = LabelSet::from_pairs([("a", "1"), ("b", "2")]);
        idx.upsert(uid(1), &l);
        idx.upsert(uid(1), &l);
        assert_eq!(idx.pairs(), 2);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.candidates_for("a", "1").len(), 1);
    }

    #[test]
    fn remove_clears_postings_and_tolerates_absent() {
        let mut idx = LabelIndex::new();
        idx.upsert(uid(1), &LabelSet::from_pairs([("a", "1")]));
        idx.upsert(uid(2), &LabelSet::from_pairs([("a", "1")]));
        assert!(idx.remove(&uid(1)).is_some());
        assert!(idx.remove(&uid(1)).is_none());
        assert_eq!(idx.candidates_for("a", "1").iter().copied().collect::<Vec<_>>(), vec![uid(2)]);
        idx.remove(&uid(2));
        assert!(idx.candidates_for("a", "1").is_empty());
        assert_eq!(idx.pairs(), 0);
        assert!(idx.is_empty());
    }
}
