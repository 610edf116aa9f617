//! Per-controller match sets, kept consistent with the label index incrementally.

use replicant_core::{LabelSet, Selector, Uid};
use replicant_index::{candidate_set, matches, LabelIndex};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::trace;

#[derive(Debug)]
struct Entry {
    namespace: String,
    selector: Selector,
    members: FxHashSet<Uid>,
}

/// Tracks, for every live controller, the uids of resources matching its selector.
#[derive(Debug, Default)]
pub struct MatchTracker {
    entries: FxHashMap<Uid, Entry>,
    // namespace -> selector key -> controllers whose selector references the key
    by_key: FxHashMap<String, FxHashMap<String, FxHashSet<Uid>>>,
    // resource -> controllers whose set currently holds it
    owners: FxHashMap<Uid, SmallVec<[Uid; 2]>>,
}

impl MatchTracker {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn tracked(&self, controller: &Uid) -> Option<&FxHashSet<Uid>> {
        self.entries.get(controller).map(|e| &e.members)
    }

    pub fn owners_of(&self, resource: &Uid) -> &[Uid] {
        self.owners.get(resource).map(|o| o.as_slice()).unwrap_or(&[])
    }

    /// Register a controller or refresh it after an update. The set is fully
    /// recomputed only when the namespace or selector changed.
    /// Returns whether a recomputation happened.
    pub fn upsert_controller(&mut self, controller: Uid, namespace: &str, selector: &Selector, index: Option<&LabelIndex>) -> bool {
        if let Some(e) = self.entries.get(&controller) {
            if e.namespace == namespace && e.selector == *selector {
                return false;
            }
        }
        self.remove_controller(&controller);

        let members = index.map(|i| candidate_set(selector, i)).unwrap_or_default();
        for r in members.iter() {
            self.owners.entry(*r).or_default().push(controller);
        }
        let keys = self.by_key.entry(namespace.to_string()).or_default();
        for k in selector.keys() {
            keys.entry(k.to_string()).or_default().insert(controller);
        }
        trace!(members = members.len(), selector = %selector, "match set computed");
        self.entries.insert(controller, Entry { namespace: namespace.to_string(), selector: selector.clone(), members });
        true
    }

    /// Discard a controller's set. No-op when unknown.
    pub fn remove_controller(&mut self, controller: &Uid) -> bool {
        let Some(e) = self.entries.remove(controller) else { return false };
        for r in e.members.iter() {
            if let Some(o) = self.owners.get_mut(r) {
                o.retain(|c| c != controller);
                if o.is_empty() { self.owners.remove(r); }
            }
        }
        if let Some(keys) = self.by_key.get_mut(&e.namespace) {
            for k in e.selector.keys() {
                if let Some(set) = keys.get_mut(k) {
                    set.remove(controller);
                    if set.is_empty() { keys.remove(k); }
                }
            }
            if keys.is_empty() { self.by_key.remove(&e.namespace); }
        }
        true
    }

    /// A resource's labels went from `old` to `new`. Membership is re-checked
    /// only for controllers in the same namespace whose selector references a
    /// key that changed. Returns the controllers whose membership flipped.
    pub fn resource_changed(&mut self, resource: Uid, namespace: &str, old: Option<&LabelSet>, new: &LabelSet) -> Vec<Uid> {
        let none = LabelSet::new();
        let changed = old.unwrap_or(&none).changed_keys(new);
        if changed.is_empty() {
            return Vec::new();
        }
        let Some(keys) = self.by_key.get(namespace) else { return Vec::new() };
        let mut affected: FxHashSet<Uid> = FxHashSet::default();
        for k in changed {
            if let Some(set) = keys.get(k) { affected.extend(set.iter().copied()); }
        }

        let mut flipped = Vec::new();
        for c in affected {
            let Some(e) = self.entries.get_mut(&c) else { continue };
            let now = matches(&e.selector, new);
            if now && e.members.insert(resource) {
                self.owners.entry(resource).or_default().push(c);
                flipped.push(c);
            } else if !now && e.members.remove(&resource) {
                if let Some(o) = self.owners.get_mut(&resource) {
                    o.retain(|x| *x != c);
                    if o.is_empty() { self.owners.remove(&resource); }
                }
                flipped.push(c);
            }
        }
        flipped
    }

    /// A resource disappeared: drop it from every set holding it.
    /// Returns the controllers that held it.
    pub fn resource_removed(&mut self, resource: &Uid) -> SmallVec<[Uid; 2]> {
        let Some(owners) = self.owners.remove(resource) else { return SmallVec::new() };
        for c in owners.iter() {
            if let Some(e) = self.entries.get_mut(c) { e.members.remove(resource); }
        }
        owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u8) -> Uid { let mut u = [0u8; 16]; u[15] = n; u }
    fn l(pairs: &[(&str, &str)]) -> LabelSet { pairs.iter().copied().collect() }

    #[test]
    fn relabel_only_touches_controllers_on_changed_keys() {
        let mut idx = LabelIndex::new();
        idx.upsert(uid(1), &l(&[("type", "odd"), ("tier", "a")]));
        let mut t = MatchTracker::new();
        t.upsert_controller(uid(100), "ns", &"type=odd".parse().unwrap(), Some(&idx));
        t.upsert_controller(uid(101), "ns", &"tier=a".parse().unwrap(), Some(&idx));
        assert_eq!(t.owners_of(&uid(1)).len(), 2);

        let old = idx.upsert(uid(1), &l(&[("type", "even"), ("tier", "a")]));
        let flipped = t.resource_changed(uid(1), "ns", old.as_ref(), &l(&[("type", "even"), ("tier", "a")]));
        assert_eq!(flipped, vec![uid(100)]);
        assert!(t.tracked(&uid(100)).unwrap().is_empty());
        assert!(t.tracked(&uid(101)).unwrap().contains(&uid(1)));
        assert_eq!(t.owners_of(&uid(1)), &[uid(101)]);
    }

    #[test]
    fn other_namespace_is_ignored() {
        let mut t = MatchTracker::new();
        t.upsert_controller(uid(100), "a", &"k=v".parse().unwrap(), None);
        let flipped = t.resource_changed(uid(1), "b", None, &l(&[("k", "v")]));
        assert!(flipped.is_empty());
        assert!(t.tracked(&uid(100)).unwrap().is_empty());
    }

    #[test]
    fn removal_and_controller_teardown_clean_reverse_maps() {
        let mut idx = LabelIndex::new();
        idx.upsert(uid(1), &l(&[("k", "v")]));
        idx.upsert(uid(2), &l(&[("k", "v")]));
        let mut t = MatchTracker::new();
        t.upsert_controller(uid(100), "ns", &"k=v".parse().unwrap(), Some(&idx));
        assert_eq!(t.resource_removed(&uid(1)).as_slice(), &[uid(100)]);
        assert_eq!(t.tracked(&uid(100)).unwrap().len(), 1);
        assert!(t.remove_controller(&uid(100)));
        assert!(t.owners_of(&uid(2)).is_empty());
        assert!(!t.remove_controller(&uid(100)));
        assert!(t.is_empty());
    }

    #[test]
    fn unchanged_selector_skips_recompute() {
        let idx = LabelIndex::new();
        let mut t = MatchTracker::new();
        let s: Selector = "k=v".parse().unwrap();
        assert!(t.upsert_controller(uid(100), "ns", &s, Some(&idx)));
        assert!(!t.upsert_controller(uid(100), "ns", &s, Some(&idx)));
        assert!(t.upsert_controller(uid(100), "ns", &"k=w".parse().unwrap(), Some(&idx)));
    }
}
