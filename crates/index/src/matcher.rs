//! Selector evaluation.

use replicant_core::{LabelSet, Selector, Uid};
use rustc_hash::FxHashSet;

use crate::LabelIndex;

/// True iff every `key=value` in `selector` is present in `labels`.
/// Empty selectors match nothing.
pub fn matches(selector: &Selector, labels: &LabelSet) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.contains(k, v))
}

/// Resources in `index` matching `selector`: the intersection of each
/// constraint's postings, walked smallest posting first.
pub fn candidate_set(selector: &Selector, index: &LabelIndex) -> FxHashSet<Uid> {
    if selector.is_empty() {
        return FxHashSet::default();
    }
    let mut postings: Vec<&FxHashSet<Uid>> = selector.iter().map(|(k, v)| index.candidates_for(k, v)).collect();
    postings.sort_by_key(|p| p.len());
    let (seed, rest) = match postings.split_first() {
        Some((seed, rest)) if !seed.is_empty() => (seed, rest),
        _ => return FxHashSet::default(),
    };
    let out: FxHashSet<Uid> = seed.iter().filter(|uid| rest.iter().all(|p| p.contains(*uid))).copied().collect();
    metrics::histogram!("candidate_set_size", out.len() as f64);
    out
}
