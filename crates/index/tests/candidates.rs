#![forbid(unsafe_code)]

use proptest::prelude::*;
use replicant_core::{LabelSet, Selector, Uid};
use replicant_index::{candidate_set, matches, LabelIndex};
use rustc_hash::FxHashSet;

fn uid(n: u16) -> Uid { let mut u = [0u8; 16]; u[14..].copy_from_slice(&n.to_be_bytes()); u }

// Small key/value alphabets so selectors actually hit.
fn label_pairs() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec((prop::sample::select(vec!["app", "tier", "type", "tag"]), prop::sample::select(vec!["a", "b", "c"])), 0..5)
        .prop_map(|v| v.into_iter().map(|(k, val)| (k.to_string(), val.to_string())).collect())
}

fn brute_force(selector: &Selector, population: &[(Uid, LabelSet)]) -> FxHashSet<Uid> {
    population.iter().filter(|(_, l)| matches(selector, l)).map(|(u, _)| *u).collect()
}

proptest! {
    /// Index-driven candidate retrieval agrees with a full scan for any population.
    #[test]
    fn candidate_set_equals_brute_force(
        pop in prop::collection::vec(label_pairs(), 0..40),
        removals in prop::collection::vec(0u16..40, 0..10),
        relabels in prop::collection::vec((0u16..40, label_pairs()), 0..10),
        selector in label_pairs(),
    ) {
        let mut idx = LabelIndex::new();
        let mut population: Vec<(Uid, LabelSet)> = Vec::new();
        for (i, pairs) in pop.iter().enumerate() {
            let l = LabelSet::from_pairs(pairs.clone());
            idx.upsert(uid(i as u16), &l);
            population.push((uid(i as u16), l));
        }
        for (n, pairs) in relabels {
            if let Some(slot) = population.iter_mut().find(|(u, _)| *u == uid(n)) {
                let l = LabelSet::from_pairs(pairs);
                idx.upsert(slot.0, &l);
                slot.1 = l;
            }
        }
        for n in removals {
            idx.remove(&uid(n));
            population.retain(|(u, _)| *u != uid(n));
        }
        let selector = Selector::new(LabelSet::from_pairs(selector));
        prop_assert_eq!(candidate_set(&selector, &idx), brute_force(&selector, &population));
    }

    /// matches() is exactly "every selector pair appears in labels", and false for empty selectors.
    #[test]
    fn matches_is_subset_check(labels in label_pairs(), selector in label_pairs()) {
        let labels = LabelSet::from_pairs(labels);
        let selector = Selector::new(LabelSet::from_pairs(selector));
        let expected = !selector.is_empty() && selector.iter().all(|(k, v)| labels.iter().any(|(lk, lv)| lk == k && lv == v));
        prop_assert_eq!(matches(&selector, &labels), expected);
    }
}

#[test]
fn fixture_shaped_population() {
    let mut idx = LabelIndex::new();
    for n in 0..1000u16 {
        let l = LabelSet::from_pairs([
            ("tag", "silly"),
            ("type", if n % 2 == 0 { "even" } else { "odd" }),
            ("factor3", if n % 3 == 0 { "yes" } else { "no" }),
        ]);
        idx.upsert(uid(n), &l);
    }
    let odd: Selector = "tag=silly,type=odd".parse().unwrap();
    let three: Selector = "factor3=yes".parse().unwrap();
    let odd_set = candidate_set(&odd, &idx);
    let three_set = candidate_set(&three, &idx);
    assert_eq!(odd_set.len(), 500);
    assert!(odd_set.iter().all(|u| u16::from_be_bytes([u[14], u[15]]) % 2 == 1));
    assert_eq!(three_set.len(), 334);
    // odd multiples of three sit in both sets
    assert_eq!(odd_set.intersection(&three_set).count(), 167);
}
