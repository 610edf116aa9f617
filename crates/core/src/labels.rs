//! Label sets and equality selectors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::LabelParseError;

/// Immutable label map. Pairs are kept sorted by key with unique keys, so
/// equality and hashing do not depend on the order labels were supplied in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<(String, String)>")]
pub struct LabelSet(SmallVec<[(String, String); 8]>);

impl LabelSet {
    pub fn new() -> Self { Self::default() }

    /// Build from arbitrary pairs. When a key repeats, the last value wins.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut v: SmallVec<[(String, String); 8]> = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        v.reverse();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v.dedup_by(|later, earlier| later.0 == earlier.0);
        Self(v)
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.0[i].1.as_str())
    }

    pub fn contains(&self, key: &str, value: &str) -> bool { self.get(key) == Some(value) }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ { self.0.iter().map(|(k, _)| k.as_str()) }

    /// Keys whose presence or value differs between `self` and `other`.
    /// Both sides are sorted, so this is a single merge walk.
    pub fn changed_keys<'a>(&'a self, other: &'a LabelSet) -> Vec<&'a str> {
        use std::cmp::Ordering;
        let (a, b) = (&self.0, &other.0);
        let (mut i, mut j) = (0usize, 0usize);
        let mut out = Vec::new();
        while i < a.len() && j < b.len() {
            match a[i].0.cmp(&b[j].0) {
                Ordering::Less => { out.push(a[i].0.as_str()); i += 1; }
                Ordering::Greater => { out.push(b[j].0.as_str()); j += 1; }
                Ordering::Equal => {
                    if a[i].1 != b[j].1 { out.push(a[i].0.as_str()); }
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend(a[i..].iter().map(|(k, _)| k.as_str()));
        out.extend(b[j..].iter().map(|(k, _)| k.as_str()));
        out
    }
}

impl From<Vec<(String, String)>> for LabelSet {
    fn from(v: Vec<(String, String)>) -> Self { Self::from_pairs(v) }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self { Self::from_pairs(iter) }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 { f.write_str(",")?; }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// Parses `key=value[,key=value...]`. An empty string yields an empty set.
impl FromStr for LabelSet {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pairs = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part.split_once('=').ok_or_else(|| LabelParseError::Malformed(part.to_string()))?;
            let k = k.trim();
            if k.is_empty() { return Err(LabelParseError::EmptyKey(part.to_string())); }
            pairs.push((k.to_string(), v.trim().to_string()));
        }
        Ok(Self::from_pairs(pairs))
    }
}

/// Conjunction of `key=value` equality constraints.
///
/// An empty selector is invalid and matches nothing; it never means
/// "select everything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector(LabelSet);

impl Selector {
    pub fn new(labels: LabelSet) -> Self { Self(labels) }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn labels(&self) -> &LabelSet { &self.0 }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ { self.0.iter() }
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ { self.0.keys() }
}

impl From<LabelSet> for Selector {
    fn from(l: LabelSet) -> Self { Self(l) }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Selector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self { Self(LabelSet::from_pairs(iter)) }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

impl FromStr for Selector {
    type Err = LabelParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { s.parse::<LabelSet>().map(Self) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_independent_equality() {
        let a = LabelSet::from_pairs([("tag", "silly"), ("type", "odd")]);
        let b = LabelSet::from_pairs([("type", "odd"), ("tag", "silly")]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "tag=silly,type=odd");
    }

    #[test]
    fn last_value_wins_for_repeated_key() {
        let l = LabelSet::from_pairs([("k", "1"), ("x", "y"), ("k", "2")]);
        assert_eq!(l.len(), 2);
        assert_eq!(l.get("k"), Some("2"));
    }

    #[test]
    fn changed_keys_covers_added_removed_and_modified() {
        let old = LabelSet::from_pairs([("a", "1"), ("b", "2"), ("c", "3")]);
        let new = LabelSet::from_pairs([("b", "2"), ("c", "4"), ("d", "5")]);
        assert_eq!(old.changed_keys(&new), vec!["a", "c", "d"]);
        assert!(old.changed_keys(&old).is_empty());
    }

    #[test]
    fn parse_selector() {
        let s: Selector = "tag=silly, type=odd".parse().unwrap();
        assert_eq!(s.len(), 2);
        assert!("".parse::<Selector>().unwrap().is_empty());
        assert!(matches!("tag".parse::<Selector>(), Err(LabelParseError::Malformed(_))));
        assert!(matches!("=x".parse::<Selector>(), Err(LabelParseError::EmptyKey(_))));
    }

    #[test]
    fn deserialize_canonicalizes() {
        let l: LabelSet = serde_json::from_str(r#"[["z","1"],["a","2"]]"#).unwrap();
        assert_eq!(l.keys().collect::<Vec<_>>(), vec!["a", "z"]);
    }
}
