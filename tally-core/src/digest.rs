//! Content digest: per-character frequency fingerprint of a payload.
//!
//! This is a corruption detector, not a hash. Any two texts with the same
//! multiset of characters (anagrams) have the same fingerprint.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Character → occurrence count. Only observed characters are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint(BTreeMap<char, u64>);

/// Count every character of `text`, whitespace and punctuation included.
pub fn fingerprint(text: &str) -> Fingerprint {
    let mut counts = BTreeMap::new();
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    Fingerprint(counts)
}

/// Structural equality. A key with count 0 is not the same as an absent key.
pub fn equal_fingerprints(a: &Fingerprint, b: &Fingerprint) -> bool {
    a == b
}

impl Fingerprint {
    pub fn get(&self, c: char) -> u64 {
        self.0.get(&c).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, u64)> + '_ {
        self.0.iter().map(|(&c, &n)| (c, n))
    }

    /// Wire form: `{ "h": 1, "e": 1, "l": 2, "o": 1 }`.
    pub fn to_wire(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(c, n)| (c.to_string(), Value::from(*n)))
            .collect()
    }

    /// Parse the wire form. Entries whose key is not exactly one character, or
    /// whose value is not a non-negative integer, are dropped.
    pub fn from_wire(map: &Map<String, Value>) -> Self {
        let mut counts = BTreeMap::new();
        for (key, value) in map {
            let mut chars = key.chars();
            let (Some(c), None) = (chars.next(), chars.next()) else {
                tracing::warn!(key = %key, "invalid frequency key (not a single character)");
                continue;
            };
            match value.as_u64() {
                Some(n) => {
                    counts.insert(c, n);
                }
                None => {
                    tracing::warn!(key = %key, value = %value, "invalid frequency value");
                }
            }
        }
        Fingerprint(counts)
    }
}

impl FromIterator<(char, u64)> for Fingerprint {
    fn from_iter<I: IntoIterator<Item = (char, u64)>>(iter: I) -> Self {
        Fingerprint(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn hello_counts() {
        let fp = fingerprint("hello");
        let expected: Fingerprint = [('h', 1), ('e', 1), ('l', 2), ('o', 1)].into_iter().collect();
        assert_eq!(fp, expected);
        assert_eq!(fp.get('l'), 2);
        assert_eq!(fp.get('z'), 0);
    }

    #[test]
    fn counts_whitespace_and_punctuation() {
        let fp = fingerprint("{\"a\": 1, \"b\": 2}");
        assert_eq!(fp.get('"'), 4);
        assert_eq!(fp.get(' '), 3);
        assert_eq!(fp.get(','), 1);
        assert_eq!(fp.get('{'), 1);
    }

    #[test]
    fn empty_text_is_empty_map() {
        assert!(fingerprint("").is_empty());
        assert!(equal_fingerprints(&fingerprint(""), &Fingerprint::default()));
    }

    #[test]
    fn materialized_zero_differs_from_absent() {
        let zero: Fingerprint = [('x', 0)].into_iter().collect();
        assert!(!equal_fingerprints(&Fingerprint::default(), &zero));
    }

    #[test]
    fn permutation_invariant() {
        let text = "{\"action\":\"send_message\",\"data\":{\"content\":\"Hi there, Bob!\"}}";
        let mut chars: Vec<char> = text.chars().collect();
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            chars.shuffle(&mut rng);
            let shuffled: String = chars.iter().collect();
            assert!(equal_fingerprints(&fingerprint(text), &fingerprint(&shuffled)));
        }
    }

    #[test]
    fn anagrams_collide() {
        assert_eq!(fingerprint("listen"), fingerprint("silent"));
    }

    #[test]
    fn single_edit_changes_fingerprint() {
        let base = fingerprint("hello world");
        // altered
        assert_ne!(base, fingerprint("hellp world"));
        // inserted
        assert_ne!(base, fingerprint("hello  world"));
        // deleted
        assert_ne!(base, fingerprint("hello worl"));
    }

    #[test]
    fn single_edit_at_every_position() {
        let text = "room 42: meet at 5!";
        let base = fingerprint(text);
        let chars: Vec<char> = text.chars().collect();
        for i in 0..chars.len() {
            let mut deleted = chars.clone();
            deleted.remove(i);
            assert_ne!(base, fingerprint(&deleted.iter().collect::<String>()));

            let mut altered = chars.clone();
            altered[i] = if altered[i] == '#' { '%' } else { '#' };
            assert_ne!(base, fingerprint(&altered.iter().collect::<String>()));
        }
    }

    #[test]
    fn wire_roundtrip_and_lenient_parse() {
        let fp = fingerprint("aab");
        let wire = fp.to_wire();
        assert_eq!(wire.get("a"), Some(&Value::from(2u64)));
        assert_eq!(Fingerprint::from_wire(&wire), fp);

        let mut noisy = wire.clone();
        noisy.insert("ab".into(), Value::from(1));
        noisy.insert("c".into(), Value::from("three"));
        noisy.insert("d".into(), Value::from(-1));
        assert_eq!(Fingerprint::from_wire(&noisy), fp);
    }
}
