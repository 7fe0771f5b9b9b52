//! Tuples and the set algebra used to merge replica responses.
//!
//! A [`KeyScoreMember`] is the fundamental unit of data: an opaque key, a
//! 64-bit score, and an opaque member. A [`KeyMember`] names the same logical
//! element independent of its current score. [`union_difference`] is the merge
//! rule applied across replica responses: the highest score wins per element,
//! and any element not present in every response is flagged as divergent.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single sorted-set element.
///
/// Equality and hashing cover the whole triple, with the score compared by
/// bit pattern, so a set of tuples is unique per (key, score, member).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyScoreMember {
    /// Key the element lives under.
    pub key: Bytes,
    /// Writer-supplied score. The highest score wins the merge.
    pub score: f64,
    /// Member payload, unique within its key.
    pub member: Bytes,
}

impl KeyScoreMember {
    /// Create a tuple from anything byte-like.
    pub fn new(key: impl Into<Bytes>, score: f64, member: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            score,
            member: member.into(),
        }
    }

    /// The (key, member) projection naming this element.
    pub fn key_member(&self) -> KeyMember {
        KeyMember {
            key: self.key.clone(),
            member: self.member.clone(),
        }
    }
}

impl PartialEq for KeyScoreMember {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.score.to_bits() == other.score.to_bits()
            && self.member == other.member
    }
}

impl Eq for KeyScoreMember {}

impl Hash for KeyScoreMember {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.score.to_bits().hash(state);
        self.member.hash(state);
    }
}

/// Canonical order: score descending, then member ascending, then key
/// ascending as a final stable tiebreak.
impl Ord for KeyScoreMember {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.member.cmp(&other.member))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for KeyScoreMember {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KeyScoreMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.member),
            self.score
        )
    }
}

/// The (key, member) projection of a tuple: the identity of a logical
/// element, independent of its current score.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyMember {
    /// Key the element lives under.
    pub key: Bytes,
    /// Member payload.
    pub member: Bytes,
}

impl KeyMember {
    /// Create a projection from anything byte-like.
    pub fn new(key: impl Into<Bytes>, member: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            member: member.into(),
        }
    }
}

impl fmt::Display for KeyMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.member)
        )
    }
}

impl From<&KeyScoreMember> for KeyMember {
    fn from(tuple: &KeyScoreMember) -> Self {
        tuple.key_member()
    }
}

/// A set of tuples, unique by the whole triple.
#[derive(Debug, Default, Clone)]
pub struct TupleSet(HashSet<KeyScoreMember>);

impl TupleSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tuple.
    pub fn insert(&mut self, tuple: KeyScoreMember) {
        self.0.insert(tuple);
    }

    /// Whether the exact triple is present.
    pub fn contains(&self, tuple: &KeyScoreMember) -> bool {
        self.0.contains(tuple)
    }

    /// Number of tuples in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no tuples.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the tuples in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyScoreMember> {
        self.0.iter()
    }

    /// Flatten into canonical order and truncate to `limit`.
    pub fn ordered_limited(&self, limit: usize) -> Vec<KeyScoreMember> {
        self.windowed(0, limit)
    }

    /// Flatten into canonical order, skip `offset` tuples, take `limit`.
    pub fn windowed(&self, offset: usize, limit: usize) -> Vec<KeyScoreMember> {
        let mut all: Vec<KeyScoreMember> = self.0.iter().cloned().collect();
        all.sort_unstable();
        all.into_iter().skip(offset).take(limit).collect()
    }
}

impl FromIterator<KeyScoreMember> for TupleSet {
    fn from_iter<I: IntoIterator<Item = KeyScoreMember>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<KeyScoreMember> for TupleSet {
    fn extend<I: IntoIterator<Item = KeyScoreMember>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for TupleSet {
    type Item = KeyScoreMember;
    type IntoIter = std::collections::hash_set::IntoIter<KeyScoreMember>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A set of (key, member) projections.
#[derive(Debug, Default, Clone)]
pub struct KeyMemberSet(HashSet<KeyMember>);

impl KeyMemberSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a projection.
    pub fn insert(&mut self, km: KeyMember) {
        self.0.insert(km);
    }

    /// Whether the projection is present.
    pub fn contains(&self, km: &KeyMember) -> bool {
        self.0.contains(km)
    }

    /// Number of projections in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no projections.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyMember> {
        self.0.iter()
    }

    /// Keep only the projections `keep` approves of.
    pub fn retain(&mut self, keep: impl FnMut(&KeyMember) -> bool) {
        self.0.retain(keep);
    }
}

impl FromIterator<KeyMember> for KeyMemberSet {
    fn from_iter<I: IntoIterator<Item = KeyMember>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<KeyMember> for KeyMemberSet {
    fn extend<I: IntoIterator<Item = KeyMember>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for KeyMemberSet {
    type Item = KeyMember;
    type IntoIter = std::collections::hash_set::IntoIter<KeyMember>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Merge replica responses.
///
/// The union holds, for every element appearing in any input, the tuple with
/// the highest score observed for it. The difference holds every element
/// whose exact triple is absent from at least one input, which is the seed
/// set for read repair. Score disagreements therefore show up through the
/// difference (each disagreeing triple misses from the other inputs), while
/// a triple present everywhere never does.
///
/// Associative and commutative in the inputs, and O(total tuples).
pub fn union_difference(sets: &[TupleSet]) -> (TupleSet, KeyMemberSet) {
    let expected = sets.len();
    let mut best: HashMap<KeyMember, f64> = HashMap::new();
    let mut counts: HashMap<&KeyScoreMember, usize> = HashMap::new();

    for set in sets {
        for tuple in set.iter() {
            let km = tuple.key_member();
            match best.get_mut(&km) {
                Some(score) if tuple.score <= *score => {}
                Some(score) => *score = tuple.score,
                None => {
                    best.insert(km, tuple.score);
                }
            }
            *counts.entry(tuple).or_insert(0) += 1;
        }
    }

    let union = best
        .into_iter()
        .map(|(km, score)| KeyScoreMember {
            key: km.key,
            score,
            member: km.member,
        })
        .collect();
    let difference = counts
        .into_iter()
        .filter(|(_, count)| *count < expected)
        .map(|(tuple, _)| tuple.key_member())
        .collect();
    (union, difference)
}
