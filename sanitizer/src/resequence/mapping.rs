use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{Result, SanitizerError};

/// Old key -> new key for one table, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMapping {
    pairs: Vec<(i64, i64)>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: Vec<(i64, i64)>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(i64, i64)] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, old: i64) -> Option<i64> {
        self.pairs.iter().find(|(o, _)| *o == old).map(|(_, n)| *n)
    }

    pub fn olds(&self) -> Vec<i64> {
        self.pairs.iter().map(|(o, _)| *o).collect()
    }

    pub fn news(&self) -> Vec<i64> {
        self.pairs.iter().map(|(_, n)| *n).collect()
    }

    /// `self` followed by `then`: where a key ends up after both mappings.
    pub fn compose(&self, then: &IdMapping) -> IdMapping {
        let second: HashMap<i64, i64> = then.pairs.iter().copied().collect();
        let targets: HashSet<i64> = self.pairs.iter().map(|(_, n)| *n).collect();
        let mut pairs: Vec<(i64, i64)> = self
            .pairs
            .iter()
            .map(|(o, n)| (*o, second.get(n).copied().unwrap_or(*n)))
            .collect();
        pairs.extend(then.pairs.iter().filter(|(o, _)| !targets.contains(o)).copied());
        pairs.retain(|(o, n)| o != n);
        IdMapping { pairs }
    }
}

/// A validated mapping, split into plain moves and merges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingPlan {
    /// Rows that get a new key. Targets are free once the domain is shifted.
    pub moves: IdMapping,
    /// Rows folded into an existing surviving row.
    pub merges: IdMapping,
}

impl MappingPlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.merges.is_empty()
    }

    /// Everything this plan does to keys, merges included. Merge targets
    /// appear as identity entries so a later `compose` carries them along;
    /// composing with an empty mapping strips them.
    pub fn effective(&self) -> IdMapping {
        let mut pairs = self.merges.pairs().to_vec();
        let mut survivors: Vec<i64> = self.merges.news();
        survivors.sort_unstable();
        survivors.dedup();
        pairs.extend(survivors.into_iter().map(|k| (k, k)));
        pairs.extend_from_slice(self.moves.pairs());
        IdMapping::from_pairs(pairs)
    }

    /// Largest move target and smallest moved key, for the offset allocator.
    pub fn bounds(&self) -> (Option<i64>, Option<i64>) {
        (
            self.moves.news().into_iter().max(),
            self.moves.olds().into_iter().min(),
        )
    }
}

/// Check a raw mapping against the keys that exist.
///
/// `present` is the subset of the mapping's olds that exist in the table and
/// `occupied` the subset of its targets that exist. Identity entries and
/// entries whose old key is absent are dropped. A target that is occupied by
/// a key outside the domain is a merge, legal only when `allow_merge`.
pub fn validate(
    table: &str,
    raw: &IdMapping,
    present: &[i64],
    occupied: &[i64],
    allow_merge: bool,
) -> Result<MappingPlan> {
    let mut seen = HashSet::new();
    for (old, _) in raw.pairs() {
        if !seen.insert(*old) {
            return Err(SanitizerError::validation(format!(
                "{table}: key {old} is mapped more than once"
            )));
        }
    }

    let present: HashSet<i64> = present.iter().copied().collect();
    let kept: Vec<(i64, i64)> = raw
        .pairs()
        .iter()
        .copied()
        .filter(|(o, n)| o != n && present.contains(o))
        .collect();
    // Identity entries are outside the domain, so their keys stay occupied.
    let domain: HashSet<i64> = kept.iter().map(|(o, _)| *o).collect();
    let occupied: HashSet<i64> = occupied
        .iter()
        .copied()
        .filter(|k| !domain.contains(k))
        .collect();

    let mut moves = Vec::new();
    let mut merges = Vec::new();
    let mut targets = BTreeSet::new();
    for (old, new) in kept {
        if occupied.contains(&new) {
            if !allow_merge {
                return Err(SanitizerError::validation(format!(
                    "{table}: target key {new} for {old} collides with an existing row"
                )));
            }
            merges.push((old, new));
            continue;
        }
        if !targets.insert(new) {
            return Err(SanitizerError::validation(format!(
                "{table}: target key {new} is assigned more than once"
            )));
        }
        moves.push((old, new));
    }

    Ok(MappingPlan {
        moves: IdMapping::from_pairs(moves),
        merges: IdMapping::from_pairs(merges),
    })
}
