//! The set of ids the user has deleted.
//!
//! Persisted as a bare JSON array of integer ids. Durability is the client
//! crate's concern; this type only owns the set and its encoding.

use crate::{error::Result, Error, RecordId};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TombstoneSet {
    ids: BTreeSet<RecordId>,
}

impl TombstoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add ids, returning how many were not already present.
    pub fn add(&mut self, ids: &[RecordId]) -> usize {
        ids.iter().filter(|id| self.ids.insert(**id)).count()
    }

    /// Remove ids, returning how many were present.
    pub fn remove(&mut self, ids: &[RecordId]) -> usize {
        ids.iter().filter(|id| self.ids.remove(*id)).count()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.ids.contains(&id)
    }

    pub fn all(&self) -> BTreeSet<RecordId> {
        self.ids.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Encode as a JSON array, ascending.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.ids).map_err(|e| Error::InvalidTombstones(e.to_string()))
    }

    /// Decode a JSON array of ids. Duplicates collapse.
    pub fn from_json(json: &str) -> Result<Self> {
        let ids: Vec<RecordId> =
            serde_json::from_str(json).map_err(|e| Error::InvalidTombstones(e.to_string()))?;
        Ok(ids.into_iter().collect())
    }
}

impl FromIterator<RecordId> for TombstoneSet {
    fn from_iter<T: IntoIterator<Item = RecordId>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_count_changes() {
        let mut set = TombstoneSet::new();
        assert_eq!(set.add(&[1, 2, 2]), 2);
        assert_eq!(set.add(&[2, 3]), 1);
        assert_eq!(set.remove(&[1, 9]), 1);
        assert_eq!(set.all(), BTreeSet::from([2, 3]));
    }

    #[test]
    fn encodes_as_bare_array() {
        let set: TombstoneSet = [30, 10_005, 4].into_iter().collect();
        assert_eq!(set.to_json().unwrap(), "[4,30,10005]");
    }

    #[test]
    fn decodes_with_duplicates() {
        let set = TombstoneSet::from_json("[5, 5, 10001]").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(10_001));
    }

    #[test]
    fn rejects_non_integer_entries() {
        assert!(matches!(
            TombstoneSet::from_json(r#"["a"]"#),
            Err(Error::InvalidTombstones(_))
        ));
        assert!(TombstoneSet::from_json("{}").is_err());
    }
}
