use std::collections::{HashMap, HashSet};

/// Per-column optional inverted map from value to the set of live base
/// rids holding that value. When present for column `c`, the map contains
/// exactly `(current_value(B, c), B.rid)` for every live base `B` and
/// nothing else.
pub struct Index {
    indices: Vec<Option<HashMap<i64, HashSet<u64>>>>,
}

impl Index {
    pub fn new(num_columns: usize) -> Index {
        Index {
            indices: (0..num_columns).map(|_| None).collect(),
        }
    }

    pub fn is_built(&self, column: usize) -> bool {
        self.indices[column].is_some()
    }

    /// Builds a fresh index for `column` from `(value, rid)` pairs
    /// supplied by the caller. The caller is responsible for resolving
    /// each live key's *current* materialized value by walking its
    /// indirection chain before calling this.
    pub fn create_index(&mut self, column: usize, entries: impl Iterator<Item = (i64, u64)>) {
        let mut map: HashMap<i64, HashSet<u64>> = HashMap::new();
        for (value, rid) in entries {
            map.entry(value).or_default().insert(rid);
        }
        self.indices[column] = Some(map);
    }

    pub fn drop_index(&mut self, column: usize) {
        self.indices[column] = None;
    }

    /// All rids with exactly `value` in `column`, or `None` if the column
    /// isn't indexed.
    pub fn locate(&self, column: usize, value: i64) -> Option<Vec<u64>> {
        self.indices[column]
            .as_ref()
            .map(|m| m.get(&value).map(|s| s.iter().copied().collect()).unwrap_or_default())
    }

    /// Union of buckets whose value falls in `[begin, end]`. A linear scan
    /// over buckets, not a sorted-structure range query: range lookups via
    /// index are not required to be efficient; `sum`/`select` fall back to
    /// a full scan when no index is present.
    pub fn locate_range(&self, column: usize, begin: i64, end: i64) -> Option<Vec<u64>> {
        self.indices[column].as_ref().map(|m| {
            let mut result = HashSet::new();
            for (&value, rids) in m.iter() {
                if value >= begin && value <= end {
                    result.extend(rids.iter().copied());
                }
            }
            result.into_iter().collect()
        })
    }

    pub fn add(&mut self, column: usize, value: i64, rid: u64) {
        if let Some(map) = self.indices[column].as_mut() {
            map.entry(value).or_default().insert(rid);
        }
    }

    pub fn remove(&mut self, column: usize, value: i64, rid: u64) {
        if let Some(map) = self.indices[column].as_mut() {
            if let Some(bucket) = map.get_mut(&value) {
                bucket.remove(&rid);
                if bucket.is_empty() {
                    map.remove(&value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_locate() {
        let mut idx = Index::new(3);
        idx.create_index(1, vec![(10, 1), (10, 2), (20, 3)].into_iter());
        let mut found = idx.locate(1, 10).unwrap();
        found.sort();
        assert_eq!(found, vec![1, 2]);
        assert_eq!(idx.locate(1, 99).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn drop_index_falls_back_to_none() {
        let mut idx = Index::new(2);
        idx.create_index(0, std::iter::once((1, 1)));
        assert!(idx.is_built(0));
        idx.drop_index(0);
        assert!(!idx.is_built(0));
        assert!(idx.locate(0, 1).is_none());
    }

    #[test]
    fn add_and_remove_maintain_buckets() {
        let mut idx = Index::new(1);
        idx.create_index(0, std::iter::empty());
        idx.add(0, 5, 1);
        idx.add(0, 5, 2);
        assert_eq!(idx.locate(0, 5).unwrap().len(), 2);
        idx.remove(0, 5, 1);
        assert_eq!(idx.locate(0, 5).unwrap(), vec![2]);
        idx.remove(0, 5, 2);
        // bucket now empty, should be gone but column still "built"
        assert_eq!(idx.locate(0, 5).unwrap(), Vec::<u64>::new());
        assert!(idx.is_built(0));
    }

    #[test]
    fn locate_range_unions_matching_buckets() {
        let mut idx = Index::new(1);
        idx.create_index(0, vec![(1, 1), (5, 2), (10, 3)].into_iter());
        let mut found = idx.locate_range(0, 2, 6).unwrap();
        found.sort();
        assert_eq!(found, vec![1, 2]);
    }
}
