use bit_vec::BitVec;
use serde::{Deserialize, Serialize};

/// Per-tail mask of which columns that tail updates; all-zero for base
/// records at insert time. Backed by a real bitset rather than a
/// `"0101"`-style string.
#[derive(Debug, Clone)]
pub struct SchemaBits(BitVec);

impl SchemaBits {
    pub fn zeros(num_columns: usize) -> SchemaBits {
        SchemaBits(BitVec::from_elem(num_columns, false))
    }

    pub fn set(&mut self, col: usize, updated: bool) {
        self.0.set(col, updated);
    }

    pub fn get(&self, col: usize) -> bool {
        self.0.get(col).unwrap_or(false)
    }

    pub fn any_set(&self) -> bool {
        self.0.iter().any(|b| b)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    /// `'0'`/`'1'` string form, matching the JSON metadata schema.
    pub fn to_bit_string(&self) -> String {
        self.0.iter().map(|b| if b { '1' } else { '0' }).collect()
    }

    pub fn from_bit_string(s: &str) -> SchemaBits {
        let mut bv = BitVec::from_elem(s.len(), false);
        for (i, c) in s.chars().enumerate() {
            bv.set(i, c == '1');
        }
        SchemaBits(bv)
    }
}

/// Tagged record-directory entry, replacing a heterogenous
/// `[indirection, rid, timestamp, schema, v0, ..., v_{k-1}]` list with a
/// proper struct. One entry exists for every rid ever assigned, base or tail;
/// tombstoning a base sets `rid = 0` rather than removing the entry, so
/// rids are never dangling.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    /// rid of the newest tail update older than this record, or 0 if none.
    pub indirection: u64,
    /// This entry's own rid; 0 once tombstoned.
    pub rid: u64,
    /// Wall-clock seconds at creation.
    pub timestamp: i64,
    /// Length-`k` mask of which columns this entry sets (tail) or all-zero
    /// (fresh base).
    pub schema: SchemaBits,
    /// User column values as stored in this entry.
    pub values: Vec<i64>,
}

impl RecordEntry {
    pub fn new_base(rid: u64, timestamp: i64, values: Vec<i64>) -> RecordEntry {
        let num_columns = values.len();
        RecordEntry {
            indirection: 0,
            rid,
            timestamp,
            schema: SchemaBits::zeros(num_columns),
            values,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.rid == 0
    }
}

/// A materialized, projected row returned from `select`/`select_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rid: u64,
    pub key: i64,
    /// `None` for columns excluded by the projection mask.
    pub columns: Vec<Option<i64>>,
}

/// Wire form of a [`RecordEntry`] used only by the metadata sink: the
/// JSON schema stores `schema` as a bit string and `values` inline.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordEntryJson {
    pub indirection: u64,
    pub rid: u64,
    pub timestamp: i64,
    pub schema: String,
    pub values: Vec<i64>,
}

impl From<&RecordEntry> for RecordEntryJson {
    fn from(e: &RecordEntry) -> Self {
        RecordEntryJson {
            indirection: e.indirection,
            rid: e.rid,
            timestamp: e.timestamp,
            schema: e.schema.to_bit_string(),
            values: e.values.clone(),
        }
    }
}

impl From<RecordEntryJson> for RecordEntry {
    fn from(j: RecordEntryJson) -> Self {
        RecordEntry {
            indirection: j.indirection,
            rid: j.rid,
            timestamp: j.timestamp,
            schema: SchemaBits::from_bit_string(&j.schema),
            values: j.values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_bit_string_round_trips() {
        let mut s = SchemaBits::zeros(5);
        s.set(2, true);
        s.set(4, true);
        assert_eq!(s.to_bit_string(), "00101");
        let back = SchemaBits::from_bit_string("00101");
        assert!(!back.get(0));
        assert!(back.get(2));
        assert!(back.get(4));
    }

    #[test]
    fn fresh_base_schema_is_all_zero() {
        let entry = RecordEntry::new_base(1, 0, vec![1, 2, 3]);
        assert!(!entry.schema.any_set());
        assert!(!entry.is_tombstoned());
    }
}
