use crate::{Bag, Cid};
use fxhash::FxHashMap;
use heap::{Heap, PackedKey, Val};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Row is one keyed entry of a collection.
/// The row owns one heap reference of its key and of each held value.
#[derive(Debug)]
pub struct Row {
    pub key: Val,
    pub bag: Bag,
}

/// Table is the materialized content of one collection, ordered by the
/// packed form of its keys so that range and windowed reads walk in key
/// order.
#[derive(Debug, Default)]
pub struct Table {
    rows: BTreeMap<PackedKey, Row>,
}

impl Table {
    pub fn get(&self, key: &PackedKey) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PackedKey, &Row)> {
        self.rows.iter()
    }

    /// Rows with keys in the inclusive packed range.
    pub fn range(
        &self,
        range: RangeInclusive<&PackedKey>,
    ) -> impl Iterator<Item = (&PackedKey, &Row)> {
        self.rows.range::<PackedKey, _>(range)
    }
}

/// WriteOutcome describes the effect of a row write.
pub struct WriteOutcome {
    pub changed: bool,
    /// The key handle now (or formerly) associated with the row.
    /// Borrowed: the caller increfs it if it retains it.
    pub key: Option<Val>,
}

/// Store maps collection ids to their materialized tables. All value and
/// key references held by tables are owned by the store, and every write
/// maintains that ownership exactly.
#[derive(Debug, Default)]
pub struct Store {
    tables: FxHashMap<Cid, Table>,
}

impl Store {
    pub fn create(&mut self, cid: Cid) {
        let prev = self.tables.insert(cid, Table::default());
        assert!(prev.is_none(), "collection {cid:?} already exists");
    }

    pub fn table(&self, cid: Cid) -> &Table {
        self.tables
            .get(&cid)
            .unwrap_or_else(|| panic!("collection {cid:?} does not exist"))
    }

    /// Drop a collection, releasing every reference its table holds.
    pub fn remove(&mut self, heap: &mut Heap, cid: Cid) {
        let table = self.tables.remove(&cid).expect("collection exists");
        for (_, row) in table.rows {
            release_row(heap, row);
        }
    }

    /// Write `bag` at `key`, or delete the row when `bag` is None.
    /// Passed handles are borrowed; the store increfs what it retains and
    /// decrefs whatever the write displaced. Writing an equal bag (as a
    /// multiset) is a no-op.
    pub fn write(
        &mut self,
        heap: &mut Heap,
        cid: Cid,
        packed: &PackedKey,
        key: Val,
        bag: Option<Bag>,
    ) -> WriteOutcome {
        let table = self
            .tables
            .get_mut(&cid)
            .unwrap_or_else(|| panic!("collection {cid:?} does not exist"));

        match (table.rows.get_mut(packed), bag) {
            (None, None) => WriteOutcome {
                changed: false,
                key: None,
            },
            (None, Some(bag)) => {
                heap.inc_ref(key);
                for v in bag.values() {
                    heap.inc_ref(*v);
                }
                table.rows.insert(packed.clone(), Row { key, bag });
                WriteOutcome {
                    changed: true,
                    key: Some(key),
                }
            }
            (Some(row), None) => {
                let key = row.key;
                let row = table.rows.remove(packed).unwrap();
                release_row(heap, row);
                WriteOutcome {
                    changed: true,
                    key: Some(key),
                }
            }
            (Some(row), Some(bag)) => {
                let key = row.key;
                if row.bag.multiset_eq(&bag) {
                    return WriteOutcome {
                        changed: false,
                        key: Some(key),
                    };
                }
                for v in bag.values() {
                    heap.inc_ref(*v);
                }
                let old = std::mem::replace(&mut row.bag, bag);
                for v in old.values() {
                    heap.dec_ref(*v);
                }
                WriteOutcome {
                    changed: true,
                    key: Some(key),
                }
            }
        }
    }
}

fn release_row(heap: &mut Heap, row: Row) {
    heap.dec_ref(row.key);
    for v in row.bag.values() {
        heap.dec_ref(*v);
    }
}

#[cfg(test)]
mod test {
    use super::Store;
    use crate::{Bag, Cid};
    use heap::{pack_key, Heap};

    #[test]
    fn test_write_read_delete() {
        let mut heap = Heap::new();
        let mut store = Store::default();
        let cid = Cid(1);
        store.create(cid);

        let key = heap.intern_u64(7);
        let packed = pack_key(&heap, key);
        let v1 = heap.intern_str("a value that outlives the write");

        let outcome = store.write(&mut heap, cid, &packed, key, Some(Bag::Values(vec![v1])));
        assert!(outcome.changed);

        // The caller's references are still its own.
        heap.dec_ref(key);
        heap.dec_ref(v1);

        let row_key = {
            let row = store.table(cid).get(&packed).unwrap();
            assert_eq!(row.bag.values(), &[v1]);
            row.key
        };

        // An equal write is a no-op.
        let outcome = store.write(&mut heap, cid, &packed, row_key, Some(Bag::Values(vec![v1])));
        assert!(!outcome.changed);

        let outcome = store.write(&mut heap, cid, &packed, key, None);
        assert!(outcome.changed);
        assert!(store.table(cid).is_empty());
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn test_range_iteration_in_key_order() {
        let mut heap = Heap::new();
        let mut store = Store::default();
        let cid = Cid(1);
        store.create(cid);

        for k in [30u64, 10, 20] {
            let key = heap.intern_u64(k);
            let packed = pack_key(&heap, key);
            let v = heap.intern_u64(k * 10);
            store.write(&mut heap, cid, &packed, key, Some(Bag::Values(vec![v])));
            heap.dec_ref(key);
            heap.dec_ref(v);
        }

        let lo = heap.intern_u64(10);
        let hi = heap.intern_u64(20);
        let (lo_p, hi_p) = (pack_key(&heap, lo), pack_key(&heap, hi));

        let keys: Vec<_> = store
            .table(cid)
            .range(&lo_p..=&hi_p)
            .map(|(_, row)| heap.to_json(row.key))
            .collect();
        assert_eq!(keys, vec![serde_json::json!(10), serde_json::json!(20)]);

        heap.dec_ref(lo);
        heap.dec_ref(hi);
        store.remove(&mut heap, cid);
        assert_eq!(heap.live(), 0);
    }
}
