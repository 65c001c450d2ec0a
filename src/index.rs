//! Field indexes for record lookups.
//!
//! Each registered field maps a key to the set of live ids holding it. The
//! facade calls the `update_on_*` hooks while it still holds the shard lock
//! of the record being changed, so a resolved operation always leaves every
//! index in step with the shards.

use crate::error::{Result, StoreError};
use crate::types::{ContentHash, RecordId, TypeTag, Value};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Fields an index can be built on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexField {
    Id,
    Type,
    Value,
}

impl IndexField {
    pub const ALL: [IndexField; 3] = [IndexField::Id, IndexField::Type, IndexField::Value];

    /// Name as it appears in the shard header.
    pub fn as_str(self) -> &'static str {
        match self {
            IndexField::Id => "ID",
            IndexField::Type => "Type",
            IndexField::Value => "Value",
        }
    }
}

impl fmt::Display for IndexField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        IndexField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| StoreError::UnsupportedField(s.to_string()))
    }
}

/// A key within one field index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey(String);

impl IndexKey {
    pub fn for_id(id: RecordId) -> Self {
        Self(id.0.to_string())
    }

    pub fn for_type(tag: TypeTag) -> Self {
        Self(tag.as_str().to_string())
    }

    /// Key for the `Value` field: the content hash of the value.
    pub fn for_value(value: &Value) -> Result<Self> {
        Ok(Self::for_hash(&value.content_hash()?))
    }

    pub fn for_hash(hash: &ContentHash) -> Self {
        Self(hash.to_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything an index needs to know about one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordKeys {
    pub id: RecordId,
    pub tag: TypeTag,
    pub content: ContentHash,
}

impl RecordKeys {
    pub fn new(id: RecordId, tag: TypeTag, content: ContentHash) -> Self {
        Self { id, tag, content }
    }

    pub fn of(id: RecordId, value: &Value) -> Result<Self> {
        Ok(Self::new(id, value.type_tag(), value.content_hash()?))
    }

    pub fn key(&self, field: IndexField) -> IndexKey {
        match field {
            IndexField::Id => IndexKey::for_id(self.id),
            IndexField::Type => IndexKey::for_type(self.tag),
            IndexField::Value => IndexKey::for_hash(&self.content),
        }
    }
}

type FieldIndex = HashMap<IndexKey, BTreeSet<RecordId>>;

#[derive(Default)]
struct IndexState {
    fields: HashMap<IndexField, FieldIndex>,

    /// Keys of every indexed record, so mutations can find what to remove.
    known: HashMap<RecordId, RecordKeys>,
}

impl IndexState {
    fn add(&mut self, keys: &RecordKeys) {
        for (field, index) in self.fields.iter_mut() {
            index.entry(keys.key(*field)).or_default().insert(keys.id);
        }
        self.known.insert(keys.id, keys.clone());
    }

    fn remove(&mut self, keys: &RecordKeys) {
        for (field, index) in self.fields.iter_mut() {
            let key = keys.key(*field);
            if let Some(ids) = index.get_mut(&key) {
                ids.remove(&keys.id);
                if ids.is_empty() {
                    index.remove(&key);
                }
            }
        }
        self.known.remove(&keys.id);
    }
}

/// Registry of field indexes.
#[derive(Default)]
pub struct IndexManager {
    state: RwLock<IndexState>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `field` with no entries. Returns false if it was registered.
    ///
    /// Hooks start feeding the field immediately; existing rows are added
    /// with [`IndexManager::index_records`], one shard at a time under that
    /// shard's lock.
    pub fn register(&self, field: IndexField) -> bool {
        let mut state = self.state.write();
        if state.fields.contains_key(&field) {
            return false;
        }
        state.fields.insert(field, FieldIndex::new());
        true
    }

    /// Add scanned records to every registered field.
    pub fn index_records(&self, records: &[RecordKeys]) {
        let mut state = self.state.write();
        if state.fields.is_empty() {
            return;
        }
        for keys in records {
            state.add(keys);
        }
    }

    /// Empty every registered field ahead of a full rescan.
    pub fn clear_entries(&self) {
        let mut state = self.state.write();
        for index in state.fields.values_mut() {
            index.clear();
        }
        state.known.clear();
    }

    /// Unregister `field`. Returns whether it was registered.
    pub fn drop_index(&self, field: IndexField) -> bool {
        let mut state = self.state.write();
        let removed = state.fields.remove(&field).is_some();
        if state.fields.is_empty() {
            state.known.clear();
        }
        removed
    }

    pub fn is_indexed(&self, field: IndexField) -> bool {
        self.state.read().fields.contains_key(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().fields.is_empty()
    }

    /// Registered fields, in field order.
    pub fn fields(&self) -> Vec<IndexField> {
        let mut fields: Vec<IndexField> = self.state.read().fields.keys().copied().collect();
        fields.sort();
        fields
    }

    /// Keys last indexed for `id`.
    pub fn known(&self, id: RecordId) -> Option<RecordKeys> {
        self.state.read().known.get(&id).cloned()
    }

    pub fn update_on_insert(&self, keys: &RecordKeys) {
        let mut state = self.state.write();
        if !state.fields.is_empty() {
            state.add(keys);
        }
    }

    /// Swap `old` for `new` under one write lock: remove first, then insert.
    pub fn update_on_mutate(&self, old: &RecordKeys, new: &RecordKeys) {
        let mut state = self.state.write();
        if !state.fields.is_empty() {
            state.remove(old);
            state.add(new);
        }
    }

    /// Drop whatever is indexed for `id`.
    pub fn update_on_delete(&self, id: RecordId) {
        let mut state = self.state.write();
        if let Some(keys) = state.known.get(&id).cloned() {
            state.remove(&keys);
        }
    }

    /// Most recently issued live id holding `key`.
    pub fn lookup(&self, field: IndexField, key: &IndexKey) -> Result<Option<RecordId>> {
        let state = self.state.read();
        let index = state
            .fields
            .get(&field)
            .ok_or_else(|| not_indexed(field))?;
        Ok(index.get(key).and_then(|ids| ids.iter().next_back().copied()))
    }

    /// Every live id holding `key`, ascending.
    pub fn lookup_all(&self, field: IndexField, key: &IndexKey) -> Result<Vec<RecordId>> {
        let state = self.state.read();
        let index = state
            .fields
            .get(&field)
            .ok_or_else(|| not_indexed(field))?;
        Ok(index
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }
}

fn not_indexed(field: IndexField) -> StoreError {
    StoreError::UnsupportedField(format!("no index registered on {}", field))
}
