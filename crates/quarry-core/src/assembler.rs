//! Folds page fragments for one identifier into a single [`Record`].
//!
//! Merge rules:
//!
//! - Items are keyed by their own key or, failing that, by their position in
//!   the identifier's full item sequence. The first occurrence of a key wins.
//! - Fields are merged by non-destructive union. Objects merge recursively;
//!   a missing or `null` value is filled in; an existing non-null value is
//!   only replaced by an authoritative fragment.

use std::collections::HashSet;

use serde_json::map::Entry;
use serde_json::{Map, Value};

use crate::models::{Identifier, PageFragment, RawItem, Record, compute_hash};

#[derive(Debug, Clone)]
pub struct RecordAssembler {
    identifier: Identifier,
    fields: Map<String, Value>,
    items: Vec<RawItem>,
    seen: HashSet<String>,
    /// Items seen so far, duplicates included.
    position: usize,
    pages: u32,
    duplicates_dropped: usize,
}

impl RecordAssembler {
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            fields: Map::new(),
            items: Vec::new(),
            seen: HashSet::new(),
            position: 0,
            pages: 0,
            duplicates_dropped: 0,
        }
    }

    pub fn fold(mut self, fragment: PageFragment) -> Self {
        self.fold_in_place(fragment);
        self
    }

    pub(crate) fn fold_in_place(&mut self, fragment: PageFragment) {
        self.pages += 1;
        merge_fields(&mut self.fields, fragment.fields, fragment.authoritative);

        for item in fragment.items {
            let key = match &item.key {
                Some(k) => format!("k:{k}"),
                None => format!("p:{}", self.position),
            };
            self.position += 1;
            if self.seen.insert(key) {
                self.items.push(item);
            } else {
                self.duplicates_dropped += 1;
            }
        }
    }

    pub fn has_fragments(&self) -> bool {
        self.pages > 0
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn finish(self, complete: bool) -> Record {
        let canonical = serde_json::json!({ "fields": &self.fields, "items": &self.items });
        let data_hash = compute_hash(&canonical.to_string());
        Record {
            identifier: self.identifier,
            item_count: self.items.len(),
            fields: self.fields,
            items: self.items,
            pages: self.pages,
            duplicates_dropped: self.duplicates_dropped,
            complete,
            data_hash,
        }
    }
}

fn merge_fields(target: &mut Map<String, Value>, incoming: Map<String, Value>, authoritative: bool) {
    for (key, value) in incoming {
        match target.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(mut slot) => merge_value(slot.get_mut(), value, authoritative),
        }
    }
}

fn merge_value(existing: &mut Value, incoming: Value, authoritative: bool) {
    if incoming.is_null() {
        return;
    }
    match (existing, incoming) {
        (Value::Object(left), Value::Object(right)) => merge_fields(left, right, authoritative),
        (slot, value) => {
            if slot.is_null() || authoritative {
                *slot = value;
            }
        }
    }
}
