// vesper-vm - Bytecode compiler and virtual machine for the Vesper programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Open-addressing hash table keyed by interned strings.
//!
//! Linear probing with tombstones. Because keys are interned, key
//! comparison is handle identity; the key's hash is cached in the
//! entry so rehashing never needs to look at string contents. The same
//! table shape backs both the global-variable table and the string
//! intern table (where it maps every live string to nil).

use crate::object::{Obj, ObjId};
use crate::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Entry {
    Empty,
    /// A deleted slot; probing continues past it, and `set` may reuse it.
    Tombstone,
    Used { key: ObjId, hash: u32, value: Value },
}

/// Hash table from interned string to value.
#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Used slots plus tombstones; drives the load-factor check.
    count: usize,
}

impl Table {
    /// Create an empty table. No allocation until the first insert.
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    /// Look up a key. `hash` must be the key's string hash.
    pub fn get(&self, key: ObjId, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match self.entries[self.find_entry(key, hash)] {
            Entry::Used { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Insert or overwrite. Returns true if the key was not present.
    pub fn set(&mut self, key: ObjId, hash: u32, value: Value) -> bool {
        if self.count * MAX_LOAD_DEN >= self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }

        let index = self.find_entry(key, hash);
        let was = self.entries[index];
        if matches!(was, Entry::Empty) {
            self.count += 1;
        }
        self.entries[index] = Entry::Used { key, hash, value };
        !matches!(was, Entry::Used { .. })
    }

    /// Remove a key, leaving a tombstone. Returns true if it existed.
    pub fn delete(&mut self, key: ObjId, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = self.find_entry(key, hash);
        if matches!(self.entries[index], Entry::Used { .. }) {
            self.entries[index] = Entry::Tombstone;
            true
        } else {
            false
        }
    }

    /// Intern-table lookup: find an existing string with these contents.
    ///
    /// Keys can't be compared by identity here (the candidate has no
    /// object yet), so this compares length, then hash, then bytes.
    pub fn find_string(&self, objects: &[Obj], chars: &str, hash: u32) -> Option<ObjId> {
        if self.entries.is_empty() {
            return None;
        }
        let mut index = hash as usize % self.entries.len();
        loop {
            match self.entries[index] {
                Entry::Empty => return None,
                Entry::Tombstone => {}
                Entry::Used {
                    key, hash: entry_hash, ..
                } => {
                    if entry_hash == hash {
                        if let Obj::Str(s) = &objects[key.0 as usize] {
                            if s.chars.len() == chars.len() && &*s.chars == chars {
                                return Some(key);
                            }
                        }
                    }
                }
            }
            index = (index + 1) % self.entries.len();
        }
    }

    /// Find the slot for a key: its current slot, or the slot an insert
    /// should use. A tombstone is only reused once the probe sequence
    /// proves the key absent.
    fn find_entry(&self, key: ObjId, hash: u32) -> usize {
        let mut index = hash as usize % self.entries.len();
        let mut tombstone: Option<usize> = None;
        loop {
            match self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Used { key: entry_key, .. } => {
                    if entry_key == key {
                        return index;
                    }
                }
            }
            index = (index + 1) % self.entries.len();
        }
    }

    /// Double the capacity (from an initial 8) and reinsert every used
    /// entry. Tombstones are dropped, so `count` becomes the live count.
    fn grow(&mut self) {
        let capacity = if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::Empty; capacity]);
        self.count = 0;

        for entry in old {
            if let Entry::Used { key, hash, value } = entry {
                let index = self.find_entry(key, hash);
                self.entries[index] = Entry::Used { key, hash, value };
                self.count += 1;
            }
        }
    }
}
