//! Map field views.
//!
//! A map field is stored as a repeated field of entry messages with the
//! key as field 1 and the value as field 2. Decoding appends entries in
//! wire order, so a key may appear more than once; lookups honor the last
//! occurrence and the deterministic encoder drops the earlier ones.

use std::fmt;

use super::{Array, Message, Value};
use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::mini_table::{MessageType, MiniTableField};

/// The entries of one map field.
#[derive(Clone, Copy)]
pub struct Map<'a> {
    entries: Array<'a>,
    entry: MessageType<'a>,
    key: &'a MiniTableField,
    value: &'a MiniTableField,
}

impl<'a> Map<'a> {
    pub(crate) fn new(entries: Array<'a>, entry: MessageType<'a>) -> Option<Self> {
        let table = entry.table();
        Some(Self {
            entries,
            entry,
            key: table.map_key()?,
            value: table.map_value()?,
        })
    }

    /// Number of stored entries, counting repeated keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the map has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Type of the entry messages
    pub fn entry_type(&self) -> MessageType<'a> {
        self.entry
    }

    pub(crate) fn entry_messages(&self) -> impl Iterator<Item = Message<'a>> + 'a {
        self.entries.iter().filter_map(|v| v.as_message())
    }

    /// Entries as `(key, value)` pairs in storage order.
    ///
    /// Entries whose message value was never set are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (Value<'a>, Value<'a>)> + 'a {
        let (key, value) = (self.key, self.value);
        self.entry_messages()
            .filter_map(move |e| Some((e.get(key)?, e.get(value)?)))
    }

    fn find(&self, key: Value<'_>) -> Option<Message<'a>> {
        let mut found = None;
        for e in self.entry_messages() {
            if e.get(self.key) == Some(key) {
                found = Some(e);
            }
        }
        found
    }

    /// Value stored under `key`; the last entry wins.
    pub fn get(&self, key: Value<'_>) -> Option<Value<'a>> {
        self.find(key).and_then(|e| e.get(self.value))
    }

    /// True if `key` is present
    pub fn contains_key(&self, key: Value<'_>) -> bool {
        self.find(key).is_some()
    }

    fn check_key(&self, key: Value<'_>) -> Result<()> {
        if key.fits(self.key.field_type()) {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                expected: format!("{:?}", self.key.field_type()),
                found: key.kind_name().to_string(),
            })
        }
    }

    /// Appends a fresh entry for `key` and runs `fill` on it. The entry is
    /// dropped again if either step fails.
    fn append_entry<T>(
        &self,
        key: Value<'_>,
        arena: &'a Arena,
        fill: impl FnOnce(Message<'a>) -> Result<T>,
    ) -> Result<T> {
        let len = self.entries.len();
        let entry = self.entries.append_message(arena)?;
        let filled = entry.set(self.key, key, arena).and_then(|()| fill(entry));
        if filled.is_err() {
            self.entries.truncate(len);
        }
        filled
    }

    /// Stores `value` under `key`, replacing the current value if any.
    ///
    /// On error the map is left as it was.
    pub fn insert(&self, key: Value<'_>, value: Value<'_>, arena: &'a Arena) -> Result<()> {
        self.check_key(key)?;
        match self.find(key) {
            Some(entry) => entry.set(self.value, value, arena),
            None => self.append_entry(key, arena, |entry| entry.set(self.value, value, arena)),
        }
    }

    /// Message value under `key`, inserting an empty one if absent.
    pub fn entry_message(&self, key: Value<'_>, arena: &'a Arena) -> Result<Message<'a>> {
        self.check_key(key)?;
        match self.find(key) {
            Some(entry) => entry.mutable_message(self.value, arena),
            None => self.append_entry(key, arena, |entry| entry.mutable_message(self.value, arena)),
        }
    }

    /// Removes every entry for `key`; returns whether one existed.
    pub fn remove(&self, key: Value<'_>) -> bool {
        let mut kept = 0;
        let len = self.entries.len();
        for i in 0..len {
            let Some(e) = self.entries.get(i).and_then(|v| v.as_message()) else {
                continue;
            };
            if e.get(self.key) == Some(key) {
                continue;
            }
            if kept != i {
                // SAFETY: both indices are in bounds of a pointer array.
                unsafe {
                    let hdr = self.entries.header();
                    let rep = self.entries.field().field_type().rep();
                    super::write_elem(super::internal::array_elem(hdr, rep, kept), Value::Message(e));
                }
            }
            kept += 1;
        }
        self.entries.truncate(kept);
        kept != len
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.clear()
    }
}

impl fmt::Debug for Map<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
