//! Extension values and the global extension locker.
//!
//! Extension values live in a side table inside the message's internal
//! region, keyed by [`ExtensionIndex`]. Every read or write of that table
//! is bracketed by the installed locker, if any:
//!
//! ```
//! use tkan_core::{set_extension_locker, ExtensionUnlocker, MessageId};
//!
//! fn unlock(_msg: MessageId) {}
//! fn lock(_msg: MessageId) -> ExtensionUnlocker {
//!     unlock
//! }
//!
//! set_extension_locker(Some(lock));
//! set_extension_locker(None);
//! ```
//!
//! Without a locker the extension region is assumed to be touched by one
//! thread at a time.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::trace;

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::message::internal;
use crate::message::{prepare, read_elem, write_elem, Array, Message, MessageId, Value};
use crate::mini_table::{ExtensionIndex, FieldMode, MiniTableExtension, MiniTableField};

/// Releases the extension region of a message.
pub type ExtensionUnlocker = fn(MessageId);

/// Acquires the extension region of a message and returns its unlocker.
pub type ExtensionLocker = fn(MessageId) -> ExtensionUnlocker;

static LOCKER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Installs (or with `None`, removes) the process-wide extension locker.
pub fn set_extension_locker(locker: Option<ExtensionLocker>) {
    let raw = locker.map_or(ptr::null_mut(), |f| f as *mut ());
    LOCKER.store(raw, Ordering::Release);
    trace!(installed = locker.is_some(), "extension locker updated");
}

fn current_locker() -> Option<ExtensionLocker> {
    let raw = LOCKER.load(Ordering::Acquire);
    if raw.is_null() {
        None
    } else {
        // SAFETY: only `set_extension_locker` stores non-null values, and
        // it stores `ExtensionLocker` function pointers.
        Some(unsafe { mem::transmute::<*mut (), ExtensionLocker>(raw) })
    }
}

/// Holds the extension region of one message until dropped.
pub(crate) struct ExtensionGuard {
    id: MessageId,
    unlock: Option<ExtensionUnlocker>,
}

impl ExtensionGuard {
    pub(crate) fn lock(msg: &Message<'_>) -> Self {
        let id = msg.id();
        Self {
            id,
            unlock: current_locker().map(|lock| lock(id)),
        }
    }
}

impl Drop for ExtensionGuard {
    fn drop(&mut self) {
        if let Some(unlock) = self.unlock {
            unlock(self.id);
        }
    }
}

impl<'a> Message<'a> {
    fn extension_def(&self, ext: ExtensionIndex) -> Result<&'a MiniTableExtension> {
        let schema = self.message_type().schema();
        let def = schema
            .extension(ext)
            .ok_or_else(|| Error::schema(format!("unknown extension index {}", ext.index())))?;
        if def.extendee() != self.message_type().index() {
            return Err(Error::TypeMismatch {
                expected: schema.message(def.extendee()).name().to_string(),
                found: self.message_type().name().to_string(),
            });
        }
        Ok(def)
    }

    /// Whether extension `ext` is set.
    pub fn has_extension(&self, ext: ExtensionIndex) -> bool {
        let _guard = ExtensionGuard::lock(self);
        // SAFETY: live object.
        unsafe { internal::find_extension(self.as_non_null(), ext).is_some() }
    }

    /// Number of extensions set on this message
    pub fn extension_count(&self) -> usize {
        let _guard = ExtensionGuard::lock(self);
        // SAFETY: live object.
        unsafe { internal::extension_slots(self.as_non_null()).len() }
    }

    /// Value of singular extension `ext`, or its default when unset.
    ///
    /// Returns `None` for unset message extensions, repeated extensions
    /// and extensions of other message types.
    pub fn get_extension(&self, ext: ExtensionIndex) -> Option<Value<'a>> {
        let def = self.extension_def(ext).ok()?;
        let field = def.field();
        if field.is_repeated() {
            return None;
        }
        let _guard = ExtensionGuard::lock(self);
        // SAFETY: the slot holds a value of the extension's representation.
        unsafe {
            match internal::find_extension(self.as_non_null(), ext) {
                Some(slot) => read_elem(slot.as_ptr(), field.field_type(), self.extension_sub(field)),
                None if field.field_type().is_submessage() => None,
                None => Some(crate::message::default_of(field)),
            }
        }
    }

    /// Stores `value` in singular extension `ext`.
    pub fn set_extension(&self, ext: ExtensionIndex, value: Value<'_>, arena: &'a Arena) -> Result<()> {
        let def = self.extension_def(ext)?;
        let field = def.field();
        if field.is_repeated() {
            return Err(Error::TypeMismatch {
                expected: "singular extension".to_string(),
                found: value.kind_name().to_string(),
            });
        }
        self.check_arena(arena)?;
        let stored = prepare(field, self.extension_sub(field), value, arena)?;
        let _guard = ExtensionGuard::lock(self);
        // SAFETY: the slot is sized for any singular value.
        unsafe {
            let slot = internal::get_or_create_extension(self.as_non_null(), ext, arena)?;
            write_elem(slot.as_ptr(), stored);
        }
        Ok(())
    }

    /// The message in extension `ext`, allocated in `arena` if unset.
    pub fn mutable_extension_message(&self, ext: ExtensionIndex, arena: &'a Arena) -> Result<Message<'a>> {
        let def = self.extension_def(ext)?;
        let field = def.field();
        let sub = self
            .extension_sub(field)
            .filter(|_| !field.is_repeated())
            .ok_or_else(|| Error::TypeMismatch {
                expected: "singular message extension".to_string(),
                found: format!("{:?}", field.field_type()),
            })?;
        if let Some(existing) = self.get_extension(ext).and_then(|v| v.as_message()) {
            return Ok(existing);
        }
        self.check_arena(arena)?;
        let child = Message::new(sub, arena)?;
        let _guard = ExtensionGuard::lock(self);
        // SAFETY: pointer slot of a message extension.
        unsafe {
            let slot = internal::get_or_create_extension(self.as_non_null(), ext, arena)?;
            write_elem(slot.as_ptr(), Value::Message(child));
        }
        Ok(child)
    }

    /// The array of repeated extension `ext`, if it was ever created.
    pub fn extension_array(&self, ext: ExtensionIndex) -> Option<Array<'a>> {
        let def = self.extension_def(ext).ok()?;
        if def.field().mode() != FieldMode::Array {
            return None;
        }
        let _guard = ExtensionGuard::lock(self);
        // SAFETY: repeated extension slots hold an array pointer at offset 0.
        unsafe {
            let slot = internal::find_extension(self.as_non_null(), ext)?;
            let hdr = internal::array_of(slot, def.field())?;
            Some(Array::from_raw(
                hdr,
                def.field(),
                self.message_type().schema(),
                internal::owner(self.as_non_null()),
            ))
        }
    }

    /// The array of repeated extension `ext`, created in `arena` if needed.
    pub fn mutable_extension_array(&self, ext: ExtensionIndex, arena: &'a Arena) -> Result<Array<'a>> {
        let def = self.extension_def(ext)?;
        if def.field().mode() != FieldMode::Array {
            return Err(Error::TypeMismatch {
                expected: "repeated extension".to_string(),
                found: format!("{:?}", def.field().mode()),
            });
        }
        self.check_arena(arena)?;
        let _guard = ExtensionGuard::lock(self);
        // SAFETY: as in `extension_array`.
        unsafe {
            let slot = internal::get_or_create_extension(self.as_non_null(), ext, arena)?;
            let hdr = internal::array_slot(slot, def.field(), arena)?;
            Ok(Array::from_raw(
                hdr,
                def.field(),
                self.message_type().schema(),
                internal::owner(self.as_non_null()),
            ))
        }
    }

    pub(crate) fn extension_sub(&self, field: &MiniTableField) -> Option<crate::MessageType<'a>> {
        let schema = self.message_type().schema();
        field.message_index().map(|idx| schema.message(idx))
    }

    /// Set extensions with the storage of their values, in insertion order.
    pub(crate) fn extension_entries(&self) -> Vec<(&'a MiniTableExtension, NonNull<u8>)> {
        let schema = self.message_type().schema();
        let _guard = ExtensionGuard::lock(self);
        // SAFETY: live object; slot data stays valid for the arena's lifetime.
        unsafe {
            internal::extension_slots(self.as_non_null())
                .iter()
                .filter_map(|s| {
                    let def = schema.extension(s.index)?;
                    let data = NonNull::new(ptr::addr_of!(s.data) as *mut u8)?;
                    Some((def, data))
                })
                .collect()
        }
    }

    /// Submessages held in extensions.
    pub(crate) fn extension_messages(&self) -> Vec<Message<'a>> {
        let mut out = Vec::new();
        for (def, data) in self.extension_entries() {
            let field = def.field();
            let Some(sub) = self.extension_sub(field) else {
                continue;
            };
            // SAFETY: the slot holds a message pointer or a message array.
            unsafe {
                match field.mode() {
                    FieldMode::Scalar => {
                        if let Some(Value::Message(m)) = read_elem(data.as_ptr(), field.field_type(), Some(sub)) {
                            out.push(m);
                        }
                    }
                    FieldMode::Array | FieldMode::Map => {
                        if let Some(hdr) = internal::array_of(data, field) {
                            let arr = Array::from_raw(hdr, field, sub.schema(), internal::owner(self.as_non_null()));
                            out.extend(arr.iter().filter_map(|v| v.as_message()));
                        }
                    }
                }
            }
        }
        out
    }
}
