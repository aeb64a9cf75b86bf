//! Type-tag registry: the compatibility contract between the two processes.
//!
//! The registry is a closed, version-locked mapping from a Rust message type
//! to a single-byte wire tag. Both processes build the same registry at
//! startup; adding a message type means both sides must agree on its tag
//! before either ships. There is no ambient global table - the registry is
//! an explicit value handed to the [`MessageBus`](crate::MessageBus).

use crate::{BusError, BusMessage};
use std::any::TypeId;
use std::collections::HashMap;

/// The closed map from message type to wire tag.
///
/// Built once at startup, then frozen (typically behind an `Arc`). Both a
/// tag collision and a double registration of one type are startup errors -
/// they can never be races because registration happens before any I/O
/// thread exists.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    tags_by_type: HashMap<TypeId, u8>,
    names_by_tag: HashMap<u8, &'static str>,
}

impl MessageRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `tag` to message type `T`.
    pub fn register<T: BusMessage>(&mut self, tag: u8) -> Result<(), BusError> {
        let name = T::type_name();
        if let Some(existing) = self.names_by_tag.get(&tag) {
            return Err(BusError::TagInUse { tag, existing });
        }
        if self.tags_by_type.contains_key(&TypeId::of::<T>()) {
            return Err(BusError::TypeAlreadyRegistered(name));
        }
        self.tags_by_type.insert(TypeId::of::<T>(), tag);
        self.names_by_tag.insert(tag, name);
        Ok(())
    }

    /// Looks up the wire tag for message type `T`.
    pub fn tag_of<T: BusMessage>(&self) -> Result<u8, BusError> {
        self.tags_by_type
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or_else(|| BusError::UnknownMessageType(T::type_name()))
    }

    /// Diagnostic lookup of the type name registered under a tag.
    pub fn type_name_of(&self, tag: u8) -> Option<&'static str> {
        self.names_by_tag.get(&tag).copied()
    }

    /// Number of registered message types.
    pub fn len(&self) -> usize {
        self.tags_by_type.len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.tags_by_type.is_empty()
    }
}
