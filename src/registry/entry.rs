//! Registry entries: a key bound to a create/release pair.

use crate::component::RawComponent;
use std::fmt;
use std::sync::Arc;

/// Factory producing a fresh instance, or `None` when the module failed to allocate.
pub type CreateFn = Arc<dyn Fn() -> Option<RawComponent> + Send + Sync>;

/// Destroys an instance produced by the matching [`CreateFn`].
pub type ReleaseFn = Arc<dyn Fn(RawComponent) + Send + Sync>;

/// Where an entry came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Registered by code linked into the process.
    Static,
    /// Listed by the descriptor of the named plugin.
    Plugin(String),
    /// Defined at runtime as an [`ExtensionClass`](crate::component::ExtensionClass).
    Extension,
}

/// One `key -> (create, release)` binding.
///
/// Every [`ComponentPtr`](crate::component::ComponentPtr) keeps the entry it
/// was created from, so the instance is always released by the same module
/// that allocated it, even after the key is unregistered or overwritten.
pub struct RegistryEntry {
    key: String,
    create: CreateFn,
    release: ReleaseFn,
    origin: EntryOrigin,
}

impl RegistryEntry {
    /// Create a new entry.
    pub fn new(
        key: impl Into<String>,
        create: CreateFn,
        release: ReleaseFn,
        origin: EntryOrigin,
    ) -> Self {
        Self {
            key: key.into(),
            create,
            release,
            origin,
        }
    }

    /// Registry key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Origin of the entry.
    pub fn origin(&self) -> &EntryOrigin {
        &self.origin
    }

    /// Invoke the create function.
    pub fn create(&self) -> Option<RawComponent> {
        (self.create)()
    }

    /// Invoke the release function.
    pub fn release(&self, raw: RawComponent) {
        (self.release)(raw)
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("key", &self.key)
            .field("origin", &self.origin)
            .finish()
    }
}
