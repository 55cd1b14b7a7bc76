//! Per-object-path handler registrations.
//!
//! Paths are registered with a message handler, an optional unregister
//! hook, and an optional subtree-fallback flag. Unregistration is
//! two-phase: the entry is first marked as being removed so that lookups
//! already report "no handler" while the unregister hook runs, then the
//! entry is dropped. "Never registered" and "unregistration in progress"
//! are deliberately indistinguishable to dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::connection::Connection;
use crate::dispatch::Handler;
use crate::error::{Error, Result};

/// Hook invoked when a path registration is removed.
pub type UnregisterHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// The handler set registered for one object path.
#[derive(Clone)]
pub struct PathHandlers {
    on_message: Handler,
    on_unregister: Option<UnregisterHook>,
    fallback: bool,
}

impl PathHandlers {
    /// Create a handler set with just a message handler.
    pub fn new(on_message: Handler) -> Self {
        Self {
            on_message,
            on_unregister: None,
            fallback: false,
        }
    }

    /// Also handle messages for every path below the registered one.
    pub fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Run a hook when the registration is removed.
    pub fn with_unregister_hook(mut self, hook: UnregisterHook) -> Self {
        self.on_unregister = Some(hook);
        self
    }

    /// The message handler.
    pub fn on_message(&self) -> &Handler {
        &self.on_message
    }

    /// The unregister hook, if any.
    pub fn on_unregister(&self) -> Option<&UnregisterHook> {
        self.on_unregister.as_ref()
    }

    /// Whether this registration covers the whole subtree.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }
}

impl fmt::Debug for PathHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathHandlers")
            .field("fallback", &self.fallback)
            .field("has_unregister_hook", &self.on_unregister.is_some())
            .finish()
    }
}

enum PathEntry {
    Active(PathHandlers),
    /// A concurrent unregistration is in progress; lookups treat this the
    /// same as an absent entry.
    Removing,
}

/// Mapping from object path to its registered handler set.
#[derive(Default)]
pub struct PathTable {
    entries: HashMap<String, PathEntry>,
}

impl PathTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler set for `path`.
    ///
    /// A path may only be registered once; an entry that is still being
    /// removed also counts as occupied.
    pub fn register(&mut self, path: &str, handlers: PathHandlers) -> Result<()> {
        if self.entries.contains_key(path) {
            return Err(Error::PathInUse(path.to_string()));
        }
        self.entries
            .insert(path.to_string(), PathEntry::Active(handlers));
        Ok(())
    }

    /// Look up the handler set registered for exactly `path`.
    pub fn lookup(&self, path: &str) -> Option<&PathHandlers> {
        match self.entries.get(path) {
            Some(PathEntry::Active(handlers)) => Some(handlers),
            Some(PathEntry::Removing) | None => None,
        }
    }

    /// Resolve `path` to a handler set: an exact match, or the nearest
    /// ancestor registered as a subtree fallback.
    pub fn resolve(&self, path: &str) -> Option<&PathHandlers> {
        if let Some(handlers) = self.lookup(path) {
            return Some(handlers);
        }
        let mut current = path;
        while let Some(cut) = current.rfind('/') {
            current = if cut == 0 { "/" } else { &current[..cut] };
            if let Some(handlers) = self.lookup(current) {
                if handlers.is_fallback() {
                    return Some(handlers);
                }
            }
            if current == "/" {
                break;
            }
        }
        None
    }

    /// Begin removing `path`: the entry is tombstoned and its handler set
    /// returned so the caller can run the unregister hook. Lookups for the
    /// path report "no handler" from this point on.
    pub fn begin_removal(&mut self, path: &str) -> Option<PathHandlers> {
        match self.entries.get_mut(path) {
            Some(entry) => match std::mem::replace(entry, PathEntry::Removing) {
                PathEntry::Active(handlers) => Some(handlers),
                PathEntry::Removing => None,
            },
            None => None,
        }
    }

    /// Drop the tombstone left by [`PathTable::begin_removal`].
    pub fn finish_removal(&mut self, path: &str) {
        self.entries.remove(path);
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
