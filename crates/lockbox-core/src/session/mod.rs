//! Session-scoped persistence slot for the credential cache snapshot.
//!
//! The host environment owns a single ephemeral load/save slot that is meant
//! to die with the browsing session. The cache serializes its entries into it
//! so derived keys survive a page reload, and nothing else.

use std::sync::Mutex;

/// Capability interface for the ephemeral snapshot slot.
///
/// Implementations must be infallible from the cache's point of view: a load
/// that cannot produce a state simply returns `None`.
pub trait SnapshotSlot: Send + Sync {
    /// Load the previously saved state, if any.
    fn load(&self) -> Option<String>;

    /// Replace the saved state.
    fn save(&self, state: &str);
}

/// In-memory [`SnapshotSlot`], the default when the host offers nothing
/// better. Shared via `Arc` it also doubles as a reload simulator in tests.
#[derive(Debug, Default)]
pub struct MemorySlot {
    state: Mutex<Option<String>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SnapshotSlot for MemorySlot {
    fn load(&self) -> Option<String> {
        self.locked().clone()
    }

    fn save(&self, state: &str) {
        *self.locked() = Some(state.to_string());
    }
}
