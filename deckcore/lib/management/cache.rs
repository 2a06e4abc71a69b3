use std::sync::Arc;

use arc_swap::ArcSwapOption;

use super::{bootstrap::hives_present, Container};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Holds the most recently resolved default container.
///
/// The slot is swapped atomically as a whole, so readers never wait on writers and validating
/// an entry on disk holds nothing.
#[derive(Debug, Default)]
pub struct DefaultContainerCache {
    slot: ArcSwapOption<Container>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DefaultContainerCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached container if it is still bootstrapped on disk.
    ///
    /// A stale entry is cleared, unless another caller replaced it in the meantime.
    pub async fn get(&self) -> Option<Arc<Container>> {
        let cached = self.slot.load_full()?;
        if hives_present(cached.get_root_path()).await {
            return Some(cached);
        }

        tracing::info!(
            container_id = %cached.get_id(),
            "cached default container is gone, clearing cache"
        );

        let current = Some(cached);
        let _ = self.slot.compare_and_swap(&current, None);

        None
    }

    /// Replaces the cached container.
    pub fn set(&self, container: Arc<Container>) {
        self.slot.store(Some(container));
    }

    /// Clears the cache.
    pub fn invalidate(&self) {
        self.slot.store(None);
    }

    /// Whether a container is cached, without validating it.
    pub fn is_populated(&self) -> bool {
        self.slot.load().is_some()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
