//! Read-only view of which product options are still on sale.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::OptionId;

#[async_trait]
pub trait CatalogReader: Send + Sync + 'static {
    /// False once an option is discontinued or hidden.
    async fn is_available(&self, option_id: OptionId) -> bool;
}

/// In-memory catalog. Every option is available until marked otherwise.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    withdrawn: Arc<RwLock<HashSet<OptionId>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, option_id: OptionId, available: bool) {
        if let Ok(mut withdrawn) = self.withdrawn.write() {
            if available {
                withdrawn.remove(&option_id);
            } else {
                withdrawn.insert(option_id);
            }
        }
    }
}

#[async_trait]
impl CatalogReader for InMemoryCatalog {
    async fn is_available(&self, option_id: OptionId) -> bool {
        self.withdrawn
            .read()
            .map(|w| !w.contains(&option_id))
            .unwrap_or(false)
    }
}
