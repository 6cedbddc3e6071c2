//! In-process cache of loaded models keyed by [`VariantKey`].
//!
//! Each key owns a once-cell: concurrent first requests for the same variant
//! share one load, loads for different variants proceed independently, and a
//! failed load leaves the cell empty so the next request retries. Entries are
//! never evicted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use super::{LoadedModel, VariantKey, VlmError};

type Slot<M> = Arc<OnceCell<Arc<M>>>;

#[derive(Debug)]
pub struct ModelCache<M = LoadedModel> {
    slots: Mutex<HashMap<VariantKey, Slot<M>>>,
}

impl<M> Default for ModelCache<M> {
    fn default() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }
}

impl<M> ModelCache<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached model for `key`, running `load` if none is cached yet.
    pub async fn get_or_load<F, Fut>(&self, key: &VariantKey, load: F) -> Result<Arc<M>, VlmError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<M, VlmError>>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(key.clone()).or_default().clone()
        };
        let model = slot.get_or_try_init(|| async { load().await.map(Arc::new) }).await?;
        Ok(Arc::clone(model))
    }

    /// Whether a loaded model exists for `key`.
    pub fn contains(&self, key: &VariantKey) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(key).is_some_and(|s| s.initialized())
    }

    /// Number of loaded variants.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().filter(|s| s.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
