use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info};

use crate::chain::{BlockHash, NodeRpc, RpcError, TemplateId, WorkTemplate};

/// What a refresh did to the cached snapshot.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// The tip has not moved; the cached snapshot stays current
    Unchanged(Arc<WorkTemplate>),
    /// A new snapshot was published
    Updated {
        template: Arc<WorkTemplate>,
        replaced: Option<TemplateId>,
    },
}

impl RefreshOutcome {
    pub fn template(&self) -> &Arc<WorkTemplate> {
        match self {
            RefreshOutcome::Unchanged(template) => template,
            RefreshOutcome::Updated { template, .. } => template,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, RefreshOutcome::Updated { .. })
    }
}

/// Holds the current work snapshot.
///
/// Readers get an `Arc` to an immutable template, so a swap never disturbs
/// workers still holding the previous one.
#[derive(Debug, Default)]
pub struct TemplateCache {
    current: RwLock<Option<Arc<WorkTemplate>>>,
    last_revision: AtomicU64,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<WorkTemplate>> {
        self.read().clone()
    }

    /// Ask the node for work and publish it if the tip moved.
    pub async fn refresh<R: NodeRpc + ?Sized>(&self, rpc: &R) -> Result<RefreshOutcome, RpcError> {
        let fresh = rpc.get_template().await?;
        Ok(self.publish(fresh))
    }

    fn publish(&self, fresh: WorkTemplate) -> RefreshOutcome {
        let mut slot = self.write();

        if let Some(cached) = slot.as_ref() {
            if cached.prev_hash() == fresh.prev_hash() {
                debug!("Template {} still current", cached.id);
                return RefreshOutcome::Unchanged(Arc::clone(cached));
            }
        }

        let revision = self.last_revision.fetch_add(1, Ordering::Relaxed) + 1;
        let template = Arc::new(fresh.with_revision(revision));
        let replaced = slot.replace(Arc::clone(&template)).map(|old| old.id);

        info!(
            "New template {} at height {} ({} transactions)",
            template.id,
            template.height,
            template.transaction_count()
        );
        RefreshOutcome::Updated { template, replaced }
    }

    /// True when the cached work does not build on `tip`, or nothing is cached.
    pub fn is_stale(&self, tip: &BlockHash) -> bool {
        self.read()
            .as_ref()
            .map_or(true, |template| template.prev_hash() != *tip)
    }

    /// Drop the cached snapshot so the next refresh publishes fresh work.
    pub fn invalidate(&self) -> Option<TemplateId> {
        let dropped = self.write().take().map(|template| template.id);
        if let Some(id) = dropped {
            debug!("Invalidated template {}", id);
        }
        dropped
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Arc<WorkTemplate>>> {
        match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Template cache lock poisoned, recovering...");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Arc<WorkTemplate>>> {
        match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Template cache lock poisoned, recovering...");
                poisoned.into_inner()
            }
        }
    }
}
