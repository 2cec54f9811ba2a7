//! Routing Registry (C8, spec §4.8, §3): the process-wide map from every
//! known sandbox/container id to its owning backend. The hypervisor backend
//! is the implicit default and is never stored — "absent from every store"
//! is its encoding.

use crate::types::Backend;
use std::collections::HashSet;
use tokio::sync::RwLock;

/// Deterministic probe order used by `get_runtime`.
const PROBE_ORDER: [Backend; 2] = [Backend::Privileged, Backend::Unikernel];

#[derive(Default)]
struct Stores {
    privileged: HashSet<String>,
    unikernel: HashSet<String>,
}

impl Stores {
    fn store_for(&self, backend: Backend) -> &HashSet<String> {
        match backend {
            Backend::Privileged => &self.privileged,
            Backend::Unikernel => &self.unikernel,
        }
    }

    fn store_for_mut(&mut self, backend: Backend) -> &mut HashSet<String> {
        match backend {
            Backend::Privileged => &mut self.privileged,
            Backend::Unikernel => &mut self.unikernel,
        }
    }
}

/// Single RW-lock guarding all per-backend sets (spec §5: "single RW-lock;
/// all mutations exclusive, lookups shared").
pub struct RoutingRegistry {
    stores: RwLock<Stores>,
}

impl RoutingRegistry {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(Stores::default()),
        }
    }

    /// Returns the owning backend, or `None` meaning "hypervisor by default".
    pub async fn get_runtime(&self, id: &str) -> Option<Backend> {
        let stores = self.stores.read().await;
        PROBE_ORDER
            .into_iter()
            .find(|&backend| stores.store_for(backend).contains(id))
    }

    pub async fn has(&self, id: &str, backend: Backend) -> bool {
        self.stores.read().await.store_for(backend).contains(id)
    }

    /// An id is present in at most one backend's set at any moment: adding to
    /// a new backend removes it from every other store first.
    pub async fn add(&self, id: &str, backend: Backend) {
        let mut stores = self.stores.write().await;
        for other in PROBE_ORDER {
            if other != backend {
                stores.store_for_mut(other).remove(id);
            }
        }
        stores.store_for_mut(backend).insert(id.to_string());
    }

    pub async fn remove(&self, id: &str, backend: Backend) {
        self.stores.write().await.store_for_mut(backend).remove(id);
    }
}

impl Default for RoutingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_id_resolves_to_hypervisor_default() {
        let reg = RoutingRegistry::new();
        assert_eq!(reg.get_runtime("unknown").await, None);
    }

    #[tokio::test]
    async fn add_then_remove_clears_lookup() {
        let reg = RoutingRegistry::new();
        reg.add("sbx-1", Backend::Privileged).await;
        assert_eq!(reg.get_runtime("sbx-1").await, Some(Backend::Privileged));
        assert!(reg.has("sbx-1", Backend::Privileged).await);

        reg.remove("sbx-1", Backend::Privileged).await;
        assert_eq!(reg.get_runtime("sbx-1").await, None);
        assert!(!reg.has("sbx-1", Backend::Privileged).await);
    }

    #[tokio::test]
    async fn id_present_in_at_most_one_backend() {
        let reg = RoutingRegistry::new();
        reg.add("sbx-1", Backend::Privileged).await;
        reg.add("sbx-1", Backend::Unikernel).await;

        assert!(!reg.has("sbx-1", Backend::Privileged).await);
        assert!(reg.has("sbx-1", Backend::Unikernel).await);
        assert_eq!(reg.get_runtime("sbx-1").await, Some(Backend::Unikernel));
    }
}
