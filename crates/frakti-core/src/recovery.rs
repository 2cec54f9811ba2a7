//! Recovery (C10, spec §4.10): folds checkpoint-only sandbox ids into a
//! `ListPodSandbox(nil)` result as NOTREADY stubs, so the kubelet can
//! reconcile sandboxes whose live backend state was lost.

use crate::checkpoint::CheckpointStore;
use crate::types::{Sandbox, SandboxCheckpoint, SandboxState};
use log::warn;
use std::collections::HashSet;

/// Given the ids already present in a live listing, return NOTREADY stub
/// `Sandbox` entries for every checkpoint id the live listing is missing.
/// Unreadable/corrupt checkpoints are skipped with a warning rather than
/// failing the whole list (consistent with the shim's "never fail a list
/// over one bad entry" propagation policy).
pub async fn notready_stubs(
    store: &dyn CheckpointStore,
    live_ids: &HashSet<String>,
) -> Vec<Sandbox> {
    let mut stubs = Vec::new();
    let keys = match store.list().await {
        Ok(keys) => keys,
        Err(e) => {
            warn!("recovery: failed to list checkpoint store: {e}");
            return stubs;
        }
    };

    for id in keys {
        if live_ids.contains(&id) {
            continue;
        }
        let blob = match store.get(&id).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!("recovery: checkpoint {id} unreadable, skipping: {e}");
                continue;
            }
        };
        let checkpoint: SandboxCheckpoint = match serde_json::from_slice(&blob) {
            Ok(c) => c,
            Err(e) => {
                warn!("recovery: checkpoint {id} malformed, skipping: {e}");
                continue;
            }
        };
        stubs.push(Sandbox {
            id: id.clone(),
            name: checkpoint.name,
            namespace: checkpoint.namespace,
            pod_uid: String::new(),
            attempt: 0,
            labels: Default::default(),
            annotations: Default::default(),
            net_ns_path: checkpoint.netnspath,
            state: SandboxState::NotReady,
            created_at_ns: 0,
            ip: None,
            owning_backend: None,
        });
    }
    stubs
}
