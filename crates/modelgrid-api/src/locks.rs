//! Async keyed locks serializing workflows.
//!
//! A deploy touches one (model, stage) slot; an undeploy removes a version
//! from every stage of its model. Deploys hold the model lock shared and
//! their slot exclusively, undeploys hold the model lock exclusively. The
//! model lock is always taken first.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type Registry<K, L> = Arc<Mutex<HashMap<K, Arc<L>>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    models: Registry<String, RwLock<()>>,
    slots: Registry<(String, String), Mutex<()>>,
}

/// Held by a deploy for the duration of its workflow.
pub struct SlotGuard {
    _slot: OwnedMutexGuard<()>,
    _model: OwnedRwLockReadGuard<()>,
}

async fn entry<K: Eq + Hash, L: Default>(registry: &Registry<K, L>, key: K) -> Arc<L> {
    registry.lock().await.entry(key).or_default().clone()
}

impl KeyedLocks {
    /// Wait for the slot of `(name, stage)`; released when the guard drops.
    pub async fn lock_slot(&self, name: &str, stage: &str) -> SlotGuard {
        let model = entry(&self.models, name.to_string()).await.read_owned().await;
        let slot = entry(&self.slots, (name.to_string(), stage.to_string()))
            .await
            .lock_owned()
            .await;
        SlotGuard {
            _slot: slot,
            _model: model,
        }
    }

    /// Wait until no workflow touches any stage of `name`.
    pub async fn lock_model(&self, name: &str) -> OwnedRwLockWriteGuard<()> {
        entry(&self.models, name.to_string()).await.write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    /// Spawn `acquire` and report whether it got through while `held` is alive.
    async fn blocked_while_held<G, F>(held: G, acquire: F) -> bool
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let entered = Arc::new(AtomicBool::new(false));
        let task = {
            let entered = entered.clone();
            tokio::spawn(async move {
                let _guard = acquire.await;
                entered.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let blocked = !entered.load(Ordering::SeqCst);
        drop(held);
        task.await.unwrap();
        assert!(entered.load(Ordering::SeqCst));
        blocked
    }

    #[tokio::test]
    async fn same_slot_waits_for_the_holder() {
        let locks = KeyedLocks::default();
        let held = locks.lock_slot("iris", "staging").await;
        let other = locks.clone();
        let waiter = async move { other.lock_slot("iris", "staging").await };
        assert!(blocked_while_held(held, waiter).await);
    }

    #[tokio::test]
    async fn other_stages_proceed() {
        let locks = KeyedLocks::default();
        let _staging = locks.lock_slot("iris", "staging").await;
        tokio::time::timeout(Duration::from_secs(1), locks.lock_slot("iris", "production"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn model_lock_waits_for_deploys_in_any_stage() {
        let locks = KeyedLocks::default();
        let held = locks.lock_slot("iris", "production").await;
        let other = locks.clone();
        let waiter = async move { other.lock_model("iris").await };
        assert!(blocked_while_held(held, waiter).await);
    }

    #[tokio::test]
    async fn deploys_wait_for_the_model_lock() {
        let locks = KeyedLocks::default();
        let held = locks.lock_model("iris").await;
        let other = locks.clone();
        let waiter = async move { other.lock_slot("iris", "staging").await };
        assert!(blocked_while_held(held, waiter).await);
    }

    #[tokio::test]
    async fn other_models_proceed() {
        let locks = KeyedLocks::default();
        let _iris = locks.lock_model("iris").await;
        tokio::time::timeout(Duration::from_secs(1), locks.lock_slot("fraud", "staging"))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), locks.lock_model("fraud"))
            .await
            .unwrap();
    }
}
