use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutex: one lock per stack name.
#[derive(Debug, Default)]
pub struct StackLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StackLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `stack`. Other stacks are unaffected.
    ///
    /// Entries nobody holds or waits on are dropped here, so the table only
    /// tracks stacks in use.
    pub async fn acquire(&self, stack: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(stack.to_owned()).or_default())
        };
        tracing::debug!(%stack, "waiting for stack lock");
        lock.lock_owned().await
    }
}
