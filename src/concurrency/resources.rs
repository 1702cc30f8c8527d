use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Identity of one logical operation holding named resources.
///
/// Async tasks hop between threads, so ownership is tracked by an explicit id rather
/// than by thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(u64);

impl HolderId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HolderId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Holder plus waiters; the slot is evicted when this drops to zero.
    users: usize,
    holder: Option<(HolderId, OwnedMutexGuard<()>)>,
}

impl Slot {
    fn new() -> Self {
        Self {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            users: 0,
            holder: None,
        }
    }
}

/// Named exclusive resources, created on first use and evicted when idle.
///
/// Callers refer to resources by name only; a resource's lock is never cached across
/// suspension points because the slot may be evicted and recreated in between.
#[derive(Default)]
pub struct ResourceRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Decrements a slot's user count unless disarmed. Keeps the count right when an
/// `acquire` future times out or is dropped mid-wait.
struct PendingUse<'a> {
    registry: &'a ResourceRegistry,
    name: &'a str,
    armed: bool,
}

impl Drop for PendingUse<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.registry.slots.lock();
            ResourceRegistry::forget_user(&mut slots, self.name);
        }
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn forget_user(slots: &mut HashMap<String, Slot>, name: &str) {
        let evict = match slots.get_mut(name) {
            Some(slot) => {
                slot.users = slot.users.saturating_sub(1);
                slot.users == 0
            }
            None => false,
        };
        if evict {
            slots.remove(name);
            tracing::trace!("Evicted idle resource {}", name);
        }
    }

    /// Wait until `name` is free, then hold it for `holder`.
    ///
    /// A holder that already holds the resource gets it again immediately. With a
    /// timeout, gives up and returns false once it elapses.
    pub async fn acquire(&self, name: &str, holder: HolderId, timeout: Option<Duration>) -> bool {
        let lock = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(name.to_string()).or_insert_with(Slot::new);
            if matches!(&slot.holder, Some((current, _)) if *current == holder) {
                return true;
            }
            slot.users += 1;
            Arc::clone(&slot.lock)
        };
        let mut pending = PendingUse {
            registry: self,
            name,
            armed: true,
        };

        let guard = match timeout {
            Some(limit) => tokio::time::timeout(limit, lock.lock_owned()).await.ok(),
            None => Some(lock.lock_owned().await),
        };
        let Some(guard) = guard else {
            tracing::debug!("Timed out waiting for resource {} ({})", name, holder);
            return false;
        };

        let mut slots = self.slots.lock();
        match slots.get_mut(name) {
            Some(slot) => {
                slot.holder = Some((holder, guard));
                pending.armed = false;
                tracing::trace!("Resource {} acquired by {}", name, holder);
                true
            }
            None => false,
        }
    }

    /// Release `name` if `holder` holds it. Anything else is a no-op.
    pub fn release(&self, name: &str, holder: HolderId) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(name) else {
            return;
        };
        if !matches!(&slot.holder, Some((current, _)) if *current == holder) {
            return;
        }
        slot.holder = None;
        tracing::trace!("Resource {} released by {}", name, holder);
        Self::forget_user(&mut slots, name);
    }

    /// Acquire `name` for a fresh holder, releasing it when the lease is dropped.
    pub async fn lease(self: &Arc<Self>, name: &str, timeout: Option<Duration>) -> Option<ResourceLease> {
        let holder = HolderId::next();
        if !self.acquire(name, holder, timeout).await {
            return None;
        }
        Some(ResourceLease {
            registry: Arc::clone(self),
            name: name.to_string(),
            holder,
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.slots
            .lock()
            .get(name)
            .is_some_and(|slot| slot.holder.is_some())
    }

    /// Number of live (held or awaited) resources.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A held resource, released on drop.
pub struct ResourceLease {
    registry: Arc<ResourceRegistry>,
    name: String,
    holder: HolderId,
}

impl ResourceLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.registry.release(&self.name, self.holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let registry = ResourceRegistry::new();
        let holder = HolderId::next();

        assert!(registry.acquire("proj/CheckStatus", holder, None).await);
        assert!(registry.is_held("proj/CheckStatus"));

        registry.release("proj/CheckStatus", holder);
        assert!(!registry.is_held("proj/CheckStatus"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reacquire_by_same_holder() {
        let registry = ResourceRegistry::new();
        let holder = HolderId::next();
        assert!(registry.acquire("r", holder, None).await);
        assert!(
            registry
                .acquire("r", holder, Some(Duration::from_millis(10)))
                .await
        );
        registry.release("r", holder);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let registry = ResourceRegistry::new();
        let owner = HolderId::next();
        let other = HolderId::next();

        assert!(registry.acquire("r", owner, None).await);
        registry.release("r", other);
        registry.release("missing", other);
        assert!(registry.is_held("r"));
    }

    #[tokio::test]
    async fn test_timeout_while_held() {
        let registry = ResourceRegistry::new();
        let owner = HolderId::next();
        assert!(registry.acquire("r", owner, None).await);

        let acquired = registry
            .acquire("r", HolderId::next(), Some(Duration::from_millis(20)))
            .await;
        assert!(!acquired);

        // The timed-out waiter must not keep the slot alive
        registry.release("r", owner);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lease_releases_on_drop() {
        let registry = Arc::new(ResourceRegistry::new());
        {
            let lease = registry.lease("r", None).await.unwrap();
            assert_eq!(lease.name(), "r");
            assert!(registry.is_held("r"));
        }
        assert!(!registry.is_held("r"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_gets_resource_after_release() {
        let registry = Arc::new(ResourceRegistry::new());
        let owner = HolderId::next();
        assert!(registry.acquire("r", owner, None).await);

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let holder = HolderId::next();
                let ok = registry
                    .acquire("r", holder, Some(Duration::from_secs(1)))
                    .await;
                (ok, holder)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.release("r", owner);

        let (ok, holder) = waiter.await.unwrap();
        assert!(ok);
        assert!(registry.is_held("r"));
        registry.release("r", holder);
        assert!(registry.is_empty());
    }
}
