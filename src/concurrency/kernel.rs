use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::Notify;

/// Reentrant lock scoping a component's check-then-act sequences.
///
/// Closures run while the lock is held; they may call back into the same
/// `CriticalSection` from the same thread. Never hold it across an `.await`.
#[derive(Debug, Default)]
pub struct CriticalSection {
    lock: ReentrantMutex<()>,
}

impl CriticalSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` under the lock.
    pub fn thread_safe<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }

    /// Lazily materialize a value, running `init` at most once across racing callers.
    ///
    /// `get` is first tried without the lock; only on a miss is the lock taken, `get`
    /// re-checked, and `init` run if the value is still missing.
    ///
    /// # Returns
    /// Whatever `get` yields after initialization (None only if `init` did not
    /// produce a value).
    pub fn exclusive_init<T>(&self, get: impl Fn() -> Option<T>, init: impl FnOnce()) -> Option<T> {
        if let Some(value) = get() {
            return Some(value);
        }
        let _guard = self.lock.lock();
        if let Some(value) = get() {
            return Some(value);
        }
        init();
        get()
    }

    /// Evaluate `test` and run `action` (on true) or `else_action` (on false), all
    /// while holding the lock.
    pub fn atomic(
        &self,
        test: impl FnOnce() -> bool,
        action: impl FnOnce(),
        else_action: impl FnOnce(),
    ) -> bool {
        let _guard = self.lock.lock();
        let success = test();
        if success {
            action();
        } else {
            else_action();
        }
        success
    }
}

/// State of an [`ExclusiveValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveState {
    Empty,
    Held,
    Released,
}

#[derive(Debug)]
struct Slot<T> {
    state: ExclusiveState,
    value: Option<T>,
}

/// A value slot that at most one owner can hold at a time.
///
/// `acquire` parks while another owner holds the slot; `release` hands it to the next
/// waiter. The last value stays readable through `get` after release. Each transition
/// takes the lock exactly once.
#[derive(Debug)]
pub struct ExclusiveValue<T> {
    slot: Mutex<Slot<T>>,
    released: Notify,
}

impl<T: Clone> ExclusiveValue<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: ExclusiveState::Empty,
                value: None,
            }),
            released: Notify::new(),
        }
    }

    pub fn state(&self) -> ExclusiveState {
        self.slot.lock().state
    }

    /// Most recent value, held or not.
    pub fn get(&self) -> Option<T> {
        self.slot.lock().value.clone()
    }

    /// Take the slot if nobody holds it; gives the value back otherwise.
    pub fn try_acquire(&self, value: T) -> Result<(), T> {
        let mut slot = self.slot.lock();
        if slot.state == ExclusiveState::Held {
            return Err(value);
        }
        slot.state = ExclusiveState::Held;
        slot.value = Some(value);
        Ok(())
    }

    /// Wait until the slot is free, then hold it with `value`.
    pub async fn acquire(&self, value: T) {
        let mut pending = value;
        loop {
            let notified = self.released.notified();
            match self.try_acquire(pending) {
                Ok(()) => return,
                Err(value) => pending = value,
            }
            notified.await;
        }
    }

    /// Give up the slot and wake one waiter. No-op unless held.
    pub fn release(&self) {
        let mut slot = self.slot.lock();
        if slot.state != ExclusiveState::Held {
            return;
        }
        slot.state = ExclusiveState::Released;
        drop(slot);
        self.released.notify_one();
    }
}

impl<T: Clone> Default for ExclusiveValue<T> {
    fn default() -> Self {
        Self::new()
    }
}
