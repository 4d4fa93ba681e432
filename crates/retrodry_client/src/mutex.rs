//! Cooperative FIFO mutex.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct State {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// An async, FIFO, non-reentrant mutual-exclusion lock.
///
/// [`acquire`](FifoMutex::acquire) suspends until the lock is free and
/// returns a guard; dropping the guard hands the lock to the
/// longest-waiting caller. Release is tied to the guard, so releasing a
/// lock that was never acquired cannot be written. A caller that stops
/// waiting (its future is dropped) gives up its place; if the lock was
/// already handed to it, it is passed on.
///
/// Acquiring twice from the same flow deadlocks.
///
/// # Example
///
/// ```
/// use retrodry_client::FifoMutex;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mutex = FifoMutex::new();
/// {
///     let _guard = mutex.acquire().await;
///     assert!(mutex.is_locked());
/// }
/// assert!(!mutex.is_locked());
/// # }
/// ```
#[derive(Debug, Default)]
pub struct FifoMutex {
    state: Mutex<State>,
}

impl FifoMutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lock is free and takes it.
    pub async fn acquire(&self) -> FifoGuard<'_> {
        loop {
            let receiver = {
                let mut state = self.state.lock();
                if !state.locked {
                    state.locked = true;
                    return FifoGuard { mutex: self };
                }
                let (sender, receiver) = oneshot::channel();
                state.waiters.push_back(sender);
                receiver
            };
            let mut waiter = Waiter {
                mutex: self,
                receiver: Some(receiver),
            };
            if waiter.wait().await {
                return FifoGuard { mutex: self };
            }
        }
    }

    /// Takes the lock if it is free.
    pub fn try_acquire(&self) -> Option<FifoGuard<'_>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(FifoGuard { mutex: self })
    }

    /// Returns true while a guard is alive.
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of suspended callers.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Hands the lock to the oldest live waiter, or unlocks.
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some(next) = state.waiters.pop_front() {
            if next.send(()).is_ok() {
                return;
            }
        }
        state.locked = false;
    }
}

/// Holds a [`FifoMutex`]; dropping it releases the lock.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct FifoGuard<'a> {
    mutex: &'a FifoMutex,
}

impl Drop for FifoGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

/// A queued acquire; passes the lock on if dropped after being handed it.
struct Waiter<'a> {
    mutex: &'a FifoMutex,
    receiver: Option<oneshot::Receiver<()>>,
}

impl Waiter<'_> {
    /// Returns true once the lock was handed over.
    async fn wait(&mut self) -> bool {
        let Some(receiver) = self.receiver.as_mut() else {
            return false;
        };
        let handed = receiver.await.is_ok();
        self.receiver = None;
        handed
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if receiver.try_recv().is_ok() {
                self.mutex.release();
            }
        }
    }
}
