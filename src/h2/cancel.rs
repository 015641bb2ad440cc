//! Caller-driven cancellation
//!
//! A [`CancelToken`] is handed to blocking operations. Cancelling it wakes
//! every registered waiter; each waiter rechecks [`CancelToken::is_cancelled`]
//! after waking.

use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

/// Cloneable cancellation handle
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancel and run every registered callback
    ///
    /// Callbacks run on the calling thread, outside the registry lock.
    pub fn cancel(&self) {
        let callbacks = {
            let mut callbacks = match self.inner.callbacks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *callbacks)
        };
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Register a wake-up for cancellation
    ///
    /// When the token is already cancelled the callback is not run; callers
    /// check [`is_cancelled`](Self::is_cancelled) after registering. The
    /// callback is removed when the returned guard drops.
    pub fn on_cancel<F>(&self, callback: F) -> CancelGuard
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut callbacks = match self.inner.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !self.inner.cancelled.load(Ordering::Acquire) {
            callbacks.push((id, Box::new(callback)));
        }
        CancelGuard {
            token: self.clone(),
            id,
        }
    }

    /// Cancellation as a channel for `select!`
    ///
    /// The receiver yields once the token is cancelled, including when it
    /// already was.
    pub fn channel(&self) -> (Receiver<()>, CancelGuard) {
        let (tx, rx) = bounded(1);
        let wake = tx.clone();
        let guard = self.on_cancel(move || {
            let _ = wake.try_send(());
        });
        if self.is_cancelled() {
            let _ = tx.try_send(());
        }
        (rx, guard)
    }
}

/// Deregisters a cancellation callback on drop
pub struct CancelGuard {
    token: CancelToken,
    id: u64,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut callbacks = match self.token.inner.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        callbacks.retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Condvar, Mutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _guard = token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_guard_deregisters() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        drop(token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_wakes_condvar_waiter() {
        let token = CancelToken::new();
        let pair = Arc::new((Mutex::new(()), Condvar::new()));

        let waiter = {
            let token = token.clone();
            let pair = pair.clone();
            thread::spawn(move || {
                let wake = pair.clone();
                let _guard = token.on_cancel(move || {
                    let _lock = wake.0.lock().unwrap();
                    wake.1.notify_all();
                });
                let mut lock = pair.0.lock().unwrap();
                while !token.is_cancelled() {
                    lock = pair.1.wait(lock).unwrap();
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        waiter.join().unwrap();
    }

    #[test]
    fn test_channel_fires_for_late_and_early_cancel() {
        let token = CancelToken::new();
        let (rx, _guard) = token.channel();
        assert!(rx.try_recv().is_err());
        token.cancel();
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());

        let (rx, _guard) = token.channel();
        assert!(rx.try_recv().is_ok());
    }
}
