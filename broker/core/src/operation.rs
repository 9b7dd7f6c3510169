//! Operation tokens, per-instance locks, and the pool of background operations.

use crate::error::Error;
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::{
    future::Future,
    sync::{Arc, Weak},
};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, Instrument};

pub const PROVISION: &str = "provision-";
pub const DEPROVISION: &str = "deprovision-";
pub const BIND: &str = "bind-";

/// Generates a fresh operation token: the prefix followed by the hex encoding of the current UTC
/// time in nanoseconds (little-endian) and two random bytes.
pub fn token(prefix: &str) -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut bytes = [0u8; 10];
    bytes[..8].copy_from_slice(&nanos.to_le_bytes());
    rand::thread_rng().fill(&mut bytes[8..]);

    let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("{prefix}{hex}")
}

/// Serializes verbs that mutate the same instance.
///
/// Locks are created on demand and dropped once no caller holds or awaits them.
#[derive(Debug, Default)]
pub struct InstanceLocks(Mutex<HashMap<String, Weak<AsyncMutex<()>>>>);

/// Background operations, keyed by instance ID (or `instance/binding` for binds).
///
/// Starting an operation under a key cancels the operation it replaces and waits for it to stop
/// before running.
#[derive(Clone, Debug, Default)]
pub struct Tasks(Arc<Mutex<HashMap<String, Entry>>>);

#[derive(Debug)]
struct Entry {
    token: String,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// An operation that has been registered but not yet run.
#[must_use]
pub struct Registration {
    cancel: Cancel,
    prior: Stopped,
    running: Running,
}

/// Marks an operation as stopped when dropped.
struct Running {
    key: String,
    token: String,
    done: watch::Sender<bool>,
    tasks: Arc<Mutex<HashMap<String, Entry>>>,
}

/// Observed by an operation between its steps.
#[derive(Clone, Debug)]
pub struct Cancel {
    token: String,
    rx: Option<watch::Receiver<bool>>,
}

/// Completes once every cancelled operation has stopped.
#[derive(Debug, Default)]
#[must_use]
pub struct Stopped(Vec<watch::Receiver<bool>>);

// === impl InstanceLocks ===

impl InstanceLocks {
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.0.lock();
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(id).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(AsyncMutex::new(()));
                    locks.insert(id.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }
}

// === impl Tasks ===

impl Tasks {
    /// Registers an operation under `key`, cancelling the operation it replaces.
    ///
    /// The operation counts as running until the returned registration (or the task it is
    /// spawned onto) is dropped.
    pub fn register(&self, key: String, token: String) -> Registration {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let prior = self.0.lock().insert(
            key.clone(),
            Entry {
                token: token.clone(),
                cancel: cancel_tx,
                done: done_rx,
            },
        );
        let prior = Stopped(prior.into_iter().map(|prior| prior.cancel(&key)).collect());
        Registration {
            cancel: Cancel {
                token: token.clone(),
                rx: Some(cancel_rx),
            },
            prior,
            running: Running {
                key,
                token,
                done: done_tx,
                tasks: self.0.clone(),
            },
        }
    }

    /// Spawns `operation`, replacing any operation running under `key`.
    pub fn spawn<F, Fut>(&self, key: String, token: String, operation: F)
    where
        F: FnOnce(Cancel) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(key, token).spawn(operation)
    }

    pub fn cancel(&self, key: &str) -> Stopped {
        let entry = self.0.lock().remove(key);
        Stopped(entry.into_iter().map(|e| e.cancel(key)).collect())
    }

    /// Cancels the operation under `id` and every binding operation of that instance.
    pub fn cancel_instance(&self, id: &str) -> Stopped {
        let prefix = format!("{id}/");
        let mut stopped = Vec::new();
        self.0.lock().retain(|key, entry| {
            if key == id || key.starts_with(&prefix) {
                debug!(%key, token = %entry.token, "Cancelling operation");
                entry.cancel.send_replace(true);
                stopped.push(entry.done.clone());
                return false;
            }
            true
        });
        Stopped(stopped)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

// === impl Registration ===

impl Registration {
    pub fn cancel(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Also waits for `stopped` before the operation runs.
    pub fn after(mut self, stopped: Stopped) -> Self {
        self.prior.0.extend(stopped.0);
        self
    }

    /// Runs `operation` on a background task once the operations it replaced have stopped.
    pub fn spawn<F, Fut>(self, operation: F)
    where
        F: FnOnce(Cancel) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Self {
            cancel,
            prior,
            running,
        } = self;
        let span = tracing::info_span!("operation", key = %running.key, token = %running.token);
        let operation = operation(cancel);
        tokio::spawn(
            async move {
                prior.wait().await;
                operation.await;
                drop(running);
            }
            .instrument(span),
        );
    }

    /// Drives `operation` in the caller's task once the operations it replaced have stopped.
    pub async fn run<T>(self, operation: impl Future<Output = T>) -> T {
        let Self { prior, running, .. } = self;
        prior.wait().await;
        let output = operation.await;
        drop(running);
        output
    }
}

// === impl Running ===

impl Drop for Running {
    fn drop(&mut self) {
        self.done.send_replace(true);
        let mut tasks = self.tasks.lock();
        if tasks.get(&self.key).map_or(false, |e| e.token == self.token) {
            tasks.remove(&self.key);
        }
    }
}

// === impl Entry ===

impl Entry {
    fn cancel(self, key: &str) -> watch::Receiver<bool> {
        debug!(%key, token = %self.token, "Cancelling operation");
        self.cancel.send_replace(true);
        self.done
    }
}

// === impl Stopped ===

impl Stopped {
    pub async fn wait(self) {
        for mut done in self.0 {
            // A dropped sender means the task is gone.
            let _ = done.wait_for(|done| *done).await;
        }
    }
}

pub fn binding_key(instance_id: &str, binding_id: &str) -> String {
    format!("{instance_id}/{binding_id}")
}

// === impl Cancel ===

impl Cancel {
    /// A flag for operations that run inline and cannot be superseded.
    pub fn never() -> Self {
        Self {
            token: String::new(),
            rx: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map_or(false, |rx| *rx.borrow())
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Superseded(self.token.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn tokens() {
        let a = token(PROVISION);
        let b = token(PROVISION);
        assert!(a.starts_with("provision-"));
        assert_eq!(a.len(), "provision-".len() + 20);
        assert!(a["provision-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn locks_serialize_same_instance() {
        let locks = InstanceLocks::default();
        let guard = locks.lock("i1").await;

        // A different instance is not blocked.
        let _other = tokio::time::timeout(Duration::from_secs(1), locks.lock("i2"))
            .await
            .expect("other instance must not block");

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.lock("i1")).await;
        assert!(blocked.is_err(), "same instance must block");

        drop(guard);
        let _guard = tokio::time::timeout(Duration::from_secs(1), locks.lock("i1"))
            .await
            .expect("lock must be released");
    }

    #[tokio::test]
    async fn new_operation_cancels_prior() {
        let tasks = Tasks::default();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();

        tasks.spawn("i1".to_string(), "provision-1".to_string(), |cancel| async move {
            let _ = release_rx.await;
            let _ = done_tx.send(cancel.check().is_err());
        });
        assert_eq!(tasks.len(), 1);

        let (next_tx, mut next_rx) = oneshot::channel();
        tasks.spawn("i1".to_string(), "deprovision-2".to_string(), |cancel| async move {
            let _ = next_tx.send(cancel.is_cancelled());
        });

        // The replacement waits for the prior operation to stop.
        let early = tokio::time::timeout(Duration::from_millis(50), &mut next_rx).await;
        assert!(early.is_err(), "replacement must not run yet");

        let _ = release_tx.send(());
        assert!(done_rx.await.expect("task must report"));
        assert!(!next_rx.await.expect("replacement must run"));
    }

    #[tokio::test]
    async fn cancel_instance_includes_bindings() {
        let tasks = Tasks::default();
        let (tx, rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        tasks.spawn(binding_key("i1", "b1"), "bind-1".to_string(), |cancel| async move {
            let _ = release_rx.await;
            let _ = tx.send(cancel.is_cancelled());
        });

        let stopped = tasks.cancel_instance("i1");
        assert!(tasks.is_empty());
        let _ = release_tx.send(());
        assert!(rx.await.expect("task must report"));
        tokio::time::timeout(Duration::from_secs(1), stopped.wait())
            .await
            .expect("task must stop");
    }

    #[tokio::test]
    async fn inline_operations_are_cancellable() {
        let tasks = Tasks::default();
        let registration = tasks.register("i1".to_string(), "provision-1".to_string());
        let cancel = registration.cancel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let inline = tokio::spawn(registration.run(async move {
            let _ = release_rx.await;
            cancel.check()
        }));
        assert_eq!(tasks.len(), 1);

        let stopped = tasks.cancel_instance("i1");
        assert!(tasks.is_empty());
        let mut stopped = Box::pin(stopped.wait());
        let early = tokio::time::timeout(Duration::from_millis(50), &mut stopped).await;
        assert!(early.is_err(), "inline operation must be awaited");

        let _ = release_tx.send(());
        let result = inline.await.expect("inline operation must complete");
        assert!(matches!(result, Err(Error::Superseded(_))));
        tokio::time::timeout(Duration::from_secs(1), stopped)
            .await
            .expect("inline operation must stop");
    }

    #[test]
    fn never_cancelled() {
        assert!(Cancel::never().check().is_ok());
    }
}
