//! Once-per-process model loading shared by every pipeline.
//!
//! The first caller runs the loader while concurrent callers block on a condvar
//! and receive the same outcome. A failed load leaves the slot idle so the next
//! request tries again. The mutex is never held while the loader runs, which
//! keeps [`LazyModel::snapshot`] cheap even during a slow load.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::PipelineError;

enum Phase<M> {
    Idle,
    Loading,
    Ready(Arc<M>),
}

struct Slot<M> {
    phase: Phase<M>,
    /// Completed load attempts, successful or not. Waiters use it to detect
    /// that the load they were waiting on has finished.
    attempts: u64,
    last_error: Option<String>,
    loaded_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a [`LazyModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSnapshot {
    pub loaded: bool,
    pub loading: bool,
    pub last_error: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

pub struct LazyModel<M> {
    pipeline_id: String,
    slot: Mutex<Slot<M>>,
    changed: Condvar,
}

impl<M> LazyModel<M> {
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            slot: Mutex::new(Slot {
                phase: Phase::Idle,
                attempts: 0,
                last_error: None,
                loaded_at: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<M>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the resident model without triggering a load.
    pub fn get(&self) -> Option<Arc<M>> {
        match &self.lock().phase {
            Phase::Ready(model) => Some(Arc::clone(model)),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        let slot = self.lock();
        LoadSnapshot {
            loaded: matches!(slot.phase, Phase::Ready(_)),
            loading: matches!(slot.phase, Phase::Loading),
            last_error: slot.last_error.clone(),
            loaded_at: slot.loaded_at,
        }
    }

    /// Returns the model, running `load` if nothing is resident yet.
    ///
    /// At most one `load` runs at a time. Callers that arrive mid-load wait for it
    /// and get either the freshly loaded model or an `Unavailable` error carrying
    /// the loader's failure message.
    pub fn get_or_load<F>(&self, load: F) -> Result<Arc<M>, PipelineError>
    where
        F: FnOnce() -> Result<M, PipelineError>,
    {
        let mut slot = self.lock();
        loop {
            match &slot.phase {
                Phase::Ready(model) => return Ok(Arc::clone(model)),
                Phase::Idle => break,
                Phase::Loading => {
                    let seen = slot.attempts;
                    while matches!(slot.phase, Phase::Loading) && slot.attempts == seen {
                        slot = self
                            .changed
                            .wait(slot)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                    if slot.attempts != seen && !matches!(slot.phase, Phase::Ready(_)) {
                        let reason = slot
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "model load failed".to_string());
                        return Err(PipelineError::unavailable(&self.pipeline_id, reason));
                    }
                }
            }
        }
        slot.phase = Phase::Loading;
        drop(slot);

        let mut guard = LoadGuard {
            model: self,
            armed: true,
        };
        let outcome = load();
        guard.armed = false;

        let mut slot = self.lock();
        slot.attempts += 1;
        let result = match outcome {
            Ok(model) => {
                let model = Arc::new(model);
                slot.phase = Phase::Ready(Arc::clone(&model));
                slot.last_error = None;
                slot.loaded_at = Some(Utc::now());
                info!(pipeline = %self.pipeline_id, "model loaded");
                Ok(model)
            }
            Err(err) => {
                let reason = match &err {
                    PipelineError::Unavailable { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                warn!(pipeline = %self.pipeline_id, error = %reason, "model load failed");
                slot.phase = Phase::Idle;
                slot.last_error = Some(reason);
                Err(err)
            }
        };
        drop(slot);
        self.changed.notify_all();
        result
    }
}

/// Resets a `Loading` slot if the loader unwinds, so waiters are released
/// instead of blocking forever.
struct LoadGuard<'a, M> {
    model: &'a LazyModel<M>,
    armed: bool,
}

impl<M> Drop for LoadGuard<'_, M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.model.lock();
        slot.attempts += 1;
        slot.phase = Phase::Idle;
        slot.last_error = Some("model loader panicked".to_string());
        drop(slot);
        self.model.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn loads_once_and_caches() {
        let lazy = LazyModel::<u32>::new("test");
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = lazy
                .get_or_load(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .unwrap();
            assert_eq!(*value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = lazy.snapshot();
        assert!(snap.loaded);
        assert!(snap.loaded_at.is_some());
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn failed_load_is_retried_on_next_call() {
        let lazy = LazyModel::<u32>::new("test");
        let err = lazy
            .get_or_load(|| Err(PipelineError::unavailable("test", "weights missing")))
            .unwrap_err();
        assert!(err.is_retryable());
        let snap = lazy.snapshot();
        assert!(!snap.loaded);
        assert_eq!(snap.last_error.as_deref(), Some("weights missing"));

        let value = lazy.get_or_load(|| Ok(3)).unwrap();
        assert_eq!(*value, 3);
        assert!(lazy.snapshot().last_error.is_none());
    }

    #[test]
    fn concurrent_callers_share_one_load() {
        let lazy = Arc::new(LazyModel::<u64>::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lazy = Arc::clone(&lazy);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    *lazy
                        .get_or_load(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(30));
                            Ok(42)
                        })
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiters_observe_the_same_failure() {
        let lazy = Arc::new(LazyModel::<u64>::new("test"));
        let loader = {
            let lazy = Arc::clone(&lazy);
            thread::spawn(move || {
                lazy.get_or_load(|| {
                    thread::sleep(Duration::from_millis(60));
                    Err(PipelineError::unavailable("test", "no weights"))
                })
            })
        };
        thread::sleep(Duration::from_millis(15));
        let waiter = {
            let lazy = Arc::clone(&lazy);
            thread::spawn(move || lazy.get_or_load(|| Ok(1)))
        };
        let first = loader.join().unwrap();
        let second = waiter.join().unwrap();
        assert!(first.is_err());
        // The waiter either saw the failure or arrived after it and loaded itself.
        match second {
            Err(PipelineError::Unavailable { reason, .. }) => assert_eq!(reason, "no weights"),
            Ok(value) => assert_eq!(*value, 1),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn panicking_loader_releases_slot() {
        let lazy = Arc::new(LazyModel::<u8>::new("test"));
        let cloned = Arc::clone(&lazy);
        let joined = thread::spawn(move || {
            let _ = cloned.get_or_load(|| panic!("boom"));
        })
        .join();
        assert!(joined.is_err());
        let snap = lazy.snapshot();
        assert!(!snap.loading);
        assert_eq!(snap.last_error.as_deref(), Some("model loader panicked"));
        assert_eq!(*lazy.get_or_load(|| Ok(5)).unwrap(), 5);
    }
}
