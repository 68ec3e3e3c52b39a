//! Running adapter slots, at most one per resource identity
//!
//! Every start for an identity first waits for the previous task of that
//! identity to stop (cancel, grace period, then abort). The chain is built
//! inside the spawned task, so the owner loop never blocks on a teardown.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::BackoffPolicy;
use crate::crd::ResourceKey;
use crate::error::{Error, Result};
use crate::reconcilers::{Running, SlotState};

/// Future driving one adapter until its token is cancelled
pub type AdapterFuture = BoxFuture<'static, Result<()>>;

/// Reported when an adapter task ends on its own
#[derive(Debug)]
pub struct AdapterExit {
    pub key: ResourceKey,
    pub task_id: u64,
    pub result: Result<()>,
}

struct AdapterTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl AdapterTask {
    /// Cancel, wait up to `grace`, then abort
    async fn stop(mut self, key: ResourceKey, grace: Duration) {
        self.token.cancel();
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => debug!(name = %key.name, namespace = %key.namespace, "Adapter stopped"),
            Ok(Err(e)) if e.is_panic() => {
                error!(name = %key.name, namespace = %key.namespace, "Adapter task panicked")
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    name = %key.name,
                    namespace = %key.namespace,
                    grace_secs = grace.as_secs(),
                    "Adapter did not stop within grace period, aborting"
                );
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

impl Drop for AdapterTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct Slot {
    generation: String,
    state: SlotState,
    task: Option<(u64, AdapterTask)>,
    failures: u32,
}

/// Owns every adapter task; driven only by the controller's owner loop
pub struct AdapterRegistry {
    slots: BTreeMap<ResourceKey, Slot>,
    draining: BTreeMap<ResourceKey, JoinHandle<()>>,
    exits: mpsc::UnboundedSender<AdapterExit>,
    grace: Duration,
    restart: BackoffPolicy,
    next_id: u64,
}

impl AdapterRegistry {
    pub fn new(exits: mpsc::UnboundedSender<AdapterExit>, grace: Duration) -> Self {
        Self {
            slots: BTreeMap::new(),
            draining: BTreeMap::new(),
            exits,
            grace,
            restart: BackoffPolicy::restart(),
            next_id: 0,
        }
    }

    pub fn with_restart_policy(mut self, restart: BackoffPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Current slots, for [`crate::reconcilers::plan`]
    pub fn snapshot(&self) -> Vec<Running> {
        self.slots
            .iter()
            .map(|(key, slot)| Running {
                key: key.clone(),
                generation: slot.generation.clone(),
                state: slot.state,
            })
            .collect()
    }

    /// Number of live adapter tasks
    pub fn active(&self) -> usize {
        self.slots.values().filter(|s| s.task.is_some()).count()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn generation(&self, key: &ResourceKey) -> Option<&str> {
        self.slots.get(key).map(|s| s.generation.as_str())
    }

    /// Start an adapter for `key`, replacing whatever runs for it now.
    ///
    /// `run` is only invoked after the previous task for `key` has fully
    /// stopped.
    pub fn start<F>(&mut self, key: ResourceKey, generation: String, run: F)
    where
        F: FnOnce(CancellationToken) -> AdapterFuture + Send + 'static,
    {
        self.prune_draining();

        let failures = match self.slots.get(&key) {
            Some(slot) if slot.generation == generation => slot.failures,
            _ => 0,
        };
        let previous = self.detach(&key);

        self.next_id += 1;
        let task_id = self.next_id;
        let token = CancellationToken::new();
        let exits = self.exits.clone();
        let task_key = key.clone();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if task_token.is_cancelled() {
                return;
            }
            let result = match AssertUnwindSafe(run(task_token.clone())).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(Error::AdapterExited("adapter panicked".to_string())),
            };
            if task_token.is_cancelled() {
                return;
            }
            let result = match result {
                Ok(()) => Err(Error::AdapterExited("adapter returned before cancellation".to_string())),
                Err(e) => Err(e),
            };
            let _ = exits.send(AdapterExit {
                key: task_key,
                task_id,
                result,
            });
        });

        self.slots.insert(
            key,
            Slot {
                generation,
                state: SlotState::Active,
                task: Some((
                    task_id,
                    AdapterTask {
                        token,
                        handle: Some(handle),
                    },
                )),
                failures,
            },
        );
    }

    /// Tear down the adapter for `key` and forget the identity
    pub fn stop(&mut self, key: &ResourceKey) {
        self.prune_draining();
        if let Some(stopping) = self.detach(key) {
            self.draining.insert(key.clone(), stopping);
        }
        self.slots.remove(key);
    }

    /// Record a failed start; returns when the next attempt is due.
    ///
    /// Any running task for `key` is torn down.
    pub fn mark_failed(&mut self, key: &ResourceKey, generation: &str, now: Instant) -> Instant {
        self.prune_draining();
        if let Some(stopping) = self.detach(key) {
            self.draining.insert(key.clone(), stopping);
        }

        let failures = match self.slots.get(key) {
            Some(slot) if slot.generation == generation => slot.failures,
            _ => 0,
        };
        let retry_at = now + self.restart.delay_for(failures);
        self.slots.insert(
            key.clone(),
            Slot {
                generation: generation.to_string(),
                state: SlotState::Failed { retry_at },
                task: None,
                failures: failures.saturating_add(1),
            },
        );
        retry_at
    }

    /// Handle an [`AdapterExit`]; `Some(generation)` if it came from the
    /// current task for its key and the slot is now failed
    pub fn handle_exit(&mut self, exit: &AdapterExit, now: Instant) -> Option<(String, Instant)> {
        let slot = self.slots.get(&exit.key)?;
        match &slot.task {
            Some((id, _)) if *id == exit.task_id => {}
            _ => return None,
        }
        let generation = slot.generation.clone();
        let retry_at = self.mark_failed(&exit.key, &generation, now);
        Some((generation, retry_at))
    }

    /// Earliest pending restart among failed slots
    pub fn next_retry(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter_map(|slot| match slot.state {
                SlotState::Failed { retry_at } => Some(retry_at),
                SlotState::Active => None,
            })
            .min()
    }

    /// Forget the restart backoff once an adapter has proven healthy
    pub fn mark_healthy(&mut self, key: &ResourceKey, generation: &str) {
        if let Some(slot) = self.slots.get_mut(key) {
            if slot.generation == generation {
                slot.failures = 0;
            }
        }
    }

    /// Stop every adapter and wait for all of them
    pub async fn shutdown(&mut self) {
        let mut stops: Vec<JoinHandle<()>> = Vec::new();
        let keys: Vec<ResourceKey> = self.slots.keys().cloned().collect();
        for key in keys {
            if let Some(stopping) = self.detach(&key) {
                stops.push(stopping);
            }
        }
        self.slots.clear();
        stops.extend(std::mem::take(&mut self.draining).into_values());

        for result in future::join_all(stops).await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Adapter stop task panicked");
                }
            }
        }
    }

    /// Begin stopping the task for `key`, returning a handle that resolves
    /// once it is gone. Includes a still-draining task from an earlier stop.
    fn detach(&mut self, key: &ResourceKey) -> Option<JoinHandle<()>> {
        let draining = self.draining.remove(key);
        let task = self
            .slots
            .get_mut(key)
            .and_then(|slot| slot.task.take())
            .map(|(_, task)| task);

        match (draining, task) {
            (None, None) => None,
            (Some(draining), None) => Some(draining),
            (draining, Some(task)) => {
                let grace = self.grace;
                let key = key.clone();
                Some(tokio::spawn(async move {
                    if let Some(draining) = draining {
                        let _ = draining.await;
                    }
                    task.stop(key, grace).await;
                }))
            }
        }
    }

    fn prune_draining(&mut self) {
        self.draining.retain(|_, handle| !handle.is_finished());
    }
}
