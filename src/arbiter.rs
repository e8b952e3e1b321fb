//! C4 — Resource Arbiter.
//!
//! Named counted semaphores for shared resources (GPU slots, external API
//! rate budgets, disk bandwidth). All-or-nothing multi-resource acquisition
//! with canonical lexicographic lock ordering avoids circular waits by
//! construction; a bipartite wait-for-graph check backstops deadlock
//! detection for callers that acquire resources one at a time outside
//! [`ResourceArbiter::acquire_all`]. Grounded on the teacher's
//! `dag/executor.rs` use of `tokio::sync::{Mutex, Semaphore}` for
//! bounded concurrency, generalized from one global semaphore to a named
//! pool of them.

use crate::error::ArbiterError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

struct Resource {
    capacity: usize,
    semaphore: Semaphore,
}

/// An acquired grant over one or more named resources. Dropping it releases
/// every permit it holds.
#[derive(Debug)]
pub struct Grant<'a> {
    _permits: Vec<SemaphorePermit<'a>>,
}

/// Tracks in-flight waiters so concurrent `acquire_all` calls can detect a
/// circular wait-for relationship before blocking forever.
#[derive(Default)]
struct WaitState {
    /// resource name -> set of resource names held by a task waiting on it
    waiting_for: HashMap<String, HashSet<String>>,
}

pub struct ResourceArbiter {
    resources: HashMap<String, Resource>,
    wait_state: Mutex<WaitState>,
}

impl ResourceArbiter {
    pub fn new(pool: HashMap<String, usize>) -> Self {
        let resources = pool
            .into_iter()
            .map(|(name, capacity)| {
                (
                    name,
                    Resource {
                        capacity,
                        semaphore: Semaphore::new(capacity),
                    },
                )
            })
            .collect();
        Self {
            resources,
            wait_state: Mutex::new(WaitState::default()),
        }
    }

    pub fn capacity(&self, name: &str) -> Option<usize> {
        self.resources.get(name).map(|r| r.capacity)
    }

    /// Acquire `requests` (resource name -> units) atomically: either every
    /// resource is granted or none are held afterward. Requests are sorted
    /// lexicographically before acquiring so two callers requesting the same
    /// resource set always lock in the same order, which rules out A-waits-
    /// for-B-waits-for-A deadlocks between calls to this method.
    pub async fn acquire_all<'a>(
        &'a self,
        requests: &[(&str, usize)],
    ) -> Result<Grant<'a>, ArbiterError> {
        for (name, units) in requests {
            let resource = self
                .resources
                .get(*name)
                .ok_or_else(|| ArbiterError::UnknownResource((*name).to_string()))?;
            if *units > resource.capacity {
                return Err(ArbiterError::Infeasible {
                    resource: (*name).to_string(),
                    requested: *units,
                    capacity: resource.capacity,
                });
            }
        }

        let mut ordered: Vec<(&str, usize)> = requests.to_vec();
        ordered.sort_by(|a, b| a.0.cmp(b.0));

        self.check_deadlock(&ordered).await?;

        let names: Vec<String> = ordered.iter().map(|(n, _)| n.to_string()).collect();
        self.mark_waiting(&names).await;

        let mut permits = Vec::with_capacity(ordered.len());
        for (name, units) in &ordered {
            let resource = self.resources.get(*name).expect("checked above");
            match resource.semaphore.acquire_many(*units as u32).await {
                Ok(permit) => permits.push(permit),
                Err(_) => {
                    self.clear_waiting(&names).await;
                    return Err(ArbiterError::Cancelled);
                }
            }
        }

        self.clear_waiting(&names).await;
        Ok(Grant { _permits: permits })
    }

    /// Records that a caller about to block is waiting on `names`, each
    /// considered to depend on every other name in the same request (since
    /// all must be held together), then looks for a cycle through already
    /// recorded waiters.
    async fn check_deadlock(&self, ordered: &[(&str, usize)]) -> Result<(), ArbiterError> {
        let state = self.wait_state.lock().await;
        let mut visiting: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = ordered.iter().map(|(n, _)| n.to_string()).collect();
        while let Some(name) = stack.pop() {
            if !visiting.insert(name.clone()) {
                return Err(ArbiterError::Deadlock(
                    visiting.into_iter().collect::<Vec<_>>(),
                ));
            }
            if let Some(deps) = state.waiting_for.get(&name) {
                for dep in deps {
                    if ordered.iter().any(|(n, _)| *n == dep.as_str()) {
                        return Err(ArbiterError::Deadlock(vec![name, dep.clone()]));
                    }
                    stack.push(dep.clone());
                }
            }
        }
        Ok(())
    }

    async fn mark_waiting(&self, names: &[String]) {
        let mut state = self.wait_state.lock().await;
        for name in names {
            let peers: HashSet<String> = names.iter().filter(|n| *n != name).cloned().collect();
            state.waiting_for.entry(name.clone()).or_default().extend(peers);
        }
    }

    async fn clear_waiting(&self, names: &[String]) {
        let mut state = self.wait_state.lock().await;
        for name in names {
            state.waiting_for.remove(name);
        }
        for deps in state.waiting_for.values_mut() {
            for name in names {
                deps.remove(name);
            }
        }
    }
}

pub fn shared(pool: HashMap<String, usize>) -> Arc<ResourceArbiter> {
    Arc::new(ResourceArbiter::new(pool))
}
