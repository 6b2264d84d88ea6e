//! # Cancellation Coordinator
//!
//! Maps each active match set onto per-route cancellation controllers.
//!
//! A reconciliation runs in two phases:
//!
//! 1. [`CancellationCoordinator::begin`] synchronously prunes controllers of
//!    routes that left the match set (cancelling them) and provisions a fresh
//!    controller for every match that must execute.
//! 2. [`Reconciliation::execute`] invokes the pending operations together,
//!    each with `any(root, own controller)` as its signal, and collects their
//!    results by route id.
//!
//! [`CancellationCoordinator::reconcile`] does both. Because phase 1 finishes
//! before anything is awaited, a newer match set can be applied while an older
//! reconciliation is still executing; the newer one cancels the older routes
//! it no longer contains.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{ReconcileError, RouteTreeError};
use crate::operation::{OperationContext, RouteOperation};
use crate::route::{OperationSlot, RouteDefinition, RouteId, RouteTree};
use crate::signal::{CancelController, CancelReason, CancelSignal};

/// One route of the active match set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMatch {
    pub route_id: RouteId,
    /// Whether the route's operation must run in this reconciliation
    pub should_execute: bool,
}

impl RouteMatch {
    /// A match whose operation must run.
    pub fn execute(route_id: impl Into<RouteId>) -> Self {
        Self {
            route_id: route_id.into(),
            should_execute: true,
        }
    }

    /// A match that stays active without running again.
    pub fn keep(route_id: impl Into<RouteId>) -> Self {
        Self {
            route_id: route_id.into(),
            should_execute: false,
        }
    }
}

/// Owns the RouteId → controller table for one router instance.
///
/// Callers are expected to apply match sets one at a time, in navigation
/// order. Route ids must be unique within a match set.
pub struct CancellationCoordinator<T> {
    root: CancelSignal,
    tree: RouteTree<T>,
    config: CoordinatorConfig,
    controllers: Mutex<HashMap<RouteId, CancelController>>,
}

impl<T: Send + 'static> CancellationCoordinator<T> {
    /// Build a coordinator over `definitions` with the default configuration.
    pub fn new(
        root: CancelSignal,
        definitions: &[RouteDefinition<T>],
    ) -> Result<Self, RouteTreeError> {
        Self::with_config(root, definitions, CoordinatorConfig::default())
    }

    pub fn with_config(
        root: CancelSignal,
        definitions: &[RouteDefinition<T>],
        config: CoordinatorConfig,
    ) -> Result<Self, RouteTreeError> {
        let tree = RouteTree::from_definitions(definitions)?;
        debug!(
            routes = tree.len(),
            strict = config.strict,
            "Cancellation coordinator created"
        );

        Ok(Self {
            root,
            tree,
            config,
            controllers: Mutex::new(HashMap::new()),
        })
    }

    /// The filled route tree to hand to the router.
    pub fn routes(&self) -> &RouteTree<T> {
        &self.tree
    }

    pub fn root_signal(&self) -> &CancelSignal {
        &self.root
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.config
    }

    /// Apply a complete match set and run every operation it requires.
    ///
    /// Returns the value of each invoked route. Matches that are kept without
    /// executing, and routes without an operation, are not part of the result.
    /// The first failing operation fails the whole call.
    pub async fn reconcile(
        &self,
        matches: &[RouteMatch],
    ) -> Result<HashMap<RouteId, T>, ReconcileError> {
        self.begin(matches)?.execute().await
    }

    /// Prune and provision for `matches` without running anything yet.
    ///
    /// A rejected match set leaves the controller table untouched.
    pub fn begin(&self, matches: &[RouteMatch]) -> Result<Reconciliation<T>, ReconcileError> {
        self.validate(matches)?;

        let active: HashSet<&str> = matches.iter().map(|m| m.route_id.as_str()).collect();
        let executing: HashSet<&str> = matches
            .iter()
            .filter(|m| m.should_execute)
            .map(|m| m.route_id.as_str())
            .collect();

        let (pruned, superseded) = {
            let mut controllers = self.controllers.lock();
            let stale: Vec<RouteId> = controllers
                .keys()
                .filter(|id| !active.contains(id.as_str()))
                .cloned()
                .collect();
            let rerun: Vec<RouteId> = controllers
                .keys()
                .filter(|id| executing.contains(id.as_str()))
                .cloned()
                .collect();

            let pruned: Vec<(RouteId, CancelController)> = stale
                .into_iter()
                .filter_map(|id| controllers.remove(&id).map(|c| (id, c)))
                .collect();
            let superseded: Vec<(RouteId, CancelController)> = rerun
                .into_iter()
                .filter_map(|id| controllers.remove(&id).map(|c| (id, c)))
                .collect();
            (pruned, superseded)
        };

        // Listeners run synchronously; the table lock is already released.
        for (route_id, controller) in &pruned {
            controller.cancel(CancelReason::RouteExited {
                route_id: route_id.clone(),
            });
            debug!(route_id = %route_id, "Cancelled route that left the match set");
        }
        for (route_id, controller) in &superseded {
            controller.cancel(CancelReason::Superseded {
                route_id: route_id.clone(),
            });
            debug!(route_id = %route_id, "Cancelled previous run of re-executed route");
        }

        let mut runs = Vec::new();
        {
            let mut controllers = self.controllers.lock();
            for matched in matches.iter().filter(|m| m.should_execute) {
                let controller = CancelController::new();
                let signal = CancelSignal::any([&self.root, &controller.signal()]);
                controllers.insert(matched.route_id.clone(), controller);

                let operation = self
                    .tree
                    .operation(matched.route_id.as_str())
                    .and_then(OperationSlot::operation)
                    .cloned();
                debug!(
                    route_id = %matched.route_id,
                    signal_id = signal.id(),
                    has_operation = operation.is_some(),
                    "Provisioned route controller"
                );

                runs.push(PendingRun {
                    route_id: matched.route_id.clone(),
                    operation,
                    signal,
                });
            }
        }

        info!(
            matched = matches.len(),
            pruned = pruned.len(),
            superseded = superseded.len(),
            provisioned = runs.len(),
            "Reconciled active match set"
        );

        Ok(Reconciliation { runs })
    }

    /// Cancel and forget every tracked controller.
    ///
    /// Returns how many controllers were cancelled. Dropping the coordinator
    /// does the same.
    pub fn dispose(&self) -> usize {
        shutdown_controllers(&self.controllers)
    }

    /// Ids that currently hold a controller, sorted.
    pub fn active_routes(&self) -> Vec<RouteId> {
        let mut ids: Vec<RouteId> = self.controllers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_tracking(&self, route_id: &str) -> bool {
        self.controllers.lock().contains_key(route_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.controllers.lock().len()
    }

    fn validate(&self, matches: &[RouteMatch]) -> Result<(), ReconcileError> {
        let mut seen = HashSet::with_capacity(matches.len());
        for matched in matches {
            if !seen.insert(matched.route_id.as_str()) {
                warn!(route_id = %matched.route_id, "Rejected match set with duplicate route");
                return Err(ReconcileError::DuplicateMatch {
                    route_id: matched.route_id.clone(),
                });
            }
            if self.config.strict && !self.tree.contains(matched.route_id.as_str()) {
                warn!(route_id = %matched.route_id, "Rejected match set with unknown route");
                return Err(ReconcileError::UnknownRoute {
                    route_id: matched.route_id.clone(),
                });
            }
        }
        Ok(())
    }
}

impl<T> Drop for CancellationCoordinator<T> {
    fn drop(&mut self) {
        shutdown_controllers(&self.controllers);
    }
}

fn shutdown_controllers(controllers: &Mutex<HashMap<RouteId, CancelController>>) -> usize {
    let drained: Vec<(RouteId, CancelController)> = controllers.lock().drain().collect();

    for (route_id, controller) in &drained {
        controller.cancel(CancelReason::Shutdown);
        debug!(route_id = %route_id, "Cancelled route on shutdown");
    }
    if !drained.is_empty() {
        info!(cancelled = drained.len(), "Cancellation coordinator shut down");
    }
    drained.len()
}

impl<T> fmt::Debug for CancellationCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationCoordinator")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("tracked", &self.controllers.lock().len())
            .finish_non_exhaustive()
    }
}

struct PendingRun<T> {
    route_id: RouteId,
    operation: Option<Arc<dyn RouteOperation<T>>>,
    signal: CancelSignal,
}

/// Provisioned routes of one match set, ready to execute.
///
/// Holds no borrow of the coordinator, so it can be moved into a spawned task.
#[must_use = "operations only run when the reconciliation is executed"]
pub struct Reconciliation<T> {
    runs: Vec<PendingRun<T>>,
}

impl<T: Send + 'static> Reconciliation<T> {
    /// Routes provisioned by this reconciliation, in match order.
    pub fn route_ids(&self) -> impl Iterator<Item = &RouteId> {
        self.runs.iter().map(|run| &run.route_id)
    }

    /// The combined signal issued to `route_id`.
    pub fn signal(&self, route_id: &str) -> Option<&CancelSignal> {
        self.runs
            .iter()
            .find(|run| run.route_id.as_str() == route_id)
            .map(|run| &run.signal)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Invoke every pending operation and collect the results.
    ///
    /// Every operation is spawned on the runtime before any is awaited. The
    /// first error fails the call; sibling operations keep running in the
    /// background until they finish or observe their signal.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub async fn execute(self) -> Result<HashMap<RouteId, T>, ReconcileError> {
        let launches: Vec<_> = self
            .runs
            .into_iter()
            .filter_map(|run| {
                let PendingRun {
                    route_id,
                    operation,
                    signal,
                } = run;
                let operation = operation?;
                let task =
                    tokio::spawn(async move { operation.run(OperationContext { signal }).await });
                Some(async move {
                    let outcome = task.await.map_err(anyhow::Error::new).and_then(|r| r);
                    match outcome {
                        Ok(value) => Ok((route_id, value)),
                        Err(source) => {
                            warn!(route_id = %route_id, error = %source, "Route operation failed");
                            Err(ReconcileError::Operation { route_id, source })
                        }
                    }
                })
            })
            .collect();

        // Dropping a JoinHandle detaches its task, so an early error leaves
        // the remaining operations running.
        let results = try_join_all(launches).await?;
        Ok(results.into_iter().collect())
    }
}

impl<T> fmt::Debug for Reconciliation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.runs.iter().map(|run| &run.route_id))
            .finish()
    }
}
