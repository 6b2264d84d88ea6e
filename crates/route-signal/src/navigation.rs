//! Turns "navigate to route X" into an active match set.
//!
//! This is the minimal router behaviour the coordinator expects from its
//! caller: the active set is the branch from the top-level route down to the
//! target, and only routes that were not already active need to execute.

use std::collections::HashSet;

use crate::coordinator::RouteMatch;
use crate::error::RouteTreeError;
use crate::route::{RouteId, RouteTree};

/// Remembers the previously active branch between navigations.
#[derive(Debug, Default, Clone)]
pub struct MatchPlanner {
    active: Vec<RouteId>,
}

impl MatchPlanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The branch produced by the last successful [`plan`](Self::plan).
    pub fn active(&self) -> &[RouteId] {
        &self.active
    }

    /// Plan the match set for navigating to `target`.
    ///
    /// Routes that stay active keep running unless `revalidate` is set, in
    /// which case every route on the branch executes again.
    pub fn plan<T>(
        &mut self,
        tree: &RouteTree<T>,
        target: &str,
        revalidate: bool,
    ) -> Result<Vec<RouteMatch>, RouteTreeError> {
        let branch = tree.branch(target)?;
        let previous: HashSet<&RouteId> = self.active.iter().collect();

        let matches = branch
            .iter()
            .map(|route_id| RouteMatch {
                route_id: route_id.clone(),
                should_execute: revalidate || !previous.contains(route_id),
            })
            .collect();

        self.active = branch;
        Ok(matches)
    }

    /// Forget the active branch, so the next plan executes every route.
    pub fn reset(&mut self) {
        self.active.clear();
    }
}
