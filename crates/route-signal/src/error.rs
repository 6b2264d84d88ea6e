//! Error types for route-scoped cancellation.

use thiserror::Error;

use crate::route::RouteId;

/// Errors raised while building or querying a route tree.
#[derive(Debug, Error)]
pub enum RouteTreeError {
    /// Two nodes in the tree share an id
    #[error("Duplicate route id: {route_id}")]
    DuplicateRouteId { route_id: RouteId },

    /// The id is not part of the tree
    #[error("Route not found: {route_id}")]
    UnknownRoute { route_id: RouteId },
}

/// Errors that fail a reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A match references a route the coordinator was not built with
    #[error("Match references unknown route: {route_id}")]
    UnknownRoute { route_id: RouteId },

    /// The same route id appears twice in one match set
    #[error("Route appears more than once in match set: {route_id}")]
    DuplicateMatch { route_id: RouteId },

    /// A route operation returned an error
    #[error("Operation for route {route_id} failed: {source}")]
    Operation {
        route_id: RouteId,
        source: anyhow::Error,
    },
}

impl ReconcileError {
    /// The route the error is about.
    pub fn route_id(&self) -> &RouteId {
        match self {
            Self::UnknownRoute { route_id }
            | Self::DuplicateMatch { route_id }
            | Self::Operation { route_id, .. } => route_id,
        }
    }
}
