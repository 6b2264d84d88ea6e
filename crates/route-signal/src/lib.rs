//! Route-scoped cancellation for router data loading.
//!
//! Every route in a router may run an asynchronous operation (typically a
//! data loader) when it becomes active. When a navigation moves away from a
//! route, whatever that route started should be cancelled, while routes that
//! stay active (a shared parent layout, say) must be left alone.
//!
//! [`CancellationCoordinator`] implements that policy. It owns one
//! [`CancelController`] per active route and, for each match set handed to
//! [`reconcile`](CancellationCoordinator::reconcile):
//!
//! 1. cancels and forgets controllers of routes no longer matched,
//! 2. provisions a fresh controller for each route that must execute,
//! 3. runs those operations together, each with a signal that cancels when
//!    either the root signal or the route's own controller cancels,
//! 4. returns the results keyed by route id.
//!
//! # Usage
//!
//! ```no_run
//! use route_signal::{
//!     CancelController, CancellationCoordinator, OperationContext, RouteDefinition, RouteMatch,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let app = CancelController::new();
//!
//! let routes = vec![RouteDefinition::new("/users").with_operation(
//!     |ctx: OperationContext| async move {
//!         tokio::select! {
//!             () = ctx.signal.cancelled() => anyhow::bail!("navigation moved on"),
//!             () = tokio::time::sleep(std::time::Duration::from_millis(10)) => Ok(42_u32),
//!         }
//!     },
//! )];
//!
//! let coordinator = CancellationCoordinator::new(app.signal(), &routes)?;
//! let results = coordinator.reconcile(&[RouteMatch::execute("/users")]).await?;
//! assert_eq!(results.get("/users"), Some(&42));
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! - `ROUTE_SIGNAL_STRICT`: set to `false` to track unknown route ids instead
//!   of rejecting the match set (see [`CoordinatorConfig::from_env`])

pub mod config;
pub mod coordinator;
pub mod error;
pub mod navigation;
pub mod operation;
pub mod route;
pub mod scenario;
pub mod signal;

pub use config::CoordinatorConfig;
pub use coordinator::{CancellationCoordinator, Reconciliation, RouteMatch};
pub use error::{ReconcileError, RouteTreeError};
pub use navigation::MatchPlanner;
pub use operation::{OperationContext, RouteOperation};
pub use route::{fill_operations, OperationSlot, Route, RouteDefinition, RouteId, RouteTree};
pub use scenario::{Scenario, ScenarioError, ScenarioReport};
pub use signal::{CancelController, CancelReason, CancelSignal, Subscription};
