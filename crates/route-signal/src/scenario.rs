//! Scripted navigation scenarios.
//!
//! A scenario file declares a route tree with simulated operations and a
//! sequence of steps. Running it drives a [`CancellationCoordinator`] through
//! the steps and records every cancellation an operation observed.
//!
//! ```yaml
//! routes:
//!   - id: /A1
//!     operation: { value: a1 }
//!     children:
//!       - id: /A1/B1
//!         operation: { value: b1, delay_ms: 50 }
//!       - id: /A1/B2
//! steps:
//!   - action: navigate
//!     to: /A1/B1
//!     overlap: true
//!   - action: navigate
//!     to: /A1/B2
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::CancellationCoordinator;
use crate::error::{ReconcileError, RouteTreeError};
use crate::navigation::MatchPlanner;
use crate::operation::{OperationContext, RouteOperation};
use crate::route::{RouteDefinition, RouteId};
use crate::signal::{CancelController, CancelReason};

/// Errors that can occur while loading or running a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to read scenario file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid scenario YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid route tree: {0}")]
    RouteTree(#[from] RouteTreeError),

    #[error("Reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Overlapped step {step} panicked")]
    Join { step: usize },
}

/// A route node of a scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    pub id: RouteId,
    #[serde(default)]
    pub operation: Option<OperationSpec>,
    #[serde(default)]
    pub children: Vec<RouteSpec>,
}

/// A simulated operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Value the operation resolves with
    #[serde(default)]
    pub value: Value,
    /// Simulated work time; cancellation is honoured while waiting
    #[serde(default)]
    pub delay_ms: u64,
    /// Fail with this message instead of resolving
    #[serde(default)]
    pub fail: Option<String>,
}

/// One step of a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate to a route
    Navigate {
        to: RouteId,
        /// Re-run routes that stay active
        #[serde(default)]
        revalidate: bool,
        /// Start the next step without waiting for this one to finish
        #[serde(default)]
        overlap: bool,
    },
    /// Cancel the root signal
    CancelRoot,
}

/// A complete scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A cancellation observed by a running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelEvent {
    pub route_id: RouteId,
    pub reason: CancelReason,
}

/// Outcome of one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepReport {
    pub step: usize,
    pub action: String,
    /// Routes whose operations were started
    pub executed: Vec<RouteId>,
    pub results: BTreeMap<RouteId, Value>,
    pub error: Option<String>,
    /// Routes holding a controller after the step was applied
    pub active: Vec<RouteId>,
}

/// Outcome of a whole scenario.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub steps: Vec<StepReport>,
    pub cancellations: Vec<CancelEvent>,
}

impl ScenarioReport {
    /// Cancellations observed for `route_id`.
    pub fn cancellations_for(&self, route_id: &str) -> Vec<&CancelEvent> {
        self.cancellations
            .iter()
            .filter(|event| event.route_id.as_str() == route_id)
            .collect()
    }
}

type CancelLog = Arc<Mutex<Vec<CancelEvent>>>;

struct ScriptedOperation {
    route_id: RouteId,
    spec: OperationSpec,
    log: CancelLog,
}

#[async_trait::async_trait]
impl RouteOperation<Value> for ScriptedOperation {
    async fn run(&self, ctx: OperationContext) -> anyhow::Result<Value> {
        let route_id = self.route_id.clone();
        let log = Arc::clone(&self.log);
        ctx.signal.on_cancel(move |reason| {
            log.lock().push(CancelEvent {
                route_id,
                reason: reason.clone(),
            });
        });

        if self.spec.delay_ms > 0 {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(self.spec.delay_ms)) => {}
                () = ctx.signal.cancelled() => {
                    let reason = ctx.signal.reason().unwrap_or(CancelReason::Shutdown);
                    anyhow::bail!("{} aborted: {reason}", self.route_id);
                }
            }
        }

        if let Some(message) = &self.spec.fail {
            anyhow::bail!("{message}");
        }
        Ok(self.spec.value.clone())
    }
}

impl Scenario {
    /// Parse a scenario from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ScenarioError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a scenario file.
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Check the route tree without running anything.
    pub fn validate(&self) -> Result<usize, ScenarioError> {
        let coordinator = CancellationCoordinator::new(
            CancelController::new().signal(),
            &self.definitions(&CancelLog::default()),
        )?;
        Ok(coordinator.routes().len())
    }

    fn definitions(&self, log: &CancelLog) -> Vec<RouteDefinition<Value>> {
        self.routes.iter().map(|spec| to_definition(spec, log)).collect()
    }

    /// Run every step and report what happened.
    ///
    /// A failing step is recorded in its report and does not stop the run.
    pub async fn run(&self) -> Result<ScenarioReport, ScenarioError> {
        let log = CancelLog::default();
        let root = CancelController::new();
        let coordinator = CancellationCoordinator::new(root.signal(), &self.definitions(&log))?;
        let mut planner = MatchPlanner::new();

        let mut reports: Vec<StepReport> = Vec::with_capacity(self.steps.len());
        let mut overlapped: Vec<(usize, JoinHandle<Result<_, ReconcileError>>)> = Vec::new();

        for (index, step) in self.steps.iter().enumerate() {
            match step {
                Step::Navigate {
                    to,
                    revalidate,
                    overlap,
                } => {
                    let mut report = StepReport {
                        step: index,
                        action: format!("navigate {to}"),
                        ..StepReport::default()
                    };

                    let reconciliation = planner
                        .plan(coordinator.routes(), to.as_str(), *revalidate)
                        .map_err(ScenarioError::from)
                        .and_then(|matches| {
                            coordinator.begin(&matches).map_err(ScenarioError::from)
                        });

                    match reconciliation {
                        Err(err) => report.error = Some(err.to_string()),
                        Ok(reconciliation) => {
                            report.executed = reconciliation.route_ids().cloned().collect();
                            report.active = coordinator.active_routes();
                            if *overlap {
                                debug!(step = index, "Starting overlapped step");
                                overlapped.push((index, tokio::spawn(reconciliation.execute())));
                                // Let the operations start before the next step.
                                tokio::task::yield_now().await;
                            } else {
                                record(&mut report, reconciliation.execute().await);
                            }
                        }
                    }
                    reports.push(report);
                }
                Step::CancelRoot => {
                    root.cancel(CancelReason::Shutdown);
                    reports.push(StepReport {
                        step: index,
                        action: "cancel root".to_string(),
                        active: coordinator.active_routes(),
                        ..StepReport::default()
                    });
                }
            }
        }

        for (index, handle) in overlapped {
            let outcome = handle
                .await
                .map_err(|_| ScenarioError::Join { step: index })?;
            record(&mut reports[index], outcome);
        }

        coordinator.dispose();

        let cancellations = log.lock().clone();
        info!(
            steps = reports.len(),
            cancellations = cancellations.len(),
            "Scenario finished"
        );

        Ok(ScenarioReport {
            steps: reports,
            cancellations,
        })
    }
}

fn record(
    report: &mut StepReport,
    outcome: Result<HashMap<RouteId, Value>, ReconcileError>,
) {
    match outcome {
        Ok(results) => report.results = results.into_iter().collect(),
        Err(err) => report.error = Some(err.to_string()),
    }
}

fn to_definition(spec: &RouteSpec, log: &CancelLog) -> RouteDefinition<Value> {
    let mut definition = RouteDefinition::new(spec.id.clone())
        .with_children(spec.children.iter().map(|child| to_definition(child, log)));
    if let Some(operation) = &spec.operation {
        definition = definition.with_operation(ScriptedOperation {
            route_id: spec.id.clone(),
            spec: operation.clone(),
            log: Arc::clone(log),
        });
    }
    definition
}

#[cfg(test)]
mod tests {
    use super::*;

    const NESTED: &str = r"
routes:
  - id: /A1
    operation: { value: a1 }
    children:
      - id: /A1/B1
        operation: { value: b1 }
      - id: /A1/B2
  - id: /A2
    operation: { value: 2 }
steps:
  - action: navigate
    to: /A1/B1
  - action: navigate
    to: /A1/B2
  - action: navigate
    to: /A2
";

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_yaml(NESTED).unwrap();

        assert_eq!(scenario.routes.len(), 2);
        assert_eq!(scenario.routes[0].children.len(), 2);
        assert!(scenario.routes[0].children[1].operation.is_none());
        assert_eq!(scenario.steps.len(), 3);
        assert!(matches!(
            &scenario.steps[0],
            Step::Navigate { to, revalidate: false, overlap: false } if to.as_str() == "/A1/B1"
        ));
        assert_eq!(scenario.validate().unwrap(), 4);
    }

    #[test]
    fn test_parse_rejects_unknown_action() {
        let err = Scenario::from_yaml("routes: []\nsteps:\n  - action: jump\n").unwrap_err();
        assert!(matches!(err, ScenarioError::Yaml(_)));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let scenario = Scenario::from_yaml("routes:\n  - id: /a\n  - id: /a\n").unwrap();
        assert!(matches!(
            scenario.validate(),
            Err(ScenarioError::RouteTree(RouteTreeError::DuplicateRouteId { .. }))
        ));
    }

    #[tokio::test]
    async fn test_run_nested_scenario() {
        let report = Scenario::from_yaml(NESTED).unwrap().run().await.unwrap();

        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.steps[0].results.len(), 2);
        assert_eq!(
            report.steps[0].results.get(&RouteId::from("/A1/B1")),
            Some(&Value::from("b1"))
        );
        // Sibling switch: only B1 is cancelled.
        assert_eq!(report.steps[1].executed, vec![RouteId::from("/A1/B2")]);
        assert_eq!(report.cancellations_for("/A1/B1").len(), 1);
        // Leaving A1 cancels A1 once; A2 is only cancelled by the final dispose.
        assert_eq!(report.cancellations_for("/A1").len(), 1);
        assert_eq!(
            report.cancellations_for("/A2")[0].reason,
            CancelReason::Shutdown
        );
    }

    #[tokio::test]
    async fn test_failing_step_is_reported() {
        let scenario = Scenario::from_yaml(
            r"
routes:
  - id: /broken
    operation: { fail: upstream unavailable }
steps:
  - action: navigate
    to: /broken
  - action: navigate
    to: /missing
",
        )
        .unwrap();

        let report = scenario.run().await.unwrap();

        let first = report.steps[0].error.as_deref().unwrap();
        assert!(first.contains("upstream unavailable"));
        let second = report.steps[1].error.as_deref().unwrap();
        assert!(second.contains("/missing"));
    }
}
