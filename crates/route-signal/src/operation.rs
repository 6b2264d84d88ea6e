//! Per-route asynchronous operations.

use std::future::Future;

use async_trait::async_trait;

use crate::signal::CancelSignal;

/// What an operation receives when the coordinator invokes it.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Cancelled when the route leaves scope or the root signal cancels.
    pub signal: CancelSignal,
}

/// Asynchronous unit of work attached to a route.
///
/// Cancellation is cooperative: an operation that never looks at
/// `ctx.signal` runs to completion even after its route has been cancelled.
#[async_trait]
pub trait RouteOperation<T>: Send + Sync {
    /// Run the operation for one reconciliation.
    async fn run(&self, ctx: OperationContext) -> anyhow::Result<T>;
}

#[async_trait]
impl<T, F, Fut> RouteOperation<T> for F
where
    F: Fn(OperationContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    async fn run(&self, ctx: OperationContext) -> anyhow::Result<T> {
        (self)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{CancelController, CancelReason};

    struct Echo(&'static str);

    #[async_trait]
    impl RouteOperation<String> for Echo {
        async fn run(&self, ctx: OperationContext) -> anyhow::Result<String> {
            if ctx.signal.is_cancelled() {
                anyhow::bail!("cancelled before start");
            }
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_struct_operation() {
        let controller = CancelController::new();
        let value = Echo("hello")
            .run(OperationContext {
                signal: controller.signal(),
            })
            .await
            .unwrap();
        assert_eq!(value, "hello");

        controller.cancel(CancelReason::Shutdown);
        let err = Echo("hello")
            .run(OperationContext {
                signal: controller.signal(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled before start"));
    }

    #[tokio::test]
    async fn test_closure_operation_sees_signal() {
        let operation =
            |ctx: OperationContext| async move { Ok::<_, anyhow::Error>(ctx.signal.is_cancelled()) };

        let controller = CancelController::new();
        controller.cancel(CancelReason::TimedOut);

        let observed = operation
            .run(OperationContext {
                signal: controller.signal(),
            })
            .await
            .unwrap();
        assert!(observed);
    }
}
