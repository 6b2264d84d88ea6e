//! Cancellation primitives for route-scoped operations.
//!
//! A [`CancelController`] owns the right to cancel; the [`CancelSignal`] it
//! hands out can only be observed. Signals are listenable (callbacks via
//! [`CancelSignal::on_cancel`]) and awaitable ([`CancelSignal::cancelled`],
//! backed by a [`CancellationToken`]).
//!
//! [`CancelSignal::any`] derives a signal that cancels as soon as any of its
//! sources cancels. Each source keeps the derived signal alive until it
//! fires, so listeners registered on it keep working after the operation
//! that received it has returned. Once fired, the derived signal drops its
//! subscriptions on every source; long-lived sources such as an
//! application-wide root signal do not accumulate dead listeners.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::route::RouteId;

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

/// Why a signal was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    /// The route left the active match set
    RouteExited { route_id: RouteId },
    /// The route was provisioned again while its previous run was outstanding
    Superseded { route_id: RouteId },
    /// The owner of the signal is shutting down
    Shutdown,
    /// A deadline elapsed
    TimedOut,
    /// Cancelled explicitly by a caller
    Requested { message: String },
}

impl CancelReason {
    /// Shorthand for [`CancelReason::Requested`].
    pub fn requested(message: impl Into<String>) -> Self {
        Self::Requested {
            message: message.into(),
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RouteExited { route_id } => write!(f, "route {route_id} is no longer active"),
            Self::Superseded { route_id } => write!(f, "route {route_id} was provisioned again"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Requested { message } => write!(f, "cancelled: {message}"),
        }
    }
}

type Listener = Box<dyn FnOnce(&CancelReason) + Send>;

#[derive(Default)]
struct SignalState {
    reason: Option<CancelReason>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
    /// Subscriptions this signal holds on its sources (only set for derived signals).
    upstream: Vec<Subscription>,
}

struct SignalInner {
    id: u64,
    token: CancellationToken,
    state: Mutex<SignalState>,
}

impl SignalInner {
    fn new() -> Self {
        Self {
            id: NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
            state: Mutex::new(SignalState::default()),
        }
    }

    /// Moves the signal into the cancelled state.
    ///
    /// Listeners run on the calling thread after the state lock is released,
    /// so a listener may freely cancel or subscribe to other signals.
    ///
    /// Every listener runs even if an earlier one panics; the first panic is
    /// resumed once all of them have been called.
    fn trigger(&self, reason: CancelReason) -> bool {
        let (listeners, upstream) = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.upstream),
            )
        };

        self.token.cancel();

        for subscription in upstream {
            subscription.unsubscribe();
        }
        let mut first_panic = None;
        for (_, listener) in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&reason))) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        true
    }
}

/// Read-only view of a cancellation state.
///
/// Cloning is cheap and every clone observes the same state. Two signals are
/// the *same* signal only if they were cloned from one another; see
/// [`CancelSignal::same_signal`].
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<SignalInner>,
}

impl CancelSignal {
    fn fresh() -> Self {
        Self {
            inner: Arc::new(SignalInner::new()),
        }
    }

    /// A signal with no controller. It never cancels.
    #[must_use]
    pub fn never() -> Self {
        Self::fresh()
    }

    /// Derive a signal that cancels the first time any source cancels.
    ///
    /// If a source is already cancelled the derived signal is returned in the
    /// cancelled state carrying that source's reason. An empty source list
    /// yields a signal that never cancels.
    #[must_use]
    pub fn any<'a, I>(sources: I) -> Self
    where
        I: IntoIterator<Item = &'a CancelSignal>,
    {
        let derived = Self::fresh();
        let sources: Vec<&CancelSignal> = sources.into_iter().collect();

        if let Some(reason) = sources.iter().find_map(|source| source.reason()) {
            derived.inner.trigger(reason);
            return derived;
        }

        let mut subscriptions = Vec::with_capacity(sources.len());
        for source in sources {
            let target = Arc::clone(&derived.inner);
            subscriptions.push(source.on_cancel(move |reason| {
                target.trigger(reason.clone());
            }));
        }

        // A source may have fired while we were still subscribing.
        let leftover = {
            let mut state = derived.inner.state.lock();
            if state.reason.is_some() {
                subscriptions
            } else {
                state.upstream = subscriptions;
                Vec::new()
            }
        };
        for subscription in leftover {
            subscription.unsubscribe();
        }

        derived
    }

    /// A signal that cancels with [`CancelReason::TimedOut`] after `duration`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        let signal = Self::fresh();
        let target = Arc::clone(&signal.inner);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            target.trigger(CancelReason::TimedOut);
        });
        signal
    }

    /// Process-unique identity of this signal.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether both handles observe the same underlying signal.
    pub fn same_signal(&self, other: &CancelSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().reason.is_some()
    }

    /// The reason this signal was cancelled, if it has been.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.state.lock().reason.clone()
    }

    /// Register a listener that runs once when the signal cancels.
    ///
    /// If the signal is already cancelled the listener runs immediately on
    /// the calling thread. Dropping the returned [`Subscription`] keeps the
    /// listener registered; call [`Subscription::unsubscribe`] to remove it.
    pub fn on_cancel<F>(&self, listener: F) -> Subscription
    where
        F: FnOnce(&CancelReason) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if let Some(reason) = state.reason.clone() {
            drop(state);
            listener(&reason);
            return Subscription::inert();
        }

        let listener_id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.push((listener_id, Box::new(listener)));

        Subscription {
            signal: Arc::downgrade(&self.inner),
            listener_id,
        }
    }

    /// Number of listeners waiting for this signal to cancel.
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    /// Wait until the signal is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// A tokio-util token that is cancelled together with this signal.
    ///
    /// Cancelling the returned token does not cancel the signal.
    pub fn to_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("id", &self.inner.id)
            .field("reason", &self.reason())
            .finish()
    }
}

/// Owner side of a [`CancelSignal`].
#[derive(Debug)]
pub struct CancelController {
    signal: CancelSignal,
}

impl CancelController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: CancelSignal::fresh(),
        }
    }

    /// The signal controlled by this controller.
    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    /// Cancel the signal.
    ///
    /// Returns `true` if this call performed the cancellation; cancelling an
    /// already-cancelled controller is a no-op that returns `false`.
    ///
    /// # Panics
    ///
    /// If a listener panics, the remaining listeners still run and the first
    /// panic is then propagated to the caller.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.signal.inner.trigger(reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a listener registered with [`CancelSignal::on_cancel`].
#[derive(Debug)]
pub struct Subscription {
    signal: Weak<SignalInner>,
    listener_id: u64,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            signal: Weak::new(),
            listener_id: 0,
        }
    }

    /// Remove the listener. Returns `false` if it already ran or was removed.
    pub fn unsubscribe(self) -> bool {
        let Some(signal) = self.signal.upgrade() else {
            return false;
        };

        let removed = {
            let mut state = signal.state.lock();
            state
                .listeners
                .iter()
                .position(|(id, _)| *id == self.listener_id)
                .map(|index| state.listeners.remove(index))
        };
        removed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(&CancelReason) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        (count, move |_: &CancelReason| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let controller = CancelController::new();
        let (count, listener) = counter();
        controller.signal().on_cancel(listener);

        assert!(controller.cancel(CancelReason::Shutdown));
        assert!(!controller.cancel(CancelReason::TimedOut));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(controller.signal().reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_listener_on_cancelled_signal_runs_immediately() {
        let controller = CancelController::new();
        controller.cancel(CancelReason::requested("done"));

        let (count, listener) = counter();
        let subscription = controller.signal().on_cancel(listener);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!subscription.unsubscribe());
    }

    #[test]
    fn test_unsubscribed_listener_does_not_run() {
        let controller = CancelController::new();
        let (count, listener) = counter();
        let subscription = controller.signal().on_cancel(listener);

        assert!(subscription.unsubscribe());
        controller.cancel(CancelReason::Shutdown);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_any_cancels_on_either_source() {
        let root = CancelController::new();
        let own = CancelController::new();
        let combined = CancelSignal::any([&root.signal(), &own.signal()]);

        assert!(!combined.is_cancelled());
        own.cancel(CancelReason::RouteExited {
            route_id: RouteId::from("/a"),
        });

        assert!(combined.is_cancelled());
        assert!(!root.is_cancelled());
        assert_eq!(
            combined.reason(),
            Some(CancelReason::RouteExited {
                route_id: RouteId::from("/a")
            })
        );
    }

    #[test]
    fn test_any_with_cancelled_source_starts_cancelled() {
        let root = CancelController::new();
        root.cancel(CancelReason::Shutdown);
        let own = CancelController::new();

        let combined = CancelSignal::any([&root.signal(), &own.signal()]);

        assert!(combined.is_cancelled());
        assert_eq!(own.signal().listener_count(), 0);
    }

    #[test]
    fn test_any_without_sources_never_cancels() {
        let combined = CancelSignal::any(std::iter::empty());
        assert!(!combined.is_cancelled());
    }

    #[test]
    fn test_any_releases_sources_after_firing() {
        let root = CancelController::new();
        let own = CancelController::new();
        let combined = CancelSignal::any([&root.signal(), &own.signal()]);

        assert_eq!(root.signal().listener_count(), 1);
        own.cancel(CancelReason::Shutdown);

        assert!(combined.is_cancelled());
        assert_eq!(root.signal().listener_count(), 0);
    }

    #[test]
    fn test_derived_signal_outlives_its_handles() {
        let root = CancelController::new();
        let own = CancelController::new();
        let combined = CancelSignal::any([&root.signal(), &own.signal()]);
        let (count, listener) = counter();
        combined.on_cancel(listener);

        drop(combined);
        own.cancel(CancelReason::Shutdown);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(root.signal().listener_count(), 0);
    }

    #[test]
    fn test_derived_signals_chain() {
        let root = CancelController::new();
        let first = CancelSignal::any([&root.signal()]);
        let second = CancelSignal::any([&first]);

        root.cancel(CancelReason::Shutdown);

        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert_eq!(second.reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_signal_identity() {
        let controller = CancelController::new();
        let combined = CancelSignal::any([&controller.signal()]);

        assert!(controller.signal().same_signal(&controller.signal()));
        assert!(!combined.same_signal(&controller.signal()));
        assert_ne!(combined.id(), controller.signal().id());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let controller = CancelController::new();
        let signal = controller.signal();
        let token = signal.to_token();

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            signal.reason()
        });
        tokio::task::yield_now().await;
        controller.cancel(CancelReason::Shutdown);

        assert_eq!(waiter.await.unwrap(), Some(CancelReason::Shutdown));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_panicking_listener_does_not_skip_others() {
        let controller = CancelController::new();
        let derived = CancelSignal::any([&controller.signal()]);
        let ran = Arc::new(AtomicUsize::new(0));

        controller.signal().on_cancel(|_| panic!("listener failed"));
        let counter = Arc::clone(&ran);
        controller.signal().on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            controller.cancel(CancelReason::Shutdown);
        }));

        assert!(outcome.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(controller.is_cancelled());
        assert_eq!(derived.reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_derived_wait_is_woken_by_source() {
        let controller = CancelController::new();
        let derived = CancelSignal::any([&controller.signal()]);

        let mut wait = tokio_test::task::spawn(derived.cancelled());
        tokio_test::assert_pending!(wait.poll());

        controller.cancel(CancelReason::Shutdown);
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_signal_fires_after_duration() {
        let signal = CancelSignal::timeout(Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(!signal.is_cancelled());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(signal.reason(), Some(CancelReason::TimedOut));
    }
}
