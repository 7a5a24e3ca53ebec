use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bluerpc_types::ErrorValue;
use tokio::sync::Notify;

type Callback = Box<dyn FnOnce(&ErrorValue) + Send>;

/// A one-shot cancellation signal that carries a reason.
///
/// Callers pass a token to [`ConnectionHandle::invoke`](crate::ConnectionHandle::invoke)
/// to abandon a request; method handlers receive one through their
/// [`MethodContext`](crate::MethodContext) and observe it to stop work the
/// peer no longer wants.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    reason: Option<ErrorValue>,
    callbacks: Vec<(u64, Callback)>,
    next_callback: u64,
}

/// Identifies a callback added with [`CancellationToken::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRegistration(u64);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel with a generic reason.
    pub fn cancel(&self) -> bool {
        self.cancel_with(ErrorValue::new("This operation was cancelled"))
    }

    /// Cancel with `reason`. Returns `false` if the token was already
    /// cancelled, in which case the first reason stands.
    pub fn cancel_with(&self, reason: impl Into<ErrorValue>) -> bool {
        let reason = reason.into();
        let callbacks = {
            let mut st = self.state();
            if st.reason.is_some() {
                return false;
            }
            st.reason = Some(reason.clone());
            std::mem::take(&mut st.callbacks)
        };
        self.inner.notify.notify_waiters();
        for (_, callback) in callbacks {
            callback(&reason);
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().reason.is_some()
    }

    pub fn reason(&self) -> Option<ErrorValue> {
        self.state().reason.clone()
    }

    /// Run `f` once when the token is cancelled, or right away if it already
    /// is.
    pub fn on_cancel(
        &self,
        f: impl FnOnce(&ErrorValue) + Send + 'static,
    ) -> CancelRegistration {
        let (registration, reason) = {
            let mut st = self.state();
            let registration = CancelRegistration(st.next_callback);
            st.next_callback += 1;
            match &st.reason {
                Some(reason) => (registration, reason.clone()),
                None => {
                    st.callbacks.push((registration.0, Box::new(f)));
                    return registration;
                }
            }
        };
        f(&reason);
        registration
    }

    /// Drop a callback that has not run yet. Returns `false` if it already
    /// ran or was removed.
    pub fn deregister(&self, registration: CancelRegistration) -> bool {
        let mut st = self.state();
        let before = st.callbacks.len();
        st.callbacks.retain(|(id, _)| *id != registration.0);
        st.callbacks.len() != before
    }

    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.state().callbacks.len()
    }

    /// Resolves with the reason once the token is cancelled.
    pub async fn cancelled(&self) -> ErrorValue {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.state().reason)
            .finish()
    }
}
