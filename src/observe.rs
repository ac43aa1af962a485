//! Ordered fan-out of lifecycle state changes.

use crate::error::AppError;
use crate::state::ApplicationState;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Notification delivered to state subscribers.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// The host moved to a new state.
    Changed(ApplicationState),
    /// The host reached a terminal state without an error.
    Completed,
    /// The host reached a terminal state carrying an error.
    Failed(AppError),
}

struct Inner {
    subscribers: Vec<mpsc::UnboundedSender<StateEvent>>,
    closing: Option<StateEvent>,
}

/// Publishes state transitions to subscribers in the order they happen.
///
/// A terminal transition closes every subscription with either
/// [`StateEvent::Completed`] or [`StateEvent::Failed`]. Subscribers that
/// arrive afterwards only see that closing notification.
pub struct StateBroadcaster {
    inner: Mutex<Inner>,
    current: watch::Sender<ApplicationState>,
}

impl StateBroadcaster {
    pub fn new() -> Self {
        let (current, _) = watch::channel(ApplicationState::NotInitialized);
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                closing: None,
            }),
            current,
        }
    }

    pub fn current(&self) -> ApplicationState {
        *self.current.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closing.is_some()
    }

    /// Publish `state`. Returns false once the stream is already closed.
    pub fn publish(&self, state: ApplicationState, error: Option<&AppError>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closing.is_some() {
            debug!(%state, "Ignoring transition after terminal state");
            return false;
        }

        self.current.send_replace(state);
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(StateEvent::Changed(state)).is_ok());

        if state.is_terminal() {
            let closing = match error {
                Some(error) => StateEvent::Failed(error.clone()),
                None => StateEvent::Completed,
            };
            for subscriber in inner.subscribers.drain(..) {
                let _ = subscriber.send(closing.clone());
            }
            inner.closing = Some(closing);
        }

        true
    }

    /// Subscribe to transitions. The current state is replayed first.
    pub fn subscribe(&self) -> StateSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        match inner.closing.clone() {
            Some(closing) => {
                let _ = sender.send(closing);
            }
            None => {
                let _ = sender.send(StateEvent::Changed(self.current()));
                inner.subscribers.push(sender);
            }
        }

        StateSubscription { receiver }
    }

    /// Watch the latest state without receiving every transition.
    pub fn watch(&self) -> watch::Receiver<ApplicationState> {
        self.current.subscribe()
    }
}

impl Default for StateBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of [`StateEvent`]s; ends after the closing notification.
pub struct StateSubscription {
    receiver: mpsc::UnboundedReceiver<StateEvent>,
}

impl StateSubscription {
    pub async fn recv(&mut self) -> Option<StateEvent> {
        self.receiver.recv().await
    }

    /// Wait until `state` is observed. Returns false if the stream closed first.
    pub async fn wait_for(&mut self, state: ApplicationState) -> bool {
        while let Some(event) = self.recv().await {
            if let StateEvent::Changed(observed) = event {
                if observed == state {
                    return true;
                }
            }
        }
        false
    }

    /// Drain the stream, returning every state seen and the closing error.
    pub async fn collect(mut self) -> (Vec<ApplicationState>, Option<AppError>) {
        let mut states = Vec::new();
        let mut error = None;
        while let Some(event) = self.recv().await {
            match event {
                StateEvent::Changed(state) => states.push(state),
                StateEvent::Completed => {}
                StateEvent::Failed(failure) => error = Some(failure),
            }
        }
        (states, error)
    }
}

impl Stream for StateSubscription {
    type Item = StateEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
