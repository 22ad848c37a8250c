//! A shareable completion slot with three terminal outcomes.
//!
//! Frontends observe terminal resolution only; the slot resolves exactly
//! once and the resolved value is immutable afterwards.

use std::sync::Arc;

use tokio::sync::watch;

/// Terminal outcome of an asynchronous operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Value(T),
    Error(String),
    /// The producing side went away without resolving.
    Cancelled,
}

/// Producing half. Dropping it without calling [`Completer::resolve`]
/// resolves every observer with [`Outcome::Cancelled`].
pub struct Completer<T> {
    tx: watch::Sender<Option<Arc<Outcome<T>>>>,
}

/// Observing half; cheap to clone, many observers may wait.
#[derive(Clone)]
pub struct Completion<T> {
    rx: watch::Receiver<Option<Arc<Outcome<T>>>>,
}

/// Create a linked completer/completion pair.
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = watch::channel(None);
    (Completer { tx }, Completion { rx })
}

impl<T> Completer<T> {
    /// Resolve the slot. A second resolution is ignored; the first outcome
    /// is the one observers see.
    pub fn resolve(&self, outcome: Outcome<T>) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(Arc::new(outcome));
            true
        });
    }

    pub fn value(&self, value: T) {
        self.resolve(Outcome::Value(value));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.resolve(Outcome::Error(message.into()));
    }
}

impl<T> Completion<T> {
    /// The outcome, if already terminal.
    pub fn peek(&self) -> Option<Arc<Outcome<T>>> {
        self.rx.borrow().clone()
    }

    /// Wait for terminal resolution.
    pub async fn wait(&mut self) -> Arc<Outcome<T>> {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                // Completer dropped without resolving.
                return Arc::new(Outcome::Cancelled);
            }
        }
    }
}
