//! Cooperative shutdown signalling between the controller's tasks.
//!
//! One [`Shutdown`] handle is held by `main`, and every long-running task
//! (dispatcher, maintenance, observability server) holds a cloned
//! [`Phase`] it can `.recv().await` inside a `tokio::select!` alongside its
//! real work. `Phase::recv` is level-triggered, not edge-triggered — once
//! the shutdown flag is set, every outstanding and future `recv()` call
//! resolves immediately.

use tokio::sync::watch;

/// The shutdown trigger. Held by the process entry point; dropped only at
/// exit.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// A cloneable handle a task uses to observe the shutdown signal.
#[derive(Debug, Clone)]
pub struct Phase {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> (Self, Phase) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Phase { rx })
    }

    /// Hand out another observer of this shutdown signal.
    #[must_use]
    pub fn subscribe(&self) -> Phase {
        Phase {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal all subscribers to stop.
    pub fn signal(&self) {
        // No receivers is not an error: tasks may have already exited.
        let _ = self.tx.send(true);
    }
}

impl Phase {
    /// Resolve once shutdown has been signalled. Safe to call repeatedly,
    /// and safe to use as a `tokio::select!` branch.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // Shutdown handle dropped without signalling: treat as shutdown.
                return;
            }
        }
    }

    /// Non-blocking check of the current signal state.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_resolves_after_signal() {
        let (shutdown, mut phase) = Shutdown::new();
        assert!(!phase.is_shutdown());
        shutdown.signal();
        phase.recv().await;
        assert!(phase.is_shutdown());
    }

    #[tokio::test]
    async fn late_subscriber_sees_already_signalled_state() {
        let (shutdown, _phase) = Shutdown::new();
        shutdown.signal();
        let mut late = shutdown.subscribe();
        late.recv().await;
        assert!(late.is_shutdown());
    }

    #[tokio::test]
    async fn multiple_recv_calls_are_idempotent() {
        let (shutdown, mut phase) = Shutdown::new();
        shutdown.signal();
        phase.recv().await;
        phase.recv().await;
    }
}
