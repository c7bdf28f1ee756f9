//! Signal and readiness plumbing
//!
//! Every running step (and versioned source) is a suspendable runnable: it
//! receives a signal channel and a readiness hand-off on entry. The ready
//! side must be notified once initialisation is past, before any blocking
//! work; the signal side is a broadcast that composite steps re-derive so
//! they can both forward their parent's signals and inject their own.

use tokio::sync::{oneshot, watch};

/// A signal delivered to a running step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

/// Creates a fresh signal channel.
pub fn signal_channel() -> (SignalHandle, Signals) {
    let (tx, rx) = watch::channel(None);
    (SignalHandle { tx }, Signals { rx })
}

/// The sending half: whoever supervises a step holds this.
#[derive(Clone)]
pub struct SignalHandle {
    tx: watch::Sender<Option<Signal>>,
}

impl SignalHandle {
    pub fn signal(&self, signal: Signal) {
        let _ = self.tx.send(Some(signal));
    }

    pub fn subscribe(&self) -> Signals {
        Signals {
            rx: self.tx.subscribe(),
        }
    }
}

/// The receiving half handed to a running step.
#[derive(Clone)]
pub struct Signals {
    rx: watch::Receiver<Option<Signal>>,
}

impl Signals {
    /// Waits for a signal. Pends forever if the sender goes away without
    /// ever signalling, so it composes safely inside `select!`.
    pub async fn recv(&mut self) -> Signal {
        loop {
            if let Some(signal) = *self.rx.borrow_and_update() {
                return signal;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// The most recent signal, if any was delivered.
    pub fn pending(&self) -> Option<Signal> {
        *self.rx.borrow()
    }

    /// Derives a child channel that forwards this channel's signals and can
    /// additionally be signalled on its own (aggregate interrupting its
    /// remaining children after a first error).
    pub fn derive(&self) -> (SignalHandle, Signals) {
        let (handle, signals) = signal_channel();

        let mut parent = self.clone();
        let forwarder = handle.clone();
        tokio::spawn(async move {
            // forward the first signal; stop quietly once the parent side
            // is gone so finished builds do not pin tasks
            loop {
                if let Some(signal) = *parent.rx.borrow_and_update() {
                    forwarder.signal(signal);
                    break;
                }
                if parent.rx.changed().await.is_err() {
                    break;
                }
            }
        });

        (handle, signals)
    }
}

/// The readiness hand-off: notified once a step is past initialisation.
pub struct Ready(Option<oneshot::Sender<()>>);

impl Ready {
    pub fn new() -> (Ready, ReadyWaiter) {
        let (tx, rx) = oneshot::channel();
        (Ready(Some(tx)), ReadyWaiter(rx))
    }

    /// A ready with nobody waiting, for steps run inside a composite that
    /// already reported its own readiness.
    pub fn detached() -> Ready {
        Ready(None)
    }

    /// Marks the step ready. Subsequent calls are no-ops.
    pub fn notify(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// Waits for a step's readiness; also resolves if the step exits without
/// ever notifying (failure during initialisation).
pub struct ReadyWaiter(oneshot::Receiver<()>);

impl ReadyWaiter {
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_delivery() {
        let (handle, mut signals) = signal_channel();
        assert_eq!(signals.pending(), None);

        handle.signal(Signal::Interrupt);
        assert_eq!(signals.recv().await, Signal::Interrupt);
        assert_eq!(signals.pending(), Some(Signal::Interrupt));
    }

    #[tokio::test]
    async fn test_signal_received_before_subscribing_is_still_seen() {
        let (handle, signals) = signal_channel();
        handle.signal(Signal::Terminate);

        let mut late = signals.clone();
        assert_eq!(late.recv().await, Signal::Terminate);
    }

    #[tokio::test]
    async fn test_derived_channel_forwards_parent_signals() {
        let (parent_handle, parent) = signal_channel();
        let (_child_handle, mut child) = parent.derive();

        parent_handle.signal(Signal::Interrupt);
        assert_eq!(child.recv().await, Signal::Interrupt);
    }

    #[tokio::test]
    async fn test_derived_channel_can_be_signalled_independently() {
        let (_parent_handle, parent) = signal_channel();
        let (child_handle, mut child) = parent.derive();

        child_handle.signal(Signal::Interrupt);
        assert_eq!(child.recv().await, Signal::Interrupt);
    }

    #[tokio::test]
    async fn test_recv_pends_without_a_signal() {
        let (_handle, mut signals) = signal_channel();
        let timeout = tokio::time::timeout(Duration::from_millis(10), signals.recv()).await;
        assert!(timeout.is_err());
    }

    #[tokio::test]
    async fn test_ready_waiter_resolves_on_notify_and_on_drop() {
        let (mut ready, waiter) = Ready::new();
        ready.notify();
        ready.notify();
        waiter.wait().await;

        let (ready, waiter) = Ready::new();
        drop(ready);
        waiter.wait().await;
    }
}
