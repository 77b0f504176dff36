//! One-shot notification that a broker link became unusable.
//!
//! A fresh pair is created for every successful connect. The notifier side is
//! handed to the transport (and may be shared), the signal side is consumed
//! exactly once by whoever waits for the link to go away.

use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Fires the paired [`ClosureSignal`] at most once.
#[derive(Debug)]
pub struct ClosureNotifier {
    sender: Mutex<Option<oneshot::Sender<Option<String>>>>,
}

/// Resolves when the link it was created for is gone.
#[derive(Debug)]
pub struct ClosureSignal {
    receiver: oneshot::Receiver<Option<String>>,
}

/// Create a notifier/signal pair for a newly opened link.
pub fn closure_pair() -> (Arc<ClosureNotifier>, ClosureSignal) {
    let (sender, receiver) = oneshot::channel();
    (
        Arc::new(ClosureNotifier {
            sender: Mutex::new(Some(sender)),
        }),
        ClosureSignal { receiver },
    )
}

impl ClosureNotifier {
    /// Fire the signal. Returns false if it had already fired.
    pub fn notify(&self, reason: Option<String>) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match sender {
            // The receiver may already be gone; the link is closed either way.
            Some(sender) => {
                let _ = sender.send(reason);
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl ClosureSignal {
    /// Wait for the link to close.
    ///
    /// Yields the error text if the close carried one. A notifier dropped
    /// without firing (the link was torn down and replaced) also resolves,
    /// with `None`.
    pub async fn closed(self) -> Option<String> {
        self.receiver.await.unwrap_or(None)
    }
}
