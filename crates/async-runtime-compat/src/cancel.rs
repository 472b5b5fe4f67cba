use async_channel::{Receiver, Sender};
use std::sync::Arc;

/// A cloneable, one-way cancellation signal.
///
/// Cancelling closes an internal channel, which wakes every task waiting in
/// [`CancellationToken::cancelled`] at once. Tokens are cheap to clone and
/// all clones observe the same signal.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<Sender<()>>,
    receiver: Receiver<()>,
}

impl CancellationToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::bounded(1);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.close();
    }

    /// Whether [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.receiver.is_closed()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        // Nothing is ever sent, so recv only returns once the channel closes.
        let _ = self.receiver.recv().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
