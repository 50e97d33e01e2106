//! Cancellation tokens for the scheduling loops.
//!
//! A [`Signal`] cancels its [`Token`]s and then waits until every one of
//! them was dropped, so that the owner of a token can finish what it is
//! doing before the cancellation completes.

use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Creates a cancellation channel.
pub fn channel() -> (Signal, Token) {
    let (signal_tx, signal_rx) = watch::channel(false);
    let (released_tx, released_rx) = mpsc::channel(1);

    let signal = Signal {
        released_rx,
        signal_tx,
    };
    let token = Token {
        released_tx,
        signal_rx,
    };
    (signal, token)
}

enum Never {}

/// Cancels all the tokens of a channel.
#[derive(Debug)]
pub struct Signal {
    released_rx: mpsc::Receiver<Never>,
    signal_tx: watch::Sender<bool>,
}

/// Tells its owner to stop.
///
/// All `Token` instances must be dropped for a `Signal::cancel` call to
/// complete.
#[derive(Clone, Debug)]
pub struct Token {
    released_tx: mpsc::Sender<Never>,
    signal_rx: watch::Receiver<bool>,
}

impl Signal {
    /// Cancels all the tokens and waits until they were all dropped.
    pub async fn cancel(mut self) {
        // the tokens may all be gone already
        let _ = self.signal_tx.send(true);

        match self.released_rx.recv().await {
            None => debug!("all tokens released"),
            Some(never) => match never {},
        }
    }
}

impl Token {
    pub fn is_cancelled(&self) -> bool {
        *self.signal_rx.borrow()
    }

    /// Completes once the token is cancelled, or once its signal is gone.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            if self.signal_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_tokens() {
        let (signal, mut token) = channel();
        let (done_tx, mut done_rx) = oneshot::channel();

        tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = done_tx.send(());
            drop(token);
        });

        signal.cancel().await;
        assert!(done_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_without_tokens() {
        let (signal, token) = channel();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        drop(token);
        drop(clone);
        signal.cancel().await;
    }

    #[tokio::test]
    async fn test_dropped_signal_cancels() {
        let (signal, mut token) = channel();
        drop(signal);
        token.cancelled().await;
    }
}
