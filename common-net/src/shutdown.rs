use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

pub type ShutdownSender = watch::Sender<bool>;
pub type ShutdownReceiver = watch::Receiver<bool>;

pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

pub fn trigger(sender: &ShutdownSender) {
    let _ = sender.send(true);
}

pub fn is_triggered(receiver: &ShutdownReceiver) -> bool {
    *receiver.borrow()
}

/// Resolves once the flag flips to `true` or every sender is gone.
pub async fn wait(mut receiver: ShutdownReceiver) {
    if *receiver.borrow() {
        return;
    }

    while receiver.changed().await.is_ok() {
        if *receiver.borrow() {
            break;
        }
    }
}

/// Triggers `sender` on ctrl-c. The returned task should be aborted once the
/// service has stopped on its own.
pub fn trigger_on_ctrl_c(sender: ShutdownSender, service: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, service, "unable to listen for ctrl_c");
        }
        info!(service, "shutdown requested");
        trigger(&sender);
    })
}

/// Drain window between announcing shutdown and closing sockets.
pub async fn drain(window: Duration) {
    if !window.is_zero() {
        tokio::time::sleep(window).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_after_trigger() {
        let (tx, rx) = channel();
        assert!(!is_triggered(&rx));

        let waiter = tokio::spawn(wait(rx.clone()));
        trigger(&tx);
        waiter.await.expect("waiter joined");
        assert!(is_triggered(&rx));
    }

    #[tokio::test]
    async fn wait_returns_when_sender_dropped() {
        let (tx, rx) = channel();
        drop(tx);
        wait(rx).await;
    }
}
