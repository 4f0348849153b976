//! Change notification channel.
//!
//! Notifications are deliberately contentless: a notice means "something
//! that could affect query results happened", nothing more. Consumers
//! drain the channel in a loop and rescan, which makes the at-least-once,
//! possibly-duplicate, possibly-coalesced delivery contract explicit.

use tokio::sync::broadcast;

/// A contentless change notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice;

/// Receiving half of a store's change channel.
pub struct ChangeListener {
    rx: broadcast::Receiver<ChangeNotice>,
}

impl ChangeListener {
    /// Wait for the next notice. Returns `None` once the store is gone.
    ///
    /// A lagged receiver is reported as a single notice: missed
    /// notifications are indistinguishable from coalesced ones, and the
    /// consumer rescans either way.
    pub async fn next(&mut self) -> Option<ChangeNotice> {
        match self.rx.recv().await {
            Ok(notice) => Some(notice),
            Err(broadcast::error::RecvError::Lagged(_)) => Some(ChangeNotice),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Sending half, owned by a store binding.
#[derive(Debug, Clone)]
pub(crate) struct ChangeBus {
    tx: broadcast::Sender<ChangeNotice>,
}

impl ChangeBus {
    pub(crate) fn new() -> Self {
        // Small buffer: receivers that fall behind observe a lag, which
        // ChangeListener::next collapses into one coalesced notice.
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Notify all listeners. A send error only means nobody is listening.
    pub(crate) fn notify(&self) {
        let _ = self.tx.send(ChangeNotice);
    }

    pub(crate) fn listener(&self) -> ChangeListener {
        ChangeListener {
            rx: self.tx.subscribe(),
        }
    }
}
