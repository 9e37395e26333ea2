//! Caller-side handle to a background event stream and its publishing half.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{BotError, Result};
use crate::listener::events::{
    Notification, SubscriptionConversation, SubscriptionMessage, SubscriptionWalletEvent,
};

/// Handle to a running listener.
///
/// Cloning is cheap and every clone reads from the same channels, so an
/// event is delivered to exactly one reader. Reads block until an event of
/// the requested category arrives, an error is published, or the
/// subscription shuts down.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

struct Inner {
    messages: Mutex<mpsc::Receiver<SubscriptionMessage>>,
    conversations: Mutex<mpsc::Receiver<SubscriptionConversation>>,
    wallet: Mutex<mpsc::Receiver<SubscriptionWalletEvent>>,
    errors: Mutex<mpsc::Receiver<BotError>>,
    cancel: CancellationToken,
    fired: AtomicBool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Subscription {
    /// Create a subscription whose channels each hold `capacity` items.
    pub(crate) fn channel(capacity: usize) -> (Self, Publisher) {
        let capacity = capacity.max(1);
        let (msg_tx, msg_rx) = mpsc::channel(capacity);
        let (conv_tx, conv_rx) = mpsc::channel(capacity);
        let (wallet_tx, wallet_rx) = mpsc::channel(capacity);
        let (err_tx, err_rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();

        let subscription = Self {
            inner: Arc::new(Inner {
                messages: Mutex::new(msg_rx),
                conversations: Mutex::new(conv_rx),
                wallet: Mutex::new(wallet_rx),
                errors: Mutex::new(err_rx),
                cancel: cancel.clone(),
                fired: AtomicBool::new(false),
            }),
        };
        let publisher = Publisher {
            messages: msg_tx,
            conversations: conv_tx,
            wallet: wallet_tx,
            errors: err_tx,
            cancel,
            capacity,
        };
        (subscription, publisher)
    }

    /// Next chat message.
    ///
    /// # Errors
    ///
    /// Any error published by the listener, or
    /// [`BotError::SubscriptionShutdown`] once the subscription has stopped.
    pub async fn read(&self) -> Result<SubscriptionMessage> {
        self.read_from(&self.inner.messages).await
    }

    /// Next conversation event (requires `ListenOptions::convs`).
    pub async fn read_conversation(&self) -> Result<SubscriptionConversation> {
        self.read_from(&self.inner.conversations).await
    }

    /// Next wallet event (requires `ListenOptions::wallet`).
    pub async fn read_wallet(&self) -> Result<SubscriptionWalletEvent> {
        self.read_from(&self.inner.wallet).await
    }

    /// Stop the listener. Safe to call any number of times from any clone.
    pub fn shutdown(&self) {
        if !self.inner.fired.swap(true, Ordering::SeqCst) {
            info!("Subscription shutting down");
            self.inner.cancel.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    async fn read_from<T>(&self, channel: &Mutex<mpsc::Receiver<T>>) -> Result<T> {
        let cancel = &self.inner.cancel;
        if cancel.is_cancelled() {
            return Err(BotError::SubscriptionShutdown);
        }
        // Errors first, so a bad line is reported before the events after it.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BotError::SubscriptionShutdown),
            err = async { self.inner.errors.lock().await.recv().await } => match err {
                Some(err) => Err(err),
                None => channel
                    .lock()
                    .await
                    .try_recv()
                    .map_err(|_| BotError::SubscriptionShutdown),
            },
            item = async { channel.lock().await.recv().await } => match item {
                Some(item) => Ok(item),
                None => Err(self.pending_error().await),
            },
        }
    }

    /// An error left behind by a listener that has already stopped.
    async fn pending_error(&self) -> BotError {
        self.inner
            .errors
            .lock()
            .await
            .try_recv()
            .unwrap_or(BotError::SubscriptionShutdown)
    }
}

/// Listener-side half of a [`Subscription`].
#[derive(Clone)]
pub(crate) struct Publisher {
    messages: mpsc::Sender<SubscriptionMessage>,
    conversations: mpsc::Sender<SubscriptionConversation>,
    wallet: mpsc::Sender<SubscriptionWalletEvent>,
    errors: mpsc::Sender<BotError>,
    cancel: CancellationToken,
    capacity: usize,
}

impl Publisher {
    /// Route a decoded line to its channel.
    ///
    /// Blocks while the target channel is full. Returns `false` once the
    /// subscription is shut down or every reader is gone.
    pub(crate) async fn publish(&self, notification: Result<Notification>) -> bool {
        match notification {
            Ok(Notification::ChatMessage(msg)) => self.deliver(&self.messages, msg, "message").await,
            Ok(Notification::ChatConversation(conv)) => {
                self.deliver(&self.conversations, conv, "conversation").await
            }
            Ok(Notification::Wallet(event)) => self.deliver(&self.wallet, event, "wallet").await,
            Ok(Notification::Unknown(_)) => true,
            Err(e) => self.error(e).await,
        }
    }

    /// Push a listener error to readers.
    pub(crate) async fn error(&self, err: BotError) -> bool {
        self.deliver(&self.errors, err, "error").await
    }

    async fn deliver<T>(&self, tx: &mpsc::Sender<T>, item: T, category: &str) -> bool {
        let queued = self.capacity.saturating_sub(tx.capacity());
        if queued * 2 > self.capacity {
            warn!(
                "{} channel over half full ({}/{}), reader is falling behind",
                category, queued, self.capacity
            );
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = tx.send(item) => sent.is_ok(),
        }
    }
}
