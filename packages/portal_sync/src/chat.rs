//! ChatSession: one open conversation view.
//!
//! Ties a [`HistorySynchronizer`] to the shared [`Dispatcher`] and the pull
//! path. Sending is write-then-broadcast: the pull-path create must succeed
//! first, its canonical record is merged locally, and only then is the same
//! record mirrored over the push channel for other sessions. The sender's
//! own view is never populated from its echo.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::PullApi;
use crate::connection::ConnectionManager;
use crate::dispatch::{Dispatcher, Subscription};
use crate::error::Result;
use crate::history::{HistorySynchronizer, MergedHistory};
use crate::models::{ConversationKey, Message, OutgoingMessage, UserId};
use crate::transport::Connector;

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message: Message,
    /// Whether the push mirror was handed to an open channel. Advisory only:
    /// the message is persisted either way.
    pub mirrored: bool,
}

pub struct ChatSession<A: PullApi> {
    key: ConversationKey,
    viewer: UserId,
    api: Arc<A>,
    sync: Arc<Mutex<HistorySynchronizer>>,
    updates: Arc<watch::Sender<MergedHistory>>,
    subscription: Option<Subscription>,
}

fn lock(sync: &Mutex<HistorySynchronizer>) -> MutexGuard<'_, HistorySynchronizer> {
    sync.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<A: PullApi> ChatSession<A> {
    /// Subscribe to live messages, then fetch the baseline.
    ///
    /// Subscribing first means a message pushed while the fetch is in flight
    /// is kept even if the fetch result predates it.
    pub async fn open(
        api: Arc<A>,
        dispatcher: &Dispatcher,
        key: ConversationKey,
        viewer: UserId,
    ) -> Result<Self> {
        Self::open_with(api, dispatcher, HistorySynchronizer::new(key, Vec::new()), viewer).await
    }

    /// Like [`ChatSession::open`], with a caller-built (empty or pre-seeded) synchronizer.
    pub async fn open_with(
        api: Arc<A>,
        dispatcher: &Dispatcher,
        sync: HistorySynchronizer,
        viewer: UserId,
    ) -> Result<Self> {
        let key = sync.key();
        let (updates, _) = watch::channel(sync.history().clone());
        let mut session = Self {
            key,
            viewer,
            api,
            sync: Arc::new(Mutex::new(sync)),
            updates: Arc::new(updates),
            subscription: None,
        };

        let sync = session.sync.clone();
        let updates = session.updates.clone();
        session.subscription = Some(dispatcher.on_message(move |msg| {
            let mut sync = lock(&sync);
            if sync.apply_live_message(msg) {
                updates.send_replace(sync.history().clone());
            }
        }));

        // On failure the session drops here, cancelling the subscription.
        session.refresh().await?;
        info!(conversation = %key, "chat session opened");
        Ok(session)
    }

    pub fn key(&self) -> ConversationKey {
        self.key
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    /// Snapshot of the current merged history.
    pub fn history(&self) -> MergedHistory {
        lock(&self.sync).history().clone()
    }

    /// Receiver that observes every republished history.
    pub fn watch(&self) -> watch::Receiver<MergedHistory> {
        self.updates.subscribe()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.as_ref().is_some_and(Subscription::is_active)
    }

    /// Re-query the pull source and merge the result as the new baseline.
    pub async fn refresh(&self) -> Result<()> {
        let baseline = self.api.history(self.key, self.viewer).await?;
        let mut sync = lock(&self.sync);
        sync.replace_baseline(baseline);
        self.updates.send_replace(sync.history().clone());
        Ok(())
    }

    /// Send plain text to this conversation.
    pub async fn send<C: Connector>(
        &self,
        content: impl Into<String>,
        push: &ConnectionManager<C>,
    ) -> Result<SentMessage> {
        let draft = OutgoingMessage::to(self.key, self.viewer, content);
        self.send_draft(&draft, push).await
    }

    /// Persist `draft` through the pull path, merge the canonical record, then
    /// mirror it over the push channel.
    ///
    /// A pull-path failure is returned and nothing is mirrored.
    pub async fn send_draft<C: Connector>(
        &self,
        draft: &OutgoingMessage,
        push: &ConnectionManager<C>,
    ) -> Result<SentMessage> {
        let canonical = self.api.create_message(draft).await?;

        {
            let mut sync = lock(&self.sync);
            if sync.record_sent(&canonical) {
                self.updates.send_replace(sync.history().clone());
            }
        }

        let mirrored = push.send(&canonical);
        if !mirrored {
            debug!(
                conversation = %self.key,
                id = ?canonical.id,
                "push mirror skipped, channel not open"
            );
        }
        Ok(SentMessage {
            message: canonical,
            mirrored,
        })
    }

    /// Stop receiving live messages. Dropping the session does the same.
    pub fn close(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        debug!(conversation = %self.key, "chat session closed");
    }
}
