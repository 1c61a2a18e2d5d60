//! NotificationAggregator: three polled feeds merged into one bell.
//!
//! Each tick re-queries unread messages, unread activities and active
//! tracking items, rebuilds the notification list newest-first keyed by
//! `(source_type, source_id)`, and fires `on_new_notification` only when the
//! total unread count strictly increases over the previous tick.
//!
//! "Has unseen" is separate from "data changed": a tick can only set it, and
//! only the consumer clears it with [`NotificationAggregator::acknowledge`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::PullApi;
use crate::config::PollConfig;
use crate::dispatch::{Registry, Subscription};
use crate::error::Result;
use crate::models::{
    Activity, Message, NotificationItem, NotificationKey, SourceType, TrackingItem,
};
use crate::schedule::ScheduledTask;

/// Per-feed change since the previous tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedDelta {
    /// Keys present now that were absent on the previous tick.
    pub new_items: usize,
    pub unread: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedDeltas {
    pub messages: FeedDelta,
    pub activities: FeedDelta,
    pub tracking: FeedDelta,
}

impl FeedDeltas {
    fn get_mut(&mut self, source: SourceType) -> &mut FeedDelta {
        match source {
            SourceType::Message => &mut self.messages,
            SourceType::Activity => &mut self.activities,
            SourceType::Tracking => &mut self.tracking,
        }
    }
}

/// Payload of `on_new_notification`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotifications {
    pub unread_total: usize,
    pub previous_unread: usize,
    pub deltas: FeedDeltas,
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub items: usize,
    pub unread_total: usize,
    pub previous_unread: usize,
    pub deltas: FeedDeltas,
    pub notified: bool,
}

#[derive(Default)]
struct BellState {
    items: Vec<NotificationItem>,
    /// Displayed count; local mark-reads lower it between ticks.
    unread_total: usize,
    /// Count the last successful tick reported. Only `apply` writes it.
    last_tick_unread: usize,
    has_unseen: bool,
    ticks: u64,
}

/// Merge the three feeds into one list, newest first. A key repeated within
/// the input keeps its last occurrence.
pub fn merge_feeds(
    messages: &[Message],
    activities: &[Activity],
    tracking: &[TrackingItem],
) -> Vec<NotificationItem> {
    let mut by_key: HashMap<NotificationKey, NotificationItem> = HashMap::new();
    let items = messages
        .iter()
        .filter_map(NotificationItem::from_message)
        .chain(activities.iter().map(NotificationItem::from_activity))
        .chain(tracking.iter().map(NotificationItem::from_tracking));
    for item in items {
        by_key.insert(item.key, item);
    }

    let mut merged: Vec<NotificationItem> = by_key.into_values().collect();
    merged.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.key.cmp(&b.key))
    });
    merged
}

fn unread(items: &[NotificationItem]) -> usize {
    items.iter().filter(|i| !i.is_read).count()
}

pub struct NotificationAggregator<A: PullApi> {
    api: Arc<A>,
    feed_limit: u32,
    state: Mutex<BellState>,
    listeners: Registry<NewNotifications>,
}

impl<A: PullApi> NotificationAggregator<A> {
    pub fn new(api: Arc<A>, feed_limit: u32) -> Self {
        Self {
            api,
            feed_limit,
            state: Mutex::new(BellState::default()),
            listeners: Registry::new(),
        }
    }

    /// Aggregator fetching `feed_limit` records per feed from `[notifications]`.
    pub fn from_config(api: Arc<A>, config: &PollConfig) -> Self {
        Self::new(api, config.feed_limit)
    }

    pub fn feed_limit(&self) -> u32 {
        self.feed_limit
    }

    /// Re-query all three feeds and rebuild the list.
    ///
    /// If any feed fails the previous list is left untouched and the error is
    /// returned; the poller logs it and tries again next interval.
    pub async fn tick(&self) -> Result<TickReport> {
        let limit = self.feed_limit;
        let (messages, activities, tracking) = tokio::try_join!(
            self.api.unread_messages(limit),
            self.api.unread_activities(limit),
            self.api.active_tracking(limit),
        )?;
        let items = merge_feeds(&messages, &activities, &tracking);

        let (report, event) = self.apply(items);
        if let Some(event) = event {
            info!(
                unread = event.unread_total,
                previous = event.previous_unread,
                "new notifications"
            );
            self.listeners.emit(&event);
        }
        Ok(report)
    }

    fn apply(&self, items: Vec<NotificationItem>) -> (TickReport, Option<NewNotifications>) {
        let mut state = self.lock();

        let previous_keys: HashSet<NotificationKey> = state.items.iter().map(|i| i.key).collect();
        let mut deltas = FeedDeltas::default();
        for item in &items {
            let delta = deltas.get_mut(item.source_type());
            if !previous_keys.contains(&item.key) {
                delta.new_items += 1;
            }
            if !item.is_read {
                delta.unread += 1;
            }
        }

        let previous_unread = state.last_tick_unread;
        let unread_total = unread(&items);
        let notified = unread_total > previous_unread;

        state.ticks += 1;
        state.unread_total = unread_total;
        state.last_tick_unread = unread_total;
        if notified {
            state.has_unseen = true;
        }
        let report = TickReport {
            items: items.len(),
            unread_total,
            previous_unread,
            deltas,
            notified,
        };
        state.items = items;
        debug!(tick = state.ticks, items = report.items, unread_total, "notification tick");

        let event = notified.then(|| NewNotifications {
            unread_total,
            previous_unread,
            deltas,
        });
        (report, event)
    }

    /// Mark an activity read on the server, then locally. Never fires
    /// `on_new_notification`, and leaves the baseline the next tick compares
    /// against untouched.
    pub async fn mark_activity_read(&self, activity_id: i64) -> Result<()> {
        self.api.mark_activity_read(activity_id).await?;

        let mut state = self.lock();
        let key = NotificationKey {
            source_type: SourceType::Activity,
            source_id: activity_id,
        };
        if let Some(item) = state.items.iter_mut().find(|i| i.key == key) {
            item.is_read = true;
        }
        state.unread_total = unread(&state.items);
        Ok(())
    }

    pub fn on_new_notification<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&NewNotifications) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    pub fn items(&self) -> Vec<NotificationItem> {
        self.lock().items.clone()
    }

    pub fn unread_total(&self) -> usize {
        self.lock().unread_total
    }

    pub fn has_unseen(&self) -> bool {
        self.lock().has_unseen
    }

    /// The user opened the notification list.
    pub fn acknowledge(&self) {
        self.lock().has_unseen = false;
    }

    fn lock(&self) -> MutexGuard<'_, BellState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drives an aggregator on a fixed interval, ticking once immediately.
pub struct NotificationPoller {
    task: ScheduledTask,
    interval: Duration,
}

impl NotificationPoller {
    pub fn new(config: &PollConfig) -> Self {
        Self {
            task: ScheduledTask::new("notification-poll"),
            interval: config.interval,
        }
    }

    /// Returns false if already polling.
    pub fn start<A: PullApi>(&self, aggregator: Arc<NotificationAggregator<A>>) -> bool {
        self.task.start(self.interval, move || {
            let aggregator = aggregator.clone();
            async move {
                if let Err(e) = aggregator.tick().await {
                    warn!(error = %e, "notification poll failed");
                }
            }
        })
    }

    pub fn stop(&self) -> bool {
        self.task.stop()
    }

    pub fn is_active(&self) -> bool {
        self.task.is_active()
    }
}
