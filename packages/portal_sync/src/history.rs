//! HistorySynchronizer: one conversation's pull-fetched baseline merged with
//! push-delivered messages.
//!
//! The merged list is keyed by message id, totally ordered by `created_at`
//! (ties broken by id), and regrouped by local calendar day after every
//! mutation. Messages without a server id are never merged: only canonical
//! records can be deduplicated.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use tracing::{debug, trace};

use crate::models::{ConversationKey, Message, MessageId, UserId};

/// Messages sharing one local calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateGroup {
    pub date: NaiveDate,
    pub messages: Vec<Message>,
}

/// Render-ready view of a conversation. Rebuilt on every merge, never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedHistory {
    groups: Vec<DateGroup>,
}

impl MergedHistory {
    /// Group already-sorted messages, starting a new group whenever the local
    /// calendar day differs from the previous message's.
    pub fn from_sorted(messages: &[Message], offset: FixedOffset) -> Self {
        let mut groups: Vec<DateGroup> = Vec::new();
        for msg in messages {
            let date = msg.created_at.with_timezone(&offset).date_naive();
            match groups.last_mut() {
                Some(group) if group.date == date => group.messages.push(msg.clone()),
                _ => groups.push(DateGroup {
                    date,
                    messages: vec![msg.clone()],
                }),
            }
        }
        Self { groups }
    }

    pub fn groups(&self) -> &[DateGroup] {
        &self.groups
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.groups.iter().flat_map(|g| g.messages.iter())
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages().filter_map(|m| m.id).collect()
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.groups.last().and_then(|g| g.messages.last())
    }

    /// Messages from someone other than `viewer` created after `read_marker`.
    pub fn unread_from(&self, viewer: UserId, read_marker: Option<DateTime<Utc>>) -> usize {
        self.messages()
            .filter(|m| m.sender_id != viewer)
            .filter(|m| read_marker.is_none_or(|marker| m.created_at > marker))
            .count()
    }
}

/// Merges baseline and live messages for a single conversation.
#[derive(Debug, Clone)]
pub struct HistorySynchronizer {
    key: ConversationKey,
    offset: FixedOffset,
    by_id: HashMap<MessageId, Message>,
    merged: MergedHistory,
}

impl HistorySynchronizer {
    /// Create with the local timezone's current offset for date grouping.
    pub fn new(key: ConversationKey, baseline: Vec<Message>) -> Self {
        Self::with_offset(key, baseline, *Local::now().offset())
    }

    pub fn with_offset(key: ConversationKey, baseline: Vec<Message>, offset: FixedOffset) -> Self {
        let mut sync = Self {
            key,
            offset,
            by_id: HashMap::new(),
            merged: MergedHistory::default(),
        };
        sync.absorb(baseline);
        sync.rebuild();
        sync
    }

    pub fn key(&self) -> ConversationKey {
        self.key
    }

    pub fn history(&self) -> &MergedHistory {
        &self.merged
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Merge one push-delivered message. Returns true if the history changed.
    ///
    /// Messages for other conversations and ids already present are ignored.
    pub fn apply_live_message(&mut self, msg: &Message) -> bool {
        if !self.key.matches(msg) {
            trace!(conversation = %self.key, "ignoring message for another conversation");
            return false;
        }
        let Some(id) = msg.id else {
            debug!(conversation = %self.key, "ignoring live message without id");
            return false;
        };
        if self.by_id.contains_key(&id) {
            trace!(conversation = %self.key, id, "duplicate delivery ignored");
            return false;
        }
        self.by_id.insert(id, msg.clone());
        self.rebuild();
        true
    }

    /// Append the canonical record returned by our own pull-path write.
    /// Same identity rules as a live message.
    pub fn record_sent(&mut self, canonical: &Message) -> bool {
        self.apply_live_message(canonical)
    }

    /// Swap in a freshly fetched baseline.
    ///
    /// Baseline records replace any held copy with the same id. Live records
    /// the new baseline does not mention are kept, since they may have
    /// arrived while the fetch was in flight.
    pub fn replace_baseline(&mut self, baseline: Vec<Message>) {
        let before = self.by_id.len();
        self.absorb(baseline);
        self.rebuild();
        debug!(
            conversation = %self.key,
            before,
            after = self.by_id.len(),
            "baseline replaced"
        );
    }

    fn absorb(&mut self, baseline: Vec<Message>) {
        for msg in baseline {
            if !self.key.matches(&msg) {
                continue;
            }
            if let Some(id) = msg.id {
                self.by_id.insert(id, msg);
            }
        }
    }

    fn rebuild(&mut self) {
        let mut messages: Vec<Message> = self.by_id.values().cloned().collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        self.merged = MergedHistory::from_sorted(&messages, self.offset);
    }
}
