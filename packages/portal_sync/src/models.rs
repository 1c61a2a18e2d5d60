use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub type UserId = i64;
pub type ProjectId = i64;
pub type MessageId = i64;

// === Message models ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A chat message as delivered by either the pull path or the push channel.
///
/// `id` is assigned by the server when the message is created. Records without
/// one never enter a merged history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: Option<MessageId>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// The conversation this message routes to, derived from its addressing.
    ///
    /// Project messages route by project id even when a recipient is also set.
    pub fn conversation_key(&self) -> Option<ConversationKey> {
        if let Some(project_id) = self.project_id {
            return Some(ConversationKey::Project(project_id));
        }
        self.recipient_id
            .map(|recipient| ConversationKey::direct(self.sender_id, recipient))
    }

    /// Decode one push-channel text frame.
    pub fn from_frame(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A message draft sent to the create endpoint, before the server assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl OutgoingMessage {
    /// Address a draft at `key` on behalf of `sender_id`.
    ///
    /// For direct conversations the recipient is whichever member of the pair
    /// is not the sender.
    pub fn to(key: ConversationKey, sender_id: UserId, content: impl Into<String>) -> Self {
        let (recipient_id, project_id) = match key {
            ConversationKey::Project(project_id) => (None, Some(project_id)),
            ConversationKey::Direct(pair) => (Some(pair.other(sender_id)), None),
        };
        Self {
            sender_id,
            recipient_id,
            project_id,
            content: content.into(),
            attachments: Vec::new(),
        }
    }
}

// === Conversation identity ===

/// Unordered pair of users. `{a, b}` and `{b, a}` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserPair {
    low: UserId,
    high: UserId,
}

impl UserPair {
    pub fn new(a: UserId, b: UserId) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// The member of the pair that is not `user`. A self-conversation returns `user`.
    pub fn other(&self, user: UserId) -> UserId {
        if self.low == user { self.high } else { self.low }
    }

    pub fn members(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Project(ProjectId),
    Direct(UserPair),
}

impl ConversationKey {
    pub fn direct(a: UserId, b: UserId) -> Self {
        ConversationKey::Direct(UserPair::new(a, b))
    }

    pub fn matches(&self, msg: &Message) -> bool {
        msg.conversation_key().as_ref() == Some(self)
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationKey::Project(id) => write!(f, "project:{}", id),
            ConversationKey::Direct(pair) => {
                let (a, b) = pair.members();
                write!(f, "direct:{}-{}", a, b)
            }
        }
    }
}

// === Notification source records ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingItem {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub created_at: DateTime<Utc>,
}

// === Notification models ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Message,
    Activity,
    Tracking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationKey {
    pub source_type: SourceType,
    pub source_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    pub key: NotificationKey,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl NotificationItem {
    pub fn source_type(&self) -> SourceType {
        self.key.source_type
    }

    /// Unread messages are unread by construction of the feed.
    /// Returns `None` for records without a server id.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let id = msg.id?;
        Some(Self {
            key: NotificationKey {
                source_type: SourceType::Message,
                source_id: id,
            },
            title: "New message".to_string(),
            description: preview(&msg.content),
            created_at: msg.created_at,
            is_read: false,
        })
    }

    pub fn from_activity(activity: &Activity) -> Self {
        Self {
            key: NotificationKey {
                source_type: SourceType::Activity,
                source_id: activity.id,
            },
            title: activity.title.clone(),
            description: activity.description.clone(),
            created_at: activity.created_at,
            is_read: activity.is_read,
        }
    }

    /// Active tracking items count as unread for as long as the feed returns them.
    pub fn from_tracking(item: &TrackingItem) -> Self {
        Self {
            key: NotificationKey {
                source_type: SourceType::Tracking,
                source_id: item.id,
            },
            title: item.title.clone(),
            description: item.status.clone(),
            created_at: item.created_at,
            is_read: false,
        }
    }
}

const PREVIEW_CHARS: usize = 80;

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}
