use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api::PullApi;
use crate::connection::{ConnectionManager, ReconnectPolicy};
use crate::dispatch::Dispatcher;
use crate::error::{Result, SyncError};
use crate::models::{
    Activity, ConversationKey, Message, OutgoingMessage, ProjectId, TrackingItem, UserId,
};
use crate::transport::{Channel, ChannelEvent, Connector};

/// 2024-03-01T00:00:00Z plus `secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_709_251_200 + secs, 0).unwrap()
}

pub fn direct_message(id: i64, from: UserId, to: UserId, secs: i64) -> Message {
    Message {
        id: Some(id),
        sender_id: from,
        recipient_id: Some(to),
        project_id: None,
        content: format!("message {}", id),
        attachments: Vec::new(),
        created_at: at(secs),
    }
}

pub fn activity(id: i64, is_read: bool, secs: i64) -> Activity {
    Activity {
        id,
        title: format!("activity {}", id),
        description: String::new(),
        is_read,
        created_at: at(secs),
    }
}

pub fn tracking(id: i64, secs: i64) -> TrackingItem {
    TrackingItem {
        id,
        title: format!("tracking {}", id),
        status: "in_progress".into(),
        project_id: None,
        created_at: at(secs),
    }
}

fn unavailable(route: &str) -> SyncError {
    SyncError::Status {
        route: route.to_string(),
        status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// In-memory stand-in for the portal's pull endpoints.
///
/// Feeds are plain fields the test rewrites between ticks; `fail` makes every
/// call return a 503.
#[derive(Default)]
pub struct FakePullApi {
    pub conversations: Mutex<HashMap<ConversationKey, Vec<Message>>>,
    pub unread_messages: Mutex<Vec<Message>>,
    pub activities: Mutex<Vec<Activity>>,
    pub tracking: Mutex<Vec<TrackingItem>>,
    pub marked_read: Mutex<Vec<i64>>,
    /// `limit` of every feed request, in call order.
    pub limits: Mutex<Vec<u32>>,
    pub fail: Mutex<bool>,
    pub clock: AtomicI64,
    next_id: AtomicI64,
}

impl FakePullApi {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn seed(&self, key: ConversationKey, messages: Vec<Message>) {
        self.conversations.lock().unwrap().insert(key, messages);
    }

    fn check(&self, route: &str) -> Result<()> {
        if *self.fail.lock().unwrap() {
            Err(unavailable(route))
        } else {
            Ok(())
        }
    }

    fn conversation(&self, key: ConversationKey) -> Vec<Message> {
        self.conversations
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }
}

impl PullApi for FakePullApi {
    async fn direct_history(&self, counterpart: UserId) -> Result<Vec<Message>> {
        self.check("direct_history")?;
        let conversations = self.conversations.lock().unwrap();
        Ok(conversations
            .iter()
            .filter(|(key, _)| {
                matches!(key, ConversationKey::Direct(pair) if pair.contains(counterpart))
            })
            .flat_map(|(_, msgs)| msgs.clone())
            .collect())
    }

    async fn project_history(&self, project_id: ProjectId) -> Result<Vec<Message>> {
        self.check("project_history")?;
        Ok(self.conversation(ConversationKey::Project(project_id)))
    }

    async fn create_message(&self, draft: &OutgoingMessage) -> Result<Message> {
        self.check("create_message")?;
        let msg = Message {
            id: Some(self.next_id.fetch_add(1, Ordering::SeqCst)),
            sender_id: draft.sender_id,
            recipient_id: draft.recipient_id,
            project_id: draft.project_id,
            content: draft.content.clone(),
            attachments: draft.attachments.clone(),
            created_at: at(self.clock.load(Ordering::SeqCst)),
        };
        if let Some(key) = msg.conversation_key() {
            self.conversations
                .lock()
                .unwrap()
                .entry(key)
                .or_default()
                .push(msg.clone());
        }
        Ok(msg)
    }

    async fn unread_messages(&self, limit: u32) -> Result<Vec<Message>> {
        self.check("unread_messages")?;
        self.limits.lock().unwrap().push(limit);
        Ok(self.unread_messages.lock().unwrap().clone())
    }

    async fn unread_activities(&self, limit: u32) -> Result<Vec<Activity>> {
        self.check("unread_activities")?;
        self.limits.lock().unwrap().push(limit);
        Ok(self.activities.lock().unwrap().clone())
    }

    async fn active_tracking(&self, limit: u32) -> Result<Vec<TrackingItem>> {
        self.check("active_tracking")?;
        self.limits.lock().unwrap().push(limit);
        Ok(self.tracking.lock().unwrap().clone())
    }

    async fn mark_activity_read(&self, activity_id: i64) -> Result<()> {
        self.check("mark_activity_read")?;
        self.marked_read.lock().unwrap().push(activity_id);
        for activity in self.activities.lock().unwrap().iter_mut() {
            if activity.id == activity_id {
                activity.is_read = true;
            }
        }
        Ok(())
    }
}

// --- Scripted push channel ---

pub enum Step {
    Open(Channel),
    Fail,
}

/// Server side of a scripted channel.
pub struct Remote {
    pub tx: mpsc::Sender<ChannelEvent>,
    pub rx: mpsc::Receiver<String>,
}

pub fn channel_pair() -> (Channel, Remote) {
    let (out_tx, out_rx) = mpsc::channel(8);
    let (in_tx, in_rx) = mpsc::channel(8);
    (
        Channel {
            outbound: out_tx,
            inbound: in_rx,
        },
        Remote {
            tx: in_tx,
            rx: out_rx,
        },
    )
}

/// Connector that replays a fixed script of opens and failures, then fails
/// forever. Records the (paused-clock) instant of every open attempt.
#[derive(Default)]
pub struct ScriptedConnector {
    steps: Mutex<VecDeque<Step>>,
    pub opens: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedConnector {
    pub fn with(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            opens: Arc::default(),
        }
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, _endpoint: &Url) -> impl Future<Output = Result<Channel>> + Send {
        self.opens.lock().unwrap().push(Instant::now());
        let step = self.steps.lock().unwrap().pop_front();
        async move {
            match step {
                Some(Step::Open(channel)) => Ok(channel),
                Some(Step::Fail) | None => Err(SyncError::Transport("refused".into())),
            }
        }
    }
}

pub fn scripted_manager(
    connector: ScriptedConnector,
    dispatcher: Dispatcher,
) -> ConnectionManager<ScriptedConnector> {
    let endpoint = Url::parse("ws://portal.test/ws").unwrap();
    ConnectionManager::new(connector, endpoint, ReconnectPolicy::default(), dispatcher)
}

pub fn message_json(id: i64) -> String {
    serde_json::json!({
        "id": id,
        "senderId": 1,
        "recipientId": 2,
        "content": "hello",
        "createdAt": "2024-03-01T10:00:00Z"
    })
    .to_string()
}
