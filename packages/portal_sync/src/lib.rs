//! Real-time messaging synchronization core for the project portal.
//!
//! - [`connection`]: one push channel with exponential-backoff recovery
//! - [`dispatch`]: snapshot fan-out of inbound events to subscribers
//! - [`history`]: pull-fetched and push-delivered messages merged per conversation
//! - [`chat`]: an open conversation view with write-then-broadcast sends
//! - [`notifications`]: three polled feeds merged into one notification list
//!
//! The core never installs a tracing subscriber and never constructs global
//! state; the application builds one [`ConnectionManager`] and one
//! [`Dispatcher`] at its composition root and hands them to consumers.

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod models;
pub mod notifications;
pub mod schedule;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use api::{HttpPullApi, PullApi, Routes};
pub use chat::{ChatSession, SentMessage};
pub use config::{FileConfig, PollConfig, load_config};
pub use connection::{
    ConnectionFsm, ConnectionManager, ConnectionState, ConnectionStatus, ReconnectPolicy,
};
pub use dispatch::{Dispatcher, EventKind, Subscription};
pub use error::{Result, SyncError};
pub use history::{DateGroup, HistorySynchronizer, MergedHistory};
pub use models::{ConversationKey, Message, NotificationItem, OutgoingMessage, SourceType};
pub use notifications::{NotificationAggregator, NotificationPoller};
pub use schedule::ScheduledTask;
pub use transport::{Connector, WsConnector, push_endpoint};
