use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

// =============================================================================
// Unified config (figment-deserialized from defaults / portal_sync.toml / env)
// =============================================================================
//
//   portal_sync.toml:  [connection]
//                      max_retries = 8
//
//   env var:           PORTAL_SYNC_CONNECTION__MAX_RETRIES=8
//                      (double underscore = nesting)

pub const CONFIG_FILE_NAME: &str = "portal_sync.toml";
pub const ENV_PREFIX: &str = "PORTAL_SYNC_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub notifications: NotificationFileConfig,
    #[serde(default)]
    pub routes: RoutesFileConfig,
}

/// Push channel tunables (lives under `[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    /// Origin of the page hosting the portal. Its scheme picks `ws` or `wss`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_push_path")]
    pub push_path: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Frames queued for the writer before `send` starts returning false.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            push_path: default_push_path(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Notification polling tunables (lives under `[notifications]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationFileConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_feed_limit")]
    pub feed_limit: u32,
}

impl Default for NotificationFileConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            feed_limit: default_feed_limit(),
        }
    }
}

/// Pull endpoint path templates (lives under `[routes]`).
///
/// Placeholders: `{user_id}`, `{project_id}`, `{activity_id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutesFileConfig {
    #[serde(default = "default_direct_history")]
    pub direct_history: String,
    #[serde(default = "default_project_history")]
    pub project_history: String,
    #[serde(default = "default_create_message")]
    pub create_message: String,
    #[serde(default = "default_unread_messages")]
    pub unread_messages: String,
    #[serde(default = "default_unread_activities")]
    pub unread_activities: String,
    #[serde(default = "default_active_tracking")]
    pub active_tracking: String,
    #[serde(default = "default_mark_activity_read")]
    pub mark_activity_read: String,
}

impl Default for RoutesFileConfig {
    fn default() -> Self {
        Self {
            direct_history: default_direct_history(),
            project_history: default_project_history(),
            create_message: default_create_message(),
            unread_messages: default_unread_messages(),
            unread_activities: default_unread_activities(),
            active_tracking: default_active_tracking(),
            mark_activity_read: default_mark_activity_read(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_push_path() -> String {
    "/ws".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_outbound_buffer() -> usize {
    64
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_feed_limit() -> u32 {
    10
}
fn default_direct_history() -> String {
    "/api/messages/direct/{user_id}".to_string()
}
fn default_project_history() -> String {
    "/api/messages/project/{project_id}".to_string()
}
fn default_create_message() -> String {
    "/api/messages".to_string()
}
fn default_unread_messages() -> String {
    "/api/messages/unread".to_string()
}
fn default_unread_activities() -> String {
    "/api/activities/unread".to_string()
}
fn default_active_tracking() -> String {
    "/api/tracking/active".to_string()
}
fn default_mark_activity_read() -> String {
    "/api/activities/{activity_id}/read".to_string()
}

/// Build a figment that layers defaults, then `portal_sync.toml` in `dir`,
/// then `PORTAL_SYNC_*` env vars.
pub fn load_config(dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(dir.join(CONFIG_FILE_NAME)))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

impl FileConfig {
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(load_config(dir).extract()?)
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Notification polling configuration (runtime view).
#[derive(Clone, Debug)]
pub struct PollConfig {
    pub interval: Duration,
    pub feed_limit: u32,
}

impl PollConfig {
    pub fn from_file(fc: &NotificationFileConfig) -> Self {
        Self {
            // A zero interval would spin; clamp to one second.
            interval: Duration::from_secs(fc.poll_interval_secs.max(1)),
            feed_limit: fc.feed_limit,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from_file(&NotificationFileConfig::default())
    }
}
