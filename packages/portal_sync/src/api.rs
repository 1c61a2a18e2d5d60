//! Pull path: request/response calls against the portal's HTTP API.
//!
//! The route shapes belong to the surrounding application, so [`HttpPullApi`]
//! takes them from `[routes]` in the config. Failures are returned to the
//! caller unchanged; nothing here retries.

use std::future::Future;

use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::{FileConfig, RoutesFileConfig};
use crate::error::{Result, SyncError};
use crate::models::{
    Activity, ConversationKey, Message, OutgoingMessage, ProjectId, TrackingItem, UserId,
};

/// Authoritative reads and writes the core depends on.
pub trait PullApi: Send + Sync + 'static {
    fn direct_history(&self, counterpart: UserId)
    -> impl Future<Output = Result<Vec<Message>>> + Send;

    fn project_history(
        &self,
        project_id: ProjectId,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// Persist a message; resolves with the canonical record carrying its id.
    fn create_message(
        &self,
        draft: &OutgoingMessage,
    ) -> impl Future<Output = Result<Message>> + Send;

    fn unread_messages(&self, limit: u32) -> impl Future<Output = Result<Vec<Message>>> + Send;

    fn unread_activities(&self, limit: u32)
    -> impl Future<Output = Result<Vec<Activity>>> + Send;

    fn active_tracking(&self, limit: u32)
    -> impl Future<Output = Result<Vec<TrackingItem>>> + Send;

    fn mark_activity_read(&self, activity_id: i64) -> impl Future<Output = Result<()>> + Send;

    /// History for whichever conversation `key` names, as seen by `viewer`.
    fn history(
        &self,
        key: ConversationKey,
        viewer: UserId,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send {
        async move {
            match key {
                ConversationKey::Project(project_id) => self.project_history(project_id).await,
                ConversationKey::Direct(pair) => self.direct_history(pair.other(viewer)).await,
            }
        }
    }
}

/// Resolved route table (runtime view of `[routes]`).
#[derive(Clone, Debug)]
pub struct Routes {
    pub direct_history: String,
    pub project_history: String,
    pub create_message: String,
    pub unread_messages: String,
    pub unread_activities: String,
    pub active_tracking: String,
    pub mark_activity_read: String,
}

impl Routes {
    pub fn from_file(fc: &RoutesFileConfig) -> Self {
        Self {
            direct_history: fc.direct_history.clone(),
            project_history: fc.project_history.clone(),
            create_message: fc.create_message.clone(),
            unread_messages: fc.unread_messages.clone(),
            unread_activities: fc.unread_activities.clone(),
            active_tracking: fc.active_tracking.clone(),
            mark_activity_read: fc.mark_activity_read.clone(),
        }
    }
}

impl Default for Routes {
    fn default() -> Self {
        Self::from_file(&RoutesFileConfig::default())
    }
}

/// Substitute `{name}` placeholders in a route template.
fn fill(template: &str, params: &[(&str, i64)]) -> String {
    params.iter().fold(template.to_string(), |route, (name, value)| {
        route.replace(&format!("{{{}}}", name), &value.to_string())
    })
}

/// reqwest-backed [`PullApi`].
#[derive(Clone)]
pub struct HttpPullApi {
    client: reqwest::Client,
    base: Url,
    routes: Routes,
}

impl HttpPullApi {
    pub fn new(client: reqwest::Client, base_url: &str, routes: Routes) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| SyncError::InvalidEndpoint(format!("{}: {}", base_url, e)))?;
        Ok(Self {
            client,
            base,
            routes,
        })
    }

    /// Pull client for the origin in `[connection]` and the routes in `[routes]`.
    pub fn from_config(client: reqwest::Client, config: &FileConfig) -> Result<Self> {
        Self::new(
            client,
            &config.connection.base_url,
            Routes::from_file(&config.routes),
        )
    }

    fn url(&self, route: &str) -> Result<Url> {
        self.base
            .join(route)
            .map_err(|e| SyncError::InvalidEndpoint(format!("{}: {}", route, e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, route: String, limit: Option<u32>) -> Result<T> {
        let mut request = self.client.get(self.url(&route)?);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status { route, status });
        }
        debug!(route = %route, "pull fetch ok");
        Ok(response.json::<T>().await?)
    }
}

impl PullApi for HttpPullApi {
    async fn direct_history(&self, counterpart: UserId) -> Result<Vec<Message>> {
        let route = fill(&self.routes.direct_history, &[("user_id", counterpart)]);
        self.get_json(route, None).await
    }

    async fn project_history(&self, project_id: ProjectId) -> Result<Vec<Message>> {
        let route = fill(&self.routes.project_history, &[("project_id", project_id)]);
        self.get_json(route, None).await
    }

    async fn create_message(&self, draft: &OutgoingMessage) -> Result<Message> {
        let route = self.routes.create_message.clone();
        let response = self
            .client
            .post(self.url(&route)?)
            .json(draft)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status { route, status });
        }
        Ok(response.json::<Message>().await?)
    }

    async fn unread_messages(&self, limit: u32) -> Result<Vec<Message>> {
        self.get_json(self.routes.unread_messages.clone(), Some(limit))
            .await
    }

    async fn unread_activities(&self, limit: u32) -> Result<Vec<Activity>> {
        self.get_json(self.routes.unread_activities.clone(), Some(limit))
            .await
    }

    async fn active_tracking(&self, limit: u32) -> Result<Vec<TrackingItem>> {
        self.get_json(self.routes.active_tracking.clone(), Some(limit))
            .await
    }

    async fn mark_activity_read(&self, activity_id: i64) -> Result<()> {
        let route = fill(
            &self.routes.mark_activity_read,
            &[("activity_id", activity_id)],
        );
        let response = self.client.post(self.url(&route)?).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status { route, status });
        }
        Ok(())
    }
}
