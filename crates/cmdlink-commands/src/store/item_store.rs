//! REST client for a Directus-style item store.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use cmdlink_core::StoreConfig;

use super::{CommandReportSink, PendingCommandSource, StoreError, StoreResult};
use crate::command::{Command, CommandStatus, CommandUpdate};

#[derive(Debug, Deserialize)]
struct ItemsResponse<T> {
    data: T,
}

/// Item store client.
pub struct ItemStoreClient {
    base_url: String,
    token: String,
    collection: String,
    http_client: reqwest::Client,
}

impl ItemStoreClient {
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            collection: config.collection.clone(),
            http_client,
        })
    }

    fn items_url(&self) -> String {
        format!("{}/items/{}", self.base_url, self.collection)
    }

    fn item_url(&self, id: &str) -> String {
        format!("{}/{}", self.items_url(), id)
    }

    fn add_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(&self.token)
    }

    async fn check(response: reqwest::Response, id: Option<&str>) -> StoreResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match (status, id) {
            (reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN, _) => {
                Err(StoreError::Unauthorized)
            }
            (reqwest::StatusCode::NOT_FOUND, Some(id)) => Err(StoreError::NotFound(id.to_string())),
            _ => Err(StoreError::UnexpectedStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn patch(&self, id: &str, update: &CommandUpdate) -> StoreResult<()> {
        let response = self
            .add_auth(self.http_client.patch(self.item_url(id)))
            .json(update)
            .send()
            .await?;
        Self::check(response, Some(id)).await?;
        debug!(command_id = %id, "Command record updated");
        Ok(())
    }
}

#[async_trait]
impl PendingCommandSource for ItemStoreClient {
    async fn fetch_pending(&self, limit: usize) -> StoreResult<Vec<Command>> {
        let limit = limit.to_string();
        let response = self
            .add_auth(self.http_client.get(self.items_url()))
            .query(&[
                ("filter[status][_eq]", CommandStatus::Pending.as_str()),
                ("sort", "date_created"),
                ("limit", limit.as_str()),
                ("fields", "*,device.*"),
            ])
            .send()
            .await?;

        let body: ItemsResponse<Vec<serde_json::Value>> = Self::check(response, None)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;

        // Malformed records are skipped individually
        let mut commands = Vec::with_capacity(body.data.len());
        for item in body.data {
            match serde_json::from_value::<Command>(item) {
                Ok(command) => commands.push(command),
                Err(e) => warn!(error = %e, "Skipping malformed command record"),
            }
        }
        Ok(commands)
    }

    async fn mark_unroutable(&self, id: &str, reason: &str) -> StoreResult<()> {
        self.patch(id, &CommandUpdate::unroutable(reason)).await
    }
}

#[async_trait]
impl CommandReportSink for ItemStoreClient {
    async fn apply_report(&self, id: &str, update: &CommandUpdate) -> StoreResult<()> {
        self.patch(id, update).await
    }
}
