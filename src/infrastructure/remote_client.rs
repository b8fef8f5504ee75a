use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTable {
    Users,
    Tasks,
    Movements,
    Melodies,
    TempoHistory,
    DailyCompositions,
}

impl RemoteTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Tasks => "tasks",
            Self::Movements => "movements",
            Self::Melodies => "melodies",
            Self::TempoHistory => "tempo_history",
            Self::DailyCompositions => "daily_compositions",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "users" => Some(Self::Users),
            "tasks" => Some(Self::Tasks),
            "movements" => Some(Self::Movements),
            "melodies" => Some(Self::Melodies),
            "tempo_history" => Some(Self::TempoHistory),
            "daily_compositions" => Some(Self::DailyCompositions),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
}

/// Row filter rendered as a `column=op.value` query pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl RemoteFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn gt(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Gt,
            value: value.into(),
        }
    }

    fn to_query_pair(&self) -> (String, String) {
        let op = match self.op {
            FilterOp::Eq => "eq",
            FilterOp::Gt => "gt",
        };
        (self.column.clone(), format!("{op}.{}", self.value))
    }
}

#[async_trait]
pub trait RemoteStoreClient: Send + Sync {
    async fn select(
        &self,
        table: RemoteTable,
        filters: &[RemoteFilter],
    ) -> Result<Vec<serde_json::Value>, InfraError>;

    /// Inserts `row`, replacing any row that already has its primary key.
    async fn insert(
        &self,
        table: RemoteTable,
        row: &serde_json::Value,
    ) -> Result<serde_json::Value, InfraError>;

    async fn update(
        &self,
        table: RemoteTable,
        id: &str,
        row: &serde_json::Value,
    ) -> Result<serde_json::Value, InfraError>;

    async fn delete(&self, table: RemoteTable, id: &str) -> Result<(), InfraError>;

    /// Cheapest possible round trip, used for connectivity checks.
    async fn ping(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestRemoteStoreClient {
    client: Client,
    base_url: Url,
    api_key: String,
    timeout_ms: u64,
}

impl ReqwestRemoteStoreClient {
    pub fn new(base_url: &str, api_key: &str, timeout_ms: u64) -> Result<Self, InfraError> {
        Self::ensure_non_empty(base_url, "remote base url")?;
        Self::ensure_non_empty(api_key, "remote api key")?;
        let base_url = Url::parse(base_url.trim())
            .map_err(|error| InfraError::InvalidConfig(format!("invalid remote base url: {error}")))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|error| InfraError::Remote(format!("failed to build http client: {error}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.trim().to_string(),
            timeout_ms,
        })
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::Validation(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn http_error(table: RemoteTable, status: reqwest::StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("remote {} error: http {}", table.as_str(), status.as_u16())
        } else {
            format!(
                "remote {} error: http {}; body={body}",
                table.as_str(),
                status.as_u16()
            )
        };
        InfraError::Remote(message)
    }

    fn transport_error(&self, action: &str, error: reqwest::Error) -> InfraError {
        if error.is_timeout() {
            return InfraError::Timeout(self.timeout_ms);
        }
        InfraError::Remote(format!("network error while {action}: {error}"))
    }

    fn table_endpoint(&self, table: RemoteTable) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("remote base url cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push(table.as_str());
        }
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn read_body(
        &self,
        table: RemoteTable,
        action: &str,
        response: reqwest::Response,
    ) -> Result<String, InfraError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| self.transport_error(action, error))?;
        if !status.is_success() {
            return Err(Self::http_error(table, status, &body));
        }
        Ok(body)
    }

    fn first_row(table: RemoteTable, body: &str) -> Result<serde_json::Value, InfraError> {
        let rows: Vec<serde_json::Value> = serde_json::from_str(body).map_err(|error| {
            InfraError::Remote(format!(
                "invalid {} payload: {error}; body={body}",
                table.as_str()
            ))
        })?;
        rows.into_iter().next().ok_or_else(|| {
            InfraError::Remote(format!("remote {} response did not include a row", table.as_str()))
        })
    }
}

#[async_trait]
impl RemoteStoreClient for ReqwestRemoteStoreClient {
    async fn select(
        &self,
        table: RemoteTable,
        filters: &[RemoteFilter],
    ) -> Result<Vec<serde_json::Value>, InfraError> {
        let endpoint = self.table_endpoint(table)?;
        let query = filters
            .iter()
            .map(RemoteFilter::to_query_pair)
            .collect::<Vec<_>>();
        let response = self
            .request(reqwest::Method::GET, endpoint)
            .query(&[("select", "*")])
            .query(&query)
            .send()
            .await
            .map_err(|error| self.transport_error("selecting rows", error))?;

        let body = self.read_body(table, "reading select response", response).await?;
        serde_json::from_str(&body).map_err(|error| {
            InfraError::Remote(format!(
                "invalid {} payload: {error}; body={body}",
                table.as_str()
            ))
        })
    }

    async fn insert(
        &self,
        table: RemoteTable,
        row: &serde_json::Value,
    ) -> Result<serde_json::Value, InfraError> {
        let endpoint = self.table_endpoint(table)?;
        let response = self
            .request(reqwest::Method::POST, endpoint)
            .header("Prefer", "return=representation,resolution=merge-duplicates")
            .json(row)
            .send()
            .await
            .map_err(|error| self.transport_error("inserting row", error))?;

        let body = self.read_body(table, "reading insert response", response).await?;
        Self::first_row(table, &body)
    }

    async fn update(
        &self,
        table: RemoteTable,
        id: &str,
        row: &serde_json::Value,
    ) -> Result<serde_json::Value, InfraError> {
        Self::ensure_non_empty(id, "row id")?;
        let endpoint = self.table_endpoint(table)?;
        let (column, filter) = RemoteFilter::eq("id", id.trim()).to_query_pair();
        let response = self
            .request(reqwest::Method::PATCH, endpoint)
            .header("Prefer", "return=representation")
            .query(&[(column, filter)])
            .json(row)
            .send()
            .await
            .map_err(|error| self.transport_error("updating row", error))?;

        let body = self.read_body(table, "reading update response", response).await?;
        Self::first_row(table, &body)
    }

    async fn delete(&self, table: RemoteTable, id: &str) -> Result<(), InfraError> {
        Self::ensure_non_empty(id, "row id")?;
        let endpoint = self.table_endpoint(table)?;
        let (column, filter) = RemoteFilter::eq("id", id.trim()).to_query_pair();
        let response = self
            .request(reqwest::Method::DELETE, endpoint)
            .query(&[(column, filter)])
            .send()
            .await
            .map_err(|error| self.transport_error("deleting row", error))?;

        self.read_body(table, "reading delete response", response).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), InfraError> {
        let endpoint = self.table_endpoint(RemoteTable::Users)?;
        let response = self
            .request(reqwest::Method::GET, endpoint)
            .query(&[("select", "id"), ("limit", "1")])
            .send()
            .await
            .map_err(|error| self.transport_error("checking connectivity", error))?;

        self.read_body(RemoteTable::Users, "reading ping response", response)
            .await?;
        Ok(())
    }
}
