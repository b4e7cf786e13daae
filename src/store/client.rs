use std::time::Duration;

use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::StoreError;
use super::types::{
    ClaimBody, ClaimResponse, DispatchBody, DispatchResponse, ErrorBody, ParentResponse,
    UnintegratedResponse,
};
use crate::config::JobNetConfig;
use crate::error::{DispatchError, JobNetError};
use crate::ports::{
    ChildCompletionOracle, ClaimDecision, ClaimService, DispatchReceipt, DispatchRequest,
    Dispatcher, IntegrationCheck,
};
use crate::state_machine::{
    ChildDefinition, DispatchRecord, JobDefinition, RoutingInfo, RunSummary,
};

pub const DEFAULT_STORE_URL: &str = "http://127.0.0.1:8787";

/// Record store client speaking JSON over HTTP with bearer auth.
pub struct HttpRecordStore {
    token: String,
    client: Client,
    base_url: Url,
}

impl HttpRecordStore {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, StoreError> {
        let base_url =
            Url::parse(base_url).map_err(|e| StoreError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            token: token.into(),
            client,
            base_url,
        })
    }

    /// Client for the store named in the config.
    pub fn from_config(config: &JobNetConfig) -> Result<Self, JobNetError> {
        Ok(Self::new(&config.store_url, config.store_token.clone())?)
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| StoreError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, StoreError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(check(response).await?).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, StoreError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        decode(check(response).await?).await
    }
}

async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(1000);
        return Err(StoreError::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if status == StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(response.url().path().to_string()));
    }

    if !status.is_success() {
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .filter(|b| !b.error.is_empty())
            .map(|b| b.error)
            .unwrap_or(text);
        return Err(StoreError::Unavailable {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            DispatchError::transient(err.to_string())
        } else {
            DispatchError::permanent(err.to_string())
        }
    }
}

impl ChildCompletionOracle for HttpRecordStore {
    async fn get_definition(&self, id: &str) -> Result<Option<JobDefinition>, StoreError> {
        match self.get_json(self.url(&["definitions", id])?).await {
            Ok(def) => Ok(Some(def)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_parent(&self, id: &str) -> Result<Option<String>, StoreError> {
        let resp: ParentResponse = match self
            .get_json(self.url(&["definitions", id, "parent"])?)
            .await
        {
            Ok(resp) => resp,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(resp.parent_job_definition_id)
    }

    async fn list_child_definitions(
        &self,
        parent: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<ChildDefinition>, StoreError> {
        let mut url = self.url(&["definitions", parent, "children"])?;
        if let Some(exclude) = exclude {
            url.query_pairs_mut().append_pair("exclude", exclude);
        }
        self.get_json(url).await
    }

    async fn list_runs_for_definition(&self, id: &str) -> Result<Vec<RunSummary>, StoreError> {
        self.get_json(self.url(&["definitions", id, "runs"])?).await
    }

    async fn list_child_runs_of_run(&self, run_id: &str) -> Result<Vec<RunSummary>, StoreError> {
        self.get_json(self.url(&["runs", run_id, "children"])?).await
    }

    async fn routing(&self, id: &str) -> Result<RoutingInfo, StoreError> {
        self.get_json(self.url(&["definitions", id, "routing"])?).await
    }

    async fn dispatch_history(&self, parent: &str) -> Result<Vec<DispatchRecord>, StoreError> {
        self.get_json(self.url(&["definitions", parent, "dispatches"])?)
            .await
    }
}

impl Dispatcher for HttpRecordStore {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let body = DispatchBody {
            job_definition_id: &request.job_definition_id,
            message: &request.message,
            additional_context: &request.additional_context,
            source_job_definition_id: request.source_job_definition_id.as_deref(),
        };
        let resp: DispatchResponse = self.post_json(self.url(&["dispatch"])?, &body).await?;
        Ok(DispatchReceipt {
            new_run_id: resp.new_run_id,
        })
    }
}

impl ClaimService for HttpRecordStore {
    async fn try_claim(&self, parent: &str, child: &str) -> Result<ClaimDecision, StoreError> {
        let body = ClaimBody {
            parent_job_definition_id: parent,
            child_job_definition_id: child,
        };
        let resp: ClaimResponse = self.post_json(self.url(&["claims"])?, &body).await?;
        Ok(ClaimDecision {
            allowed: resp.allowed,
            claimed_by: resp.claimed_by,
        })
    }
}

impl IntegrationCheck for HttpRecordStore {
    async fn unintegrated_children(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let resp: UnintegratedResponse = self
            .get_json(self.url(&["definitions", id, "unintegrated"])?)
            .await?;
        Ok(resp.children)
    }
}
