use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DurableError;
use crate::providers::{parse_continuation, InstanceInfo, InstanceQuery, InstanceStatus, NewInstance};
use crate::runtime::{EventDelivery, Runtime};
use crate::HistoryEvent;

/// Largest page `list_instances` will return.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Status snapshot of one instance as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatusView {
    pub instance_id: String,
    pub name: String,
    pub version: String,
    pub status: InstanceStatus,
    pub input: String,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub created_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
}

impl From<InstanceInfo> for InstanceStatusView {
    fn from(info: InstanceInfo) -> Self {
        Self {
            instance_id: info.instance_id,
            name: info.orchestration_name,
            version: info.orchestration_version,
            status: info.status,
            input: info.input,
            output: info.output,
            custom_status: info.custom_status,
            created_time: info.created_at,
            last_updated_time: info.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePageView {
    pub instances: Vec<InstanceStatusView>,
    pub continuation_token: Option<String>,
}

/// Control-plane API: start, inspect, signal and terminate instances.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Start a new instance under a fresh UUID v4 id and run its first turn.
    ///
    /// # Errors
    ///
    /// `UnknownOrchestration` if `orchestration` is not registered, `InvalidInput`
    /// if the orchestration rejects `input`. No instance is created in either case.
    pub async fn start_new(&self, orchestration: &str, input: impl Into<String>) -> Result<String, DurableError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_with_id(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Start an instance under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// As [`start_new`](Self::start_new), plus `InstanceAlreadyExists` if the id is taken.
    pub async fn start_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), DurableError> {
        let input = input.into();
        if instance.is_empty() {
            return Err(DurableError::InvalidInput("instance id must not be empty".into()));
        }
        let (version, handler) = self
            .runtime
            .orchestrations()
            .resolve_handler(orchestration)
            .ok_or_else(|| DurableError::UnknownOrchestration(orchestration.to_string()))?;
        handler.validate_input(&input).map_err(DurableError::InvalidInput)?;

        let store = self.runtime.store();
        let created = self
            .runtime
            .with_store_retry("create_instance", || {
                store.create_instance(NewInstance {
                    instance_id: instance.to_string(),
                    orchestration_name: orchestration.to_string(),
                    orchestration_version: version.to_string(),
                    input: input.clone(),
                    created_at: Utc::now(),
                })
            })
            .await?;
        if !created {
            return Err(DurableError::InstanceAlreadyExists(instance.to_string()));
        }
        info!(instance, orchestration, version = %version, "instance started");
        self.runtime.activate(instance).await
    }

    /// Serialize `input` as JSON and start a new instance.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `input` cannot be serialized, otherwise as [`start_new`](Self::start_new).
    pub async fn start_new_typed<In: Serialize>(&self, orchestration: &str, input: &In) -> Result<String, DurableError> {
        let payload = crate::_typed_codec::encode(input).map_err(DurableError::InvalidInput)?;
        self.start_new(orchestration, payload).await
    }

    /// # Errors
    ///
    /// `InstanceNotFound` for an unknown id.
    pub async fn get_status(&self, instance: &str) -> Result<InstanceStatusView, DurableError> {
        self.runtime
            .load_instance(instance)
            .await?
            .map(InstanceStatusView::from)
            .ok_or_else(|| DurableError::InstanceNotFound(instance.to_string()))
    }

    /// Instances newest first, optionally filtered by status. Pass the returned
    /// `continuation_token` back to fetch the next page.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a page size outside `1..=MAX_PAGE_SIZE` or a malformed token.
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        page_size: usize,
        continuation: Option<String>,
    ) -> Result<InstancePageView, DurableError> {
        self.query_instances(InstanceQuery {
            status,
            page_size,
            continuation,
            ..InstanceQuery::default()
        })
        .await
    }

    /// Like [`list_instances`](Self::list_instances), restricted to instances of `orchestration`.
    ///
    /// # Errors
    ///
    /// As [`list_instances`](Self::list_instances).
    pub async fn list_orchestration_instances(
        &self,
        orchestration: &str,
        status: Option<InstanceStatus>,
        page_size: usize,
        continuation: Option<String>,
    ) -> Result<InstancePageView, DurableError> {
        self.query_instances(InstanceQuery {
            status,
            orchestration_name: Some(orchestration.to_string()),
            page_size,
            continuation,
        })
        .await
    }

    async fn query_instances(&self, query: InstanceQuery) -> Result<InstancePageView, DurableError> {
        let page_size = query.page_size;
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(DurableError::InvalidInput(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }
        if let Some(token) = query.continuation.as_deref() {
            if parse_continuation(token).is_none() {
                return Err(DurableError::InvalidInput(format!("invalid continuation token: {token}")));
            }
        }
        let store = self.runtime.store();
        let page = self
            .runtime
            .with_store_retry("list_instances", || store.list_instances(query.clone()))
            .await?;
        Ok(InstancePageView {
            instances: page.instances.into_iter().map(InstanceStatusView::from).collect(),
            continuation_token: page.continuation,
        })
    }

    /// Route a named external event to a running instance.
    ///
    /// # Errors
    ///
    /// `InstanceNotFound` or `InstanceNotRunning`.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: &str,
        payload: impl Into<String>,
    ) -> Result<EventDelivery, DurableError> {
        self.runtime.raise_event(instance, name, payload).await
    }

    /// # Errors
    ///
    /// `InstanceNotFound` or `InstanceNotRunning`.
    pub async fn terminate(&self, instance: &str, reason: &str) -> Result<(), DurableError> {
        self.runtime.terminate(instance, reason).await
    }

    /// Poll until the instance reaches a terminal state.
    ///
    /// # Errors
    ///
    /// `InstanceNotFound` for an unknown id, `Timeout` if still running after `timeout`.
    pub async fn wait_for_completion(&self, instance: &str, timeout: Duration) -> Result<InstanceStatusView, DurableError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let view = self.get_status(instance).await?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DurableError::Timeout(instance.to_string()));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Full persisted history of an instance.
    ///
    /// # Errors
    ///
    /// `InstanceNotFound` for an unknown id.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<HistoryEvent>, DurableError> {
        if self.runtime.load_instance(instance).await?.is_none() {
            return Err(DurableError::InstanceNotFound(instance.to_string()));
        }
        Ok(self.runtime.load_history(instance).await?)
    }
}
