use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::HistoryEvent;

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;
pub use in_memory::InMemoryProvider;
pub use sqlite::SqliteProvider;

/// Lifecycle state of an instance. Moves from `Running` to exactly one
/// terminal state and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Running => "Running",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Failed => "Failed",
            InstanceStatus::Terminated => "Terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(InstanceStatus::Running),
            "Completed" => Some(InstanceStatus::Completed),
            "Failed" => Some(InstanceStatus::Failed),
            "Terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance metadata kept next to its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub orchestration_name: String,
    pub orchestration_version: String,
    pub status: InstanceStatus,
    pub input: String,
    /// Output for completed instances, error or reason for failed and terminated ones.
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to create an instance and its `OrchestratorStarted` record.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub instance_id: String,
    pub orchestration_name: String,
    pub orchestration_version: String,
    pub input: String,
    pub created_at: DateTime<Utc>,
}

impl NewInstance {
    pub fn started_event(&self) -> HistoryEvent {
        HistoryEvent::new(
            0,
            self.created_at,
            crate::EventKind::OrchestratorStarted {
                name: self.orchestration_name.clone(),
                version: self.orchestration_version.clone(),
                input: self.input.clone(),
            },
        )
    }
}

/// Metadata changes applied atomically with an append. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub status: Option<InstanceStatus>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
}

impl InstanceUpdate {
    pub fn terminal(status: InstanceStatus, output: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            output: Some(output.into()),
            custom_status: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    pub status: Option<InstanceStatus>,
    /// Only instances of this orchestration.
    pub orchestration_name: Option<String>,
    pub page_size: usize,
    /// Opaque token returned by a previous page.
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstancePage {
    pub instances: Vec<InstanceInfo>,
    pub continuation: Option<String>,
}

/// Continuation tokens encode the sort key of the last row returned: `"{created_ms}:{id}"`.
pub fn continuation_token(info: &InstanceInfo) -> String {
    format!("{}:{}", info.created_at.timestamp_millis(), info.instance_id)
}

pub fn parse_continuation(token: &str) -> Option<(i64, String)> {
    let (ms, id) = token.split_once(':')?;
    Some((ms.parse().ok()?, id.to_string()))
}

/// Storage for instance metadata and append-only per-instance histories.
///
/// Appends carry explicit sequence numbers. The first new event must sit at the
/// current history length; an append whose events are already stored verbatim
/// succeeds without re-applying them, which makes retried writes safe.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Create the instance row and its `OrchestratorStarted` event at sequence 0.
    /// Returns `false` when the id is already taken.
    async fn create_instance(&self, instance: NewInstance) -> Result<bool, ProviderError>;

    /// Append `events` and apply `update` in one step. Returns the last sequence number.
    async fn append(
        &self,
        instance: &str,
        events: Vec<HistoryEvent>,
        update: InstanceUpdate,
    ) -> Result<u64, ProviderError>;

    /// Full history from sequence 0. Empty for unknown instances.
    async fn read(&self, instance: &str) -> Result<Vec<HistoryEvent>, ProviderError>;

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError>;

    /// Instances ordered newest first, ties broken by id descending.
    async fn list_instances(&self, query: InstanceQuery) -> Result<InstancePage, ProviderError>;
}

/// Checks shared by providers before an append is applied.
///
/// Returns `Ok(true)` when `events` are already stored verbatim and the append is a no-op.
pub(crate) fn check_append(
    operation: &str,
    instance: &str,
    existing: &[HistoryEvent],
    status: InstanceStatus,
    events: &[HistoryEvent],
) -> Result<bool, ProviderError> {
    let len = existing.len() as u64;
    let Some(first) = events.first() else {
        if status.is_terminal() {
            return Err(ProviderError::permanent(
                operation,
                format!("instance {instance} is {status}; no further updates accepted"),
            ));
        }
        return Ok(false);
    };

    if first.seq < len {
        let already_stored = events
            .iter()
            .all(|e| existing.get(e.seq as usize).is_some_and(|stored| stored == e));
        if already_stored {
            return Ok(true);
        }
        return Err(ProviderError::permanent(
            operation,
            format!(
                "sequence conflict for {instance}: history has {len} events, append starts at {}",
                first.seq
            ),
        ));
    }
    if first.seq > len {
        return Err(ProviderError::permanent(
            operation,
            format!("sequence gap for {instance}: history has {len} events, append starts at {}", first.seq),
        ));
    }
    for (offset, e) in events.iter().enumerate() {
        if e.seq != len + offset as u64 {
            return Err(ProviderError::permanent(
                operation,
                format!("non-contiguous sequence {} in append for {instance}", e.seq),
            ));
        }
    }
    if status.is_terminal() || existing.iter().any(|e| e.kind.is_terminal()) {
        return Err(ProviderError::permanent(
            operation,
            format!("instance {instance} is {status}; history is closed"),
        ));
    }
    Ok(false)
}
