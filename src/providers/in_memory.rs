use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{
    check_append, continuation_token, parse_continuation, InstanceInfo, InstancePage, InstanceQuery, InstanceStatus,
    InstanceUpdate, NewInstance, Provider, ProviderError,
};
use crate::HistoryEvent;

struct InstanceRecord {
    info: InstanceInfo,
    history: Vec<HistoryEvent>,
}

/// Volatile provider for tests and demos. Histories are lost with the process.
#[derive(Default)]
pub struct InMemoryProvider {
    inner: Mutex<HashMap<String, InstanceRecord>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn create_instance(&self, instance: NewInstance) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(&instance.instance_id) {
            return Ok(false);
        }
        let started = instance.started_event();
        let info = InstanceInfo {
            instance_id: instance.instance_id.clone(),
            orchestration_name: instance.orchestration_name,
            orchestration_version: instance.orchestration_version,
            status: InstanceStatus::Running,
            input: instance.input,
            output: None,
            custom_status: None,
            created_at: instance.created_at,
            updated_at: instance.created_at,
        };
        g.insert(
            instance.instance_id,
            InstanceRecord {
                info,
                history: vec![started],
            },
        );
        Ok(true)
    }

    async fn append(
        &self,
        instance: &str,
        events: Vec<HistoryEvent>,
        update: InstanceUpdate,
    ) -> Result<u64, ProviderError> {
        let mut g = self.inner.lock().await;
        let rec = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("append", format!("instance not found: {instance}")))?;

        if check_append("append", instance, &rec.history, rec.info.status, &events)? {
            return Ok(events.last().map(|e| e.seq).unwrap_or_default());
        }

        let updated_at = events
            .last()
            .map(|e| e.timestamp)
            .unwrap_or_else(chrono::Utc::now)
            .max(rec.info.updated_at);
        rec.history.extend(events);
        if let Some(status) = update.status {
            rec.info.status = status;
        }
        if update.output.is_some() {
            rec.info.output = update.output;
        }
        if update.custom_status.is_some() {
            rec.info.custom_status = update.custom_status;
        }
        rec.info.updated_at = updated_at;
        Ok(rec.history.len() as u64 - 1)
    }

    async fn read(&self, instance: &str) -> Result<Vec<HistoryEvent>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g.get(instance).map(|r| r.history.clone()).unwrap_or_default())
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g.get(instance).map(|r| r.info.clone()))
    }

    async fn list_instances(&self, query: InstanceQuery) -> Result<InstancePage, ProviderError> {
        let after = match query.continuation.as_deref() {
            Some(token) => Some(parse_continuation(token).ok_or_else(|| {
                ProviderError::permanent("list_instances", format!("invalid continuation token: {token}"))
            })?),
            None => None,
        };

        let g = self.inner.lock().await;
        let mut matching: Vec<&InstanceInfo> = g
            .values()
            .map(|r| &r.info)
            .filter(|i| query.status.map_or(true, |s| i.status == s))
            .filter(|i| query.orchestration_name.as_ref().map_or(true, |n| &i.orchestration_name == n))
            .filter(|i| match &after {
                Some((ms, id)) => {
                    let key = (i.created_at.timestamp_millis(), i.instance_id.as_str());
                    key < (*ms, id.as_str())
                }
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| {
            (b.created_at.timestamp_millis(), &b.instance_id).cmp(&(a.created_at.timestamp_millis(), &a.instance_id))
        });

        let page_size = query.page_size.max(1);
        let has_more = matching.len() > page_size;
        let instances: Vec<InstanceInfo> = matching.into_iter().take(page_size).cloned().collect();
        let continuation = if has_more {
            instances.last().map(continuation_token)
        } else {
            None
        };
        Ok(InstancePage {
            instances,
            continuation,
        })
    }
}
