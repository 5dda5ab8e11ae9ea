//! Activity execution with retry, timeout and panic capture.
//!
//! The executor appends the first `ActivityScheduled` of an invocation. Every
//! later attempt is persisted here as another `ActivityScheduled` pointing at
//! the first one through `retry_of`, so a crash mid-retry resumes at the right
//! attempt. The invocation ends with exactly one `ActivityCompleted` or
//! `ActivityFailed`.
use super::{ActivityContext, Runtime};
use crate::error::ActivityError;
use crate::providers::InstanceUpdate;
use crate::{EventKind, HistoryEvent, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An outstanding activity call, identified by `(instance, scheduled_seq)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityInvocation {
    pub instance: String,
    /// Sequence of the invocation's first `ActivityScheduled`.
    pub scheduled_seq: u64,
    pub name: String,
    pub input: String,
    pub policy: RetryPolicy,
    /// Attempt to run next.
    pub attempt: u32,
    /// Earliest start of that attempt when it is a retry still in its backoff.
    pub not_before: Option<DateTime<Utc>>,
}

enum AttemptOutcome {
    Completed(String),
    Failed(ActivityError),
    /// No handler registered; never retried.
    Unregistered(String),
}

impl Runtime {
    /// Start executing `invocation` in the background. A second dispatch of an
    /// invocation that is already in flight is ignored.
    pub(crate) fn dispatch_activity(self: &Arc<Self>, invocation: ActivityInvocation) {
        if self.is_shutting_down() {
            return;
        }
        let key = (invocation.instance.clone(), invocation.scheduled_seq);
        if !self.in_flight.reserve(&key) {
            debug!(instance = %key.0, seq = key.1, "activity already in flight; skipping dispatch");
            return;
        }
        let rt = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            rt.run_invocation(invocation, &task_key).await;
        });
        self.in_flight.attach(&key, handle.abort_handle());
    }

    async fn run_invocation(self: Arc<Self>, invocation: ActivityInvocation, key: &(String, u64)) {
        let ActivityInvocation {
            instance,
            scheduled_seq,
            name,
            input,
            policy,
            attempt: first_attempt,
            mut not_before,
        } = invocation;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = first_attempt.clamp(1, max_attempts);

        let resolution = loop {
            if let Some(at) = not_before.take() {
                tokio::time::sleep((at - Utc::now()).to_std().unwrap_or_default()).await;
            }
            let ctx = ActivityContext::new(instance.clone(), scheduled_seq, attempt, name.clone());
            match self.execute_attempt(ctx, &input, &policy).await {
                AttemptOutcome::Completed(result) => {
                    debug!(instance = %instance, activity = %name, seq = scheduled_seq, attempt, "activity completed");
                    break EventKind::ActivityCompleted { scheduled_seq, result };
                }
                AttemptOutcome::Unregistered(error) => {
                    warn!(instance = %instance, activity = %name, seq = scheduled_seq, "activity not registered");
                    break EventKind::ActivityFailed {
                        scheduled_seq,
                        error,
                        attempt,
                    };
                }
                AttemptOutcome::Failed(err) => {
                    if attempt >= max_attempts {
                        warn!(
                            instance = %instance,
                            activity = %name,
                            seq = scheduled_seq,
                            attempt,
                            error = %err,
                            "activity failed; retries exhausted"
                        );
                        break EventKind::ActivityFailed {
                            scheduled_seq,
                            error: err.message(),
                            attempt,
                        };
                    }
                    let delay = policy.retry_interval(attempt);
                    info!(
                        instance = %instance,
                        activity = %name,
                        seq = scheduled_seq,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "activity attempt failed; retrying"
                    );
                    attempt += 1;
                    // Recorded before the backoff so a restart resumes at this attempt.
                    match self
                        .record_retry(&instance, scheduled_seq, &name, &input, &policy, attempt)
                        .await
                    {
                        Ok(Some(recorded_at)) => not_before = Some(retry_start(recorded_at, delay)),
                        Ok(None) => {
                            self.in_flight.finish(key);
                            return;
                        }
                        Err(e) => {
                            // Leave the invocation to recovery.
                            warn!(instance = %instance, seq = scheduled_seq, error = %e, "failed to persist retry");
                            self.in_flight.finish(key);
                            return;
                        }
                    }
                }
            }
        };

        self.in_flight.finish(key);
        if let Err(e) = self.resolve_and_activate(&instance, resolution).await {
            warn!(instance = %instance, seq = scheduled_seq, error = %e, "failed to record activity outcome");
        }
    }

    async fn execute_attempt(&self, ctx: ActivityContext, input: &str, policy: &RetryPolicy) -> AttemptOutcome {
        let Some((_, handler)) = self.activities().resolve_handler(ctx.activity_name()) else {
            return AttemptOutcome::Unregistered(format!("unregistered:{}", ctx.activity_name()));
        };

        let _permit = match Arc::clone(&self.activity_slots).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return AttemptOutcome::Failed(ActivityError::Transient("activity slots closed".into())),
        };

        let call = AssertUnwindSafe(handler.invoke(ctx, input.to_string())).catch_unwind();
        let result = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => return AttemptOutcome::Failed(ActivityError::TimedOut(limit)),
            },
            None => call.await,
        };

        match result {
            Ok(Ok(out)) => AttemptOutcome::Completed(out),
            Ok(Err(e)) => AttemptOutcome::Failed(ActivityError::Transient(e)),
            Err(panic_payload) => AttemptOutcome::Failed(ActivityError::Transient(format!(
                "activity panicked: {}",
                super::replay_engine::panic_message(panic_payload.as_ref())
            ))),
        }
    }

    /// Persist retry `attempt` and return the time it was recorded. `None` when
    /// the instance is closed or the invocation already has an outcome.
    async fn record_retry(
        self: &Arc<Self>,
        instance: &str,
        scheduled_seq: u64,
        name: &str,
        input: &str,
        policy: &RetryPolicy,
        attempt: u32,
    ) -> Result<Option<DateTime<Utc>>, crate::DurableError> {
        let _guard = self.lock_instance(instance).await;

        match self.load_instance(instance).await? {
            Some(info) if !info.status.is_terminal() => {}
            _ => return Ok(None),
        }
        let history = self.load_history(instance).await?;
        if invocation_resolved(&history, scheduled_seq) {
            return Ok(None);
        }
        let appended = self
            .append_events(
                instance,
                &history,
                vec![EventKind::ActivityScheduled {
                    name: name.to_string(),
                    input: input.to_string(),
                    attempt,
                    retry_of: Some(scheduled_seq),
                    policy: policy.clone(),
                }],
                InstanceUpdate::default(),
            )
            .await?;
        Ok(appended.first().map(|e| e.timestamp))
    }
}

/// When a retry recorded at `recorded_at` may start.
fn retry_start(recorded_at: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| recorded_at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn invocation_resolved(history: &[HistoryEvent], scheduled_seq: u64) -> bool {
    history.iter().any(|e| {
        matches!(
            &e.kind,
            EventKind::ActivityCompleted { scheduled_seq: s, .. } | EventKind::ActivityFailed { scheduled_seq: s, .. }
                if *s == scheduled_seq
        )
    })
}

/// Invocations in `history` that have no outcome yet, each set to resume at its
/// latest persisted attempt once that attempt's backoff has elapsed.
pub(crate) fn pending_invocations(instance: &str, history: &[HistoryEvent]) -> Vec<ActivityInvocation> {
    let mut latest_retry: HashMap<u64, (u32, DateTime<Utc>)> = HashMap::new();
    for e in history {
        if let EventKind::ActivityScheduled {
            attempt,
            retry_of: Some(first),
            ..
        } = &e.kind
        {
            let slot = latest_retry.entry(*first).or_insert((*attempt, e.timestamp));
            if *attempt >= slot.0 {
                *slot = (*attempt, e.timestamp);
            }
        }
    }

    history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled {
                name,
                input,
                attempt,
                retry_of: None,
                policy,
            } if !invocation_resolved(history, e.seq) => {
                let (attempt, not_before) = match latest_retry.get(&e.seq) {
                    Some(&(retry, recorded_at)) => (
                        retry,
                        Some(retry_start(recorded_at, policy.retry_interval(retry.saturating_sub(1)))),
                    ),
                    None => (*attempt, None),
                };
                Some(ActivityInvocation {
                    instance: instance.to_string(),
                    scheduled_seq: e.seq,
                    name: name.clone(),
                    input: input.clone(),
                    policy: policy.clone(),
                    attempt,
                    not_before,
                })
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn ev(seq: u64, kind: EventKind) -> HistoryEvent {
        HistoryEvent::new(seq, DateTime::<Utc>::UNIX_EPOCH, kind)
    }

    fn scheduled(name: &str, attempt: u32, retry_of: Option<u64>) -> EventKind {
        EventKind::ActivityScheduled {
            name: name.into(),
            input: "in".into(),
            attempt,
            retry_of,
            policy: RetryPolicy::new(3),
        }
    }

    #[test]
    fn pending_invocations_resume_at_latest_attempt() {
        let history = vec![
            ev(
                0,
                EventKind::OrchestratorStarted {
                    name: "O".into(),
                    version: "1.0.0".into(),
                    input: String::new(),
                },
            ),
            ev(1, scheduled("A", 1, None)),
            ev(2, scheduled("A", 2, Some(1))),
            ev(3, scheduled("B", 1, None)),
            ev(
                4,
                EventKind::ActivityCompleted {
                    scheduled_seq: 3,
                    result: "ok".into(),
                },
            ),
        ];
        let pending = pending_invocations("i", &history);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scheduled_seq, 1);
        assert_eq!(pending[0].name, "A");
        assert_eq!(pending[0].attempt, 2);
        // Default policy backs off 100ms after the first failure.
        assert_eq!(
            pending[0].not_before,
            Some(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::milliseconds(100))
        );
    }

    #[test]
    fn first_attempts_start_immediately() {
        let history = vec![ev(1, scheduled("A", 1, None))];
        let pending = pending_invocations("i", &history);
        assert_eq!(pending[0].attempt, 1);
        assert_eq!(pending[0].not_before, None);
    }

    #[test]
    fn retry_start_saturates() {
        let t = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(retry_start(t, std::time::Duration::from_secs(2)), t + chrono::Duration::seconds(2));
        assert_eq!(retry_start(t, std::time::Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
