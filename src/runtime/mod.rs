//! In-process engine: owns the store, the registries and the per-instance
//! single-writer locks, and drives turns, activities, timers and events.
use crate::error::DurableError;
use crate::providers::{InstanceInfo, InstanceQuery, InstanceUpdate, Provider, ProviderError};
use crate::{EventKind, HistoryEvent, OrchestrationContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub mod dispatcher;
pub mod registry;
pub(crate) mod replay_engine;
pub mod router;
pub mod timers;

pub use crate::providers::InstanceStatus;
pub use dispatcher::ActivityInvocation;
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy,
};
pub use router::EventDelivery;

use replay_engine::TurnResult;

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on activity attempts executing at the same time.
    /// Default: 16
    pub max_concurrent_activities: usize,
    /// Retries of a store call that failed with a retryable error.
    /// Default: 5
    pub store_retry_attempts: u32,
    /// First backoff between store retries; doubles per retry.
    /// Default: 10ms
    pub store_retry_base_delay: Duration,
    /// Resume running instances found in the store when the runtime starts.
    /// Default: true
    pub recover_on_start: bool,
    /// Install the default `tracing` subscriber on start (no-op if one is already set).
    /// Default: true
    pub init_tracing: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_concurrent_activities: 16,
            store_retry_attempts: 5,
            store_retry_base_delay: Duration::from_millis(10),
            recover_on_start: true,
            init_tracing: true,
        }
    }
}

impl RuntimeOptions {
    pub fn with_max_concurrent_activities(mut self, n: usize) -> Self {
        self.max_concurrent_activities = n.max(1);
        self
    }

    pub fn with_store_retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.store_retry_attempts = attempts;
        self.store_retry_base_delay = base_delay;
        self
    }

    pub fn with_recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }

    pub fn with_init_tracing(mut self, init: bool) -> Self {
        self.init_tracing = init;
        self
    }
}

/// Identity of the activity attempt being executed, passed to every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    instance: String,
    scheduled_seq: u64,
    attempt: u32,
    name: String,
}

impl ActivityContext {
    pub(crate) fn new(instance: String, scheduled_seq: u64, attempt: u32, name: String) -> Self {
        Self {
            instance,
            scheduled_seq,
            attempt,
            name,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    /// Sequence number of the invocation's first `ActivityScheduled` event. Stable
    /// across retries, so it can serve as an idempotency key.
    pub fn scheduled_seq(&self) -> u64 {
        self.scheduled_seq
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn activity_name(&self) -> &str {
        &self.name
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        info!(
            instance = %self.instance,
            activity = %self.name,
            seq = self.scheduled_seq,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        warn!(
            instance = %self.instance,
            activity = %self.name,
            seq = self.scheduled_seq,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;

    /// Checked once when an instance is started; a rejected input never creates an instance.
    fn validate_input(&self, _input: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers. An `Err` is a failed attempt and is
/// retried according to the invocation's policy.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Background tasks (activity invocations and timers) keyed by
/// `(instance, scheduled seq)`. A key present in the table is in flight and
/// must not be dispatched again.
#[derive(Default)]
pub(crate) struct InFlight {
    tasks: std::sync::Mutex<HashMap<(String, u64), Option<AbortHandle>>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, u64), Option<AbortHandle>>> {
        // Mutex lock should never fail in normal operation - if poisoned, it indicates a serious bug
        self.tasks.lock().expect("Mutex should not be poisoned")
    }

    /// Claim `key`; `false` if it is already running.
    pub(crate) fn reserve(&self, key: &(String, u64)) -> bool {
        let mut g = self.lock();
        if g.contains_key(key) {
            return false;
        }
        g.insert(key.clone(), None);
        true
    }

    pub(crate) fn attach(&self, key: &(String, u64), handle: AbortHandle) {
        if let Some(slot) = self.lock().get_mut(key) {
            *slot = Some(handle);
        }
    }

    pub(crate) fn finish(&self, key: &(String, u64)) {
        self.lock().remove(key);
    }

    pub(crate) fn contains(&self, key: &(String, u64)) -> bool {
        self.lock().contains_key(key)
    }

    /// Abort and forget every task of `instance`. Returns how many were aborted.
    fn abort_instance(&self, instance: &str) -> usize {
        let mut g = self.lock();
        let keys: Vec<(String, u64)> = g.keys().filter(|(i, _)| i == instance).cloned().collect();
        for key in &keys {
            if let Some(Some(handle)) = g.remove(key) {
                handle.abort();
            }
        }
        keys.len()
    }

    fn abort_all(&self) {
        for (_, handle) in self.lock().drain() {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
    }
}

type LockMap = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// One async mutex per instance id: the single writer for that history.
/// Entries exist only while some task holds or waits on them.
#[derive(Default)]
pub(crate) struct InstanceLocks {
    map: Arc<LockMap>,
}

/// Held instance lock. Dropping the last holder removes the map entry.
pub(crate) struct InstanceGuard {
    instance: String,
    map: Arc<LockMap>,
    lock: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl InstanceLocks {
    fn entries(map: &LockMap) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        // Mutex lock should never fail in normal operation - if poisoned, it indicates a serious bug
        map.lock().expect("Mutex should not be poisoned")
    }

    pub(crate) async fn acquire(&self, instance: &str) -> InstanceGuard {
        let lock = Arc::clone(Self::entries(&self.map).entry(instance.to_string()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;
        InstanceGuard {
            instance: instance.to_string(),
            map: Arc::clone(&self.map),
            lock,
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        Self::entries(&self.map).len()
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let mut entries = InstanceLocks::entries(&self.map);
        // Map, this guard's handle and the owned guard: nobody else is waiting.
        let idle = entries
            .get(&self.instance)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) <= 3);
        if idle {
            entries.remove(&self.instance);
        }
        // Left behind by waiters that were cancelled before acquiring.
        entries.retain(|_, l| Arc::strong_count(l) > 1);
    }
}

/// In-process runtime that executes orchestrations, activities and timers and
/// persists history via a `Provider`.
pub struct Runtime {
    store: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    activities: Arc<ActivityRegistry>,
    options: RuntimeOptions,
    instance_locks: InstanceLocks,
    pub(crate) activity_slots: Arc<Semaphore>,
    pub(crate) in_flight: InFlight,
    shutting_down: AtomicBool,
}

impl Runtime {
    /// Start a runtime over an in-memory store.
    pub async fn start(activities: ActivityRegistry, orchestrations: OrchestrationRegistry) -> Arc<Self> {
        let store: Arc<dyn Provider> = Arc::new(crate::providers::InMemoryProvider::new());
        Self::start_with_store(store, activities, orchestrations).await
    }

    /// Start a new runtime with a custom `Provider` implementation.
    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await
    }

    /// Start a new runtime with custom options. Running instances found in the
    /// store are resumed before this returns unless `recover_on_start` is off.
    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        if options.init_tracing {
            // ok to call many times
            let _ = crate::logging::init_tracing();
        }

        let runtime = Arc::new(Self {
            store,
            orchestrations,
            activities: Arc::new(activities),
            activity_slots: Arc::new(Semaphore::new(options.max_concurrent_activities.max(1))),
            options,
            instance_locks: InstanceLocks::default(),
            in_flight: InFlight::default(),
            shutting_down: AtomicBool::new(false),
        });
        info!(provider = runtime.store.name(), "runtime started");

        if runtime.options.recover_on_start {
            runtime.recover().await;
        }
        runtime
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        Arc::clone(&self.store)
    }

    pub fn orchestrations(&self) -> &OrchestrationRegistry {
        &self.orchestrations
    }

    pub(crate) fn activities(&self) -> &ActivityRegistry {
        &self.activities
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Control-plane client bound to this runtime.
    pub fn client(self: &Arc<Self>) -> crate::Client {
        crate::Client::new(Arc::clone(self))
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop dispatching: abort in-flight activity attempts and timers. Their
    /// invocations stay recorded and resume when a new runtime recovers the store.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.in_flight.abort_all();
        info!("runtime shut down");
    }

    /// Wait for exclusive access to `instance`'s history.
    pub(crate) async fn lock_instance(&self, instance: &str) -> InstanceGuard {
        self.instance_locks.acquire(instance).await
    }

    /// Run a store call, retrying retryable failures with exponential backoff.
    pub(crate) async fn with_store_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempts < self.options.store_retry_attempts => {
                    let backoff = self.options.store_retry_base_delay.saturating_mul(1 << attempts.min(16));
                    warn!(attempts, backoff_ms = backoff.as_millis() as u64, error = %e, "{} failed; retrying", operation);
                    tokio::time::sleep(backoff).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(attempts, error = %e, "Failed to {}", operation);
                    return Err(e);
                }
            }
        }
    }

    pub(crate) async fn load_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        self.with_store_retry("get_instance", || self.store.get_instance(instance))
            .await
    }

    pub(crate) async fn load_history(&self, instance: &str) -> Result<Vec<HistoryEvent>, ProviderError> {
        self.with_store_retry("read", || self.store.read(instance)).await
    }

    /// Append `kinds` after `history` with runtime-assigned sequence numbers and
    /// timestamps. Caller holds the instance lock.
    pub(crate) async fn append_events(
        &self,
        instance: &str,
        history: &[HistoryEvent],
        kinds: Vec<EventKind>,
        update: InstanceUpdate,
    ) -> Result<Vec<HistoryEvent>, ProviderError> {
        let now = event_time(history);
        let base = history.len() as u64;
        let events: Vec<HistoryEvent> = kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| HistoryEvent::new(base + i as u64, now, kind))
            .collect();
        self.with_store_retry("append", || self.store.append(instance, events.clone(), update.clone()))
            .await?;
        for e in &events {
            debug!(instance, seq = e.seq, kind = e.kind.name(), "appended");
        }
        Ok(events)
    }

    /// Take the instance lock and run one orchestration turn.
    pub(crate) async fn activate(self: &Arc<Self>, instance: &str) -> Result<(), DurableError> {
        let _guard = self.lock_instance(instance).await;
        self.run_turn_locked(instance).await
    }

    /// Replay the instance and persist whatever the turn produced. Caller holds the instance lock.
    pub(crate) async fn run_turn_locked(self: &Arc<Self>, instance: &str) -> Result<(), DurableError> {
        let info = self
            .load_instance(instance)
            .await?
            .ok_or_else(|| DurableError::InstanceNotFound(instance.to_string()))?;
        if info.status.is_terminal() {
            debug!(instance, status = %info.status, "instance is terminal; skipping turn");
            return Ok(());
        }
        let history = self.load_history(instance).await?;
        if history.iter().any(|e| e.kind.is_terminal()) {
            return Ok(());
        }

        let result = replay_engine::execute(&self.orchestrations, instance, history.clone());
        match result {
            TurnResult::Continue {
                new_events,
                actions,
                custom_status,
            } => {
                let custom_status = custom_status.filter(|s| info.custom_status.as_ref() != Some(s));
                if new_events.is_empty() && custom_status.is_none() {
                    return Ok(());
                }
                let update = InstanceUpdate {
                    custom_status,
                    ..InstanceUpdate::default()
                };
                self.append_events(instance, &history, new_events, update).await?;
                for action in actions {
                    self.materialize(instance, action);
                }
            }
            TurnResult::Completed {
                mut new_events,
                output,
                custom_status,
            } => {
                new_events.push(EventKind::OrchestratorCompleted { output: output.clone() });
                let update = InstanceUpdate {
                    custom_status,
                    ..InstanceUpdate::terminal(InstanceStatus::Completed, output)
                };
                self.append_events(instance, &history, new_events, update).await?;
                info!(instance, orchestration = %info.orchestration_name, "orchestration completed");
                self.in_flight.abort_instance(instance);
            }
            TurnResult::Failed {
                mut new_events,
                error,
                custom_status,
            } => {
                new_events.push(EventKind::OrchestratorFailed { error: error.clone() });
                let update = InstanceUpdate {
                    custom_status,
                    ..InstanceUpdate::terminal(InstanceStatus::Failed, error.clone())
                };
                self.append_events(instance, &history, new_events, update).await?;
                warn!(instance, orchestration = %info.orchestration_name, error = %error, "orchestration failed");
                self.in_flight.abort_instance(instance);
            }
        }
        Ok(())
    }

    fn materialize(self: &Arc<Self>, instance: &str, action: crate::Action) {
        match action {
            crate::Action::CallActivity {
                scheduled_seq,
                name,
                input,
                policy,
            } => self.dispatch_activity(ActivityInvocation {
                instance: instance.to_string(),
                scheduled_seq,
                name,
                input,
                policy,
                attempt: 1,
                not_before: None,
            }),
            crate::Action::CreateTimer { timer_seq, fire_at } => self.schedule_timer(instance, timer_seq, fire_at),
            crate::Action::WaitExternal { subscription_seq, name } => {
                debug!(instance, seq = subscription_seq, event = %name, "waiting for external event");
            }
        }
    }

    /// Append the resolution of a scheduled operation (activity outcome or timer
    /// firing) and advance the orchestration. Returns `false` when the instance
    /// is closed or the same resolution is already recorded.
    pub(crate) async fn resolve_and_activate(self: &Arc<Self>, instance: &str, kind: EventKind) -> Result<bool, DurableError> {
        let _guard = self.lock_instance(instance).await;

        let Some(info) = self.load_instance(instance).await? else {
            return Ok(false);
        };
        if info.status.is_terminal() {
            debug!(instance, kind = kind.name(), "instance closed; dropping resolution");
            return Ok(false);
        }
        let history = self.load_history(instance).await?;
        if history.iter().any(|e| resolves_same(&e.kind, &kind)) {
            debug!(instance, kind = kind.name(), "duplicate resolution ignored");
            return Ok(false);
        }
        let kind_name = kind.name();
        self.append_events(instance, &history, vec![kind], InstanceUpdate::default())
            .await?;
        if let Err(e) = self.run_turn_locked(instance).await {
            warn!(instance, kind = kind_name, error = %e, "resolution recorded but turn failed");
        }
        Ok(true)
    }

    /// Close a running instance with `OrchestratorTerminated` and abort its in-flight work.
    pub async fn terminate(self: &Arc<Self>, instance: &str, reason: &str) -> Result<(), DurableError> {
        {
            let _guard = self.lock_instance(instance).await;
            let info = self
                .load_instance(instance)
                .await?
                .ok_or_else(|| DurableError::InstanceNotFound(instance.to_string()))?;
            if info.status.is_terminal() {
                return Err(DurableError::InstanceNotRunning {
                    instance: instance.to_string(),
                    status: info.status.to_string(),
                });
            }
            let history = self.load_history(instance).await?;
            self.append_events(
                instance,
                &history,
                vec![EventKind::OrchestratorTerminated {
                    reason: reason.to_string(),
                }],
                InstanceUpdate::terminal(InstanceStatus::Terminated, reason),
            )
            .await?;
        }
        let aborted = self.in_flight.abort_instance(instance);
        info!(instance, reason, aborted, "instance terminated");
        Ok(())
    }

    /// Resume every running instance: re-arm outstanding activity invocations at
    /// their persisted attempt, re-arm timers, and run a turn.
    async fn recover(self: &Arc<Self>) {
        let mut continuation = None;
        let mut recovered = 0usize;
        loop {
            let query = InstanceQuery {
                status: Some(InstanceStatus::Running),
                page_size: 100,
                continuation: continuation.take(),
                ..InstanceQuery::default()
            };
            let page = match self
                .with_store_retry("list_instances", || self.store.list_instances(query.clone()))
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "recovery aborted: cannot list running instances");
                    return;
                }
            };
            for info in &page.instances {
                if let Err(e) = self.recover_instance(&info.instance_id).await {
                    warn!(instance = %info.instance_id, error = %e, "failed to recover instance");
                } else {
                    recovered += 1;
                }
            }
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered running instances");
        }
    }

    async fn recover_instance(self: &Arc<Self>, instance: &str) -> Result<(), DurableError> {
        let history = self.load_history(instance).await?;
        for invocation in dispatcher::pending_invocations(instance, &history) {
            debug!(instance, seq = invocation.scheduled_seq, attempt = invocation.attempt, "re-arming activity");
            self.dispatch_activity(invocation);
        }
        for (timer_seq, fire_at) in timers::pending_timers(&history) {
            self.schedule_timer(instance, timer_seq, fire_at);
        }
        self.activate(instance).await
    }
}

/// Timestamp for events appended after `history`: wall clock, but never earlier
/// than the last recorded event.
fn event_time(history: &[HistoryEvent]) -> DateTime<Utc> {
    let now = Utc::now();
    match history.last() {
        Some(last) if last.timestamp > now => last.timestamp,
        _ => now,
    }
}

fn resolves_same(existing: &EventKind, new: &EventKind) -> bool {
    match (existing, new) {
        (
            EventKind::ActivityCompleted { scheduled_seq: a, .. } | EventKind::ActivityFailed { scheduled_seq: a, .. },
            EventKind::ActivityCompleted { scheduled_seq: b, .. } | EventKind::ActivityFailed { scheduled_seq: b, .. },
        ) => a == b,
        (EventKind::TimerFired { timer_seq: a }, EventKind::TimerFired { timer_seq: b }) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_and_failure_for_same_seq_are_duplicates() {
        let done = EventKind::ActivityCompleted {
            scheduled_seq: 3,
            result: "x".into(),
        };
        let failed = EventKind::ActivityFailed {
            scheduled_seq: 3,
            error: "e".into(),
            attempt: 1,
        };
        let other = EventKind::ActivityCompleted {
            scheduled_seq: 4,
            result: "x".into(),
        };
        assert!(resolves_same(&done, &failed));
        assert!(!resolves_same(&done, &other));
        assert!(resolves_same(
            &EventKind::TimerFired { timer_seq: 1 },
            &EventKind::TimerFired { timer_seq: 1 }
        ));
    }

    #[test]
    fn in_flight_reservation_is_exclusive() {
        let table = InFlight::default();
        let key = ("i".to_string(), 1);
        assert!(table.reserve(&key));
        assert!(!table.reserve(&key));
        table.finish(&key);
        assert!(table.reserve(&key));
        assert_eq!(table.abort_instance("i"), 1);
        assert!(!table.contains(&key));
    }

    /// In-memory store whose first history read after an armed append fails.
    #[derive(Default)]
    struct FailReadAfterAppend {
        inner: crate::providers::InMemoryProvider,
        enabled: AtomicBool,
        armed: AtomicBool,
    }

    #[async_trait]
    impl Provider for FailReadAfterAppend {
        fn name(&self) -> &str {
            "fail-read-after-append"
        }

        async fn create_instance(&self, instance: crate::providers::NewInstance) -> Result<bool, ProviderError> {
            self.inner.create_instance(instance).await
        }

        async fn append(
            &self,
            instance: &str,
            events: Vec<HistoryEvent>,
            update: InstanceUpdate,
        ) -> Result<u64, ProviderError> {
            let res = self.inner.append(instance, events, update).await;
            if res.is_ok() && self.enabled.load(Ordering::SeqCst) {
                self.armed.store(true, Ordering::SeqCst);
            }
            res
        }

        async fn read(&self, instance: &str) -> Result<Vec<HistoryEvent>, ProviderError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                return Err(ProviderError::permanent("read", "disk detached"));
            }
            self.inner.read(instance).await
        }

        async fn get_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
            self.inner.get_instance(instance).await
        }

        async fn list_instances(&self, query: InstanceQuery) -> Result<crate::providers::InstancePage, ProviderError> {
            self.inner.list_instances(query).await
        }
    }

    fn quiet() -> RuntimeOptions {
        RuntimeOptions::default().with_init_tracing(false)
    }

    fn waiting_and_sleeping() -> OrchestrationRegistry {
        OrchestrationRegistry::builder()
            .register("Wait", |ctx: OrchestrationContext, _input: String| async move {
                Ok(ctx.wait_for_external_event("Go").into_event().await)
            })
            .register("Nap", |ctx: OrchestrationContext, _input: String| async move {
                ctx.create_timer(Duration::from_secs(3600)).into_timer().await;
                Ok("rested".to_string())
            })
            .build()
    }

    async fn start_over(store: &Arc<FailReadAfterAppend>) -> Arc<Runtime> {
        let store: Arc<dyn Provider> = Arc::clone(store) as Arc<dyn Provider>;
        Runtime::start_with_options(store, ActivityRegistry::builder().build(), waiting_and_sleeping(), quiet()).await
    }

    #[tokio::test]
    async fn recorded_event_is_delivered_even_if_the_turn_fails() {
        let store = Arc::new(FailReadAfterAppend::default());
        let rt = start_over(&store).await;
        let id = rt.client().start_new("Wait", "").await.unwrap();

        store.enabled.store(true, Ordering::SeqCst);
        assert_eq!(rt.raise_event(&id, "Go", "pepperoni").await, Ok(EventDelivery::Delivered));
        store.enabled.store(false, Ordering::SeqCst);

        let history = store.read(&id).await.unwrap();
        assert_eq!(history.iter().filter(|e| e.kind.name() == "ExternalEventReceived").count(), 1);
        assert_eq!(rt.client().get_status(&id).await.unwrap().status, InstanceStatus::Running);
        rt.shutdown().await;

        // Recovery runs the turn that was lost.
        let rt = start_over(&store).await;
        let view = rt.client().get_status(&id).await.unwrap();
        assert_eq!(view.status, InstanceStatus::Completed);
        assert_eq!(view.output.as_deref(), Some("pepperoni"));
    }

    #[tokio::test]
    async fn recorded_resolution_reports_success_even_if_the_turn_fails() {
        let store = Arc::new(FailReadAfterAppend::default());
        let rt = start_over(&store).await;
        let id = rt.client().start_new("Nap", "").await.unwrap();
        let fired = EventKind::TimerFired { timer_seq: 1 };

        store.enabled.store(true, Ordering::SeqCst);
        assert_eq!(rt.resolve_and_activate(&id, fired.clone()).await, Ok(true));
        store.enabled.store(false, Ordering::SeqCst);
        assert_eq!(rt.resolve_and_activate(&id, fired).await, Ok(false));
        rt.shutdown().await;

        let rt = start_over(&store).await;
        let view = rt.client().get_status(&id).await.unwrap();
        assert_eq!(view.status, InstanceStatus::Completed);
        assert_eq!(view.output.as_deref(), Some("rested"));
    }

    #[tokio::test]
    async fn instance_locks_do_not_outlive_their_holders() {
        let orchestrations = OrchestrationRegistry::builder()
            .register("Echo", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
            .build();
        let rt = Runtime::start_with_options(
            Arc::new(crate::providers::InMemoryProvider::new()),
            ActivityRegistry::builder().build(),
            orchestrations,
            RuntimeOptions::default().with_init_tracing(false),
        )
        .await;
        let baseline = rt.instance_locks.len();

        for i in 0..1000 {
            let res = rt.raise_event(&format!("missing-{i}"), "Go", "x").await;
            assert!(matches!(res, Err(DurableError::InstanceNotFound(_))));
        }
        assert!(matches!(
            rt.terminate("missing", "gone").await,
            Err(DurableError::InstanceNotFound(_))
        ));
        assert_eq!(rt.instance_locks.len(), baseline);

        let client = rt.client();
        let id = client.start_new("Echo", "hi").await.unwrap();
        assert_eq!(client.get_status(&id).await.unwrap().status, InstanceStatus::Completed);
        assert_eq!(rt.instance_locks.len(), baseline);
    }

    #[tokio::test]
    async fn contended_instance_lock_is_kept_for_waiters() {
        let locks = Arc::new(InstanceLocks::default());
        let held = locks.acquire("i").await;

        let waiting = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _guard = waiting.acquire("i").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn options_builder() {
        let opts = RuntimeOptions::default()
            .with_max_concurrent_activities(0)
            .with_recover_on_start(false)
            .with_init_tracing(false);
        assert_eq!(opts.max_concurrent_activities, 1);
        assert!(!opts.recover_on_start);
        assert_eq!(opts.store_retry_attempts, 5);
    }
}
