//! Durable, replay-driven orchestration engine.
//!
//! Orchestrations are ordinary `async` functions. Every durable operation they
//! await (an activity call, an external event, a timer) is recorded in an
//! append-only per-instance history. When an instance is activated again the
//! function is re-run from the start and each await is resolved positionally
//! against that history: the Nth await claims the Nth scheduling event. Awaits
//! that already have an outcome in history resume immediately; the first one
//! that does not suspends the turn and emits a new command.
//!
//! Reordering awaited operations between versions of a workflow definition
//! corrupts in-flight instances. Instances are pinned to the semver version
//! they started with, and replay flags any mismatch as nondeterminism.
//!
//! - Data model: [`HistoryEvent`], [`EventKind`], [`Action`]
//! - Orchestration API: [`OrchestrationContext`], [`DurableFuture`]
//! - Single-turn driver: [`run_turn`]
//! - Engine: [`runtime::Runtime`], [`client::Client`], [`providers`]
//! - Example domain: [`pizza`]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

pub mod client;
mod error;
pub mod futures;
pub mod logging;
pub mod pizza;
pub mod providers;
pub mod runtime;

pub use client::{Client, InstancePageView, InstanceStatusView};
pub use error::{ActivityError, DurableError};
pub use futures::{DurableFuture, DurableOutput};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{ActivityContext, EventDelivery, InstanceStatus, Runtime, RuntimeOptions};

use crate::futures::ScheduleRequest;

// Typed JSON helpers shared by the context, client and registries.
pub(crate) mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};

    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        serde_json::to_string(v).map_err(|e| e.to_string())
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        serde_json::from_str(s).map_err(|e| e.to_string())
    }
}

/// One persisted record of an instance history.
///
/// `seq` starts at 0 for `OrchestratorStarted` and increases by one per event
/// with no gaps. `timestamp` is assigned by the runtime when the event is
/// appended and is never read from the wall clock during replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl HistoryEvent {
    pub fn new(seq: u64, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self { seq, timestamp, kind }
    }
}

/// Tagged payload of a history record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventKind {
    /// Instance was created with the given workflow name, pinned version and input.
    OrchestratorStarted { name: String, version: String, input: String },
    /// An activity attempt was scheduled. `retry_of` is `None` for the first attempt
    /// and points at the first attempt's sequence number for retries.
    ActivityScheduled {
        name: String,
        input: String,
        attempt: u32,
        retry_of: Option<u64>,
        policy: RetryPolicy,
    },
    ActivityCompleted { scheduled_seq: u64, result: String },
    /// Final failure of an invocation once its retry policy is exhausted.
    ActivityFailed { scheduled_seq: u64, error: String, attempt: u32 },
    /// The orchestration reached a wait on the named external event.
    ExternalSubscribed { name: String },
    ExternalEventReceived { name: String, payload: String },
    TimerCreated { fire_at: DateTime<Utc> },
    TimerFired { timer_seq: u64 },
    OrchestratorCompleted { output: String },
    OrchestratorFailed { error: String },
    OrchestratorTerminated { reason: String },
}

impl EventKind {
    /// Stable discriminant used for persistence and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::OrchestratorStarted { .. } => "OrchestratorStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::ExternalSubscribed { .. } => "ExternalSubscribed",
            EventKind::ExternalEventReceived { .. } => "ExternalEventReceived",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::OrchestratorCompleted { .. } => "OrchestratorCompleted",
            EventKind::OrchestratorFailed { .. } => "OrchestratorFailed",
            EventKind::OrchestratorTerminated { .. } => "OrchestratorTerminated",
        }
    }

    /// Scheduling events are the ones awaits are correlated against positionally.
    /// Retry attempts are excluded: they belong to an invocation already claimed.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityScheduled { retry_of: None, .. }
                | EventKind::ExternalSubscribed { .. }
                | EventKind::TimerCreated { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestratorCompleted { .. }
                | EventKind::OrchestratorFailed { .. }
                | EventKind::OrchestratorTerminated { .. }
        )
    }
}

/// Commands produced by an orchestration turn. The runtime materializes them
/// after the matching scheduling events are persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CallActivity {
        scheduled_seq: u64,
        name: String,
        input: String,
        policy: RetryPolicy,
    },
    WaitExternal { subscription_seq: u64, name: String },
    CreateTimer { timer_seq: u64, fire_at: DateTime<Utc> },
}

/// Delay strategy between activity attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    None,
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, multiplier: f64, max: Duration },
}

impl BackoffStrategy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt.max(1)).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exp = attempt.saturating_sub(1).min(64) as i32;
                let nanos = base.as_nanos() as f64 * multiplier.powi(exp);
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    *max
                } else {
                    Duration::from_nanos(nanos as u64)
                }
            }
        }
    }
}

/// Retry policy attached to an activity invocation and persisted with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-attempt timeout. A timed-out attempt counts as a failure.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                max: Duration::from_secs(30),
            },
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// `max_attempts` attempts separated by a constant `retry_interval`.
    pub fn fixed(max_attempts: u32, retry_interval: Duration) -> Self {
        Self::new(max_attempts).with_backoff(BackoffStrategy::Fixed { delay: retry_interval })
    }

    /// A single attempt and no retries.
    pub fn no_retry() -> Self {
        Self::new(1).with_backoff(BackoffStrategy::None)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_interval(&self, failed_attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(failed_attempt)
    }
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    instance: String,
    orchestration: String,
    version: String,
    history: Vec<HistoryEvent>,
    /// Indices into `history` of scheduling events, in order.
    schedule_index: Vec<usize>,
    next_schedule: usize,
    /// Scheduling events created during this turn.
    new_events: Vec<EventKind>,
    actions: Vec<Action>,
    /// Per-name count of external waits claimed so far; used to pair waits with events.
    external_claims: HashMap<String, usize>,
    current_time: DateTime<Utc>,
    custom_status: Option<String>,
    nondeterminism: Option<String>,
    /// A durable call that cannot be scheduled at all; fails the turn.
    fault: Option<String>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<HistoryEvent>) -> Self {
        let (orchestration, version, started_at) = history
            .iter()
            .find_map(|e| match &e.kind {
                EventKind::OrchestratorStarted { name, version, .. } => {
                    Some((name.clone(), version.clone(), e.timestamp))
                }
                _ => None,
            })
            .unwrap_or_else(|| (String::new(), String::new(), DateTime::<Utc>::UNIX_EPOCH));
        let schedule_index = history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind.is_scheduling())
            .map(|(i, _)| i)
            .collect();
        Self {
            instance,
            orchestration,
            version,
            history,
            schedule_index,
            next_schedule: 0,
            new_events: Vec::new(),
            actions: Vec::new(),
            external_claims: HashMap::new(),
            current_time: started_at,
            custom_status: None,
            nondeterminism: None,
            fault: None,
        }
    }

    fn next_seq(&self) -> u64 {
        (self.history.len() + self.new_events.len()) as u64
    }

    fn is_replaying(&self) -> bool {
        self.next_schedule < self.schedule_index.len()
    }

    /// Claim the next scheduling event for `request`, creating it when history is exhausted.
    /// Returns `None` when replay diverged from history or the request cannot be scheduled.
    pub(crate) fn claim(&mut self, request: &ScheduleRequest) -> Option<u64> {
        if self.nondeterminism.is_some() || self.fault.is_some() {
            return None;
        }
        if let Some(&idx) = self.schedule_index.get(self.next_schedule) {
            self.next_schedule += 1;
            let recorded = &self.history[idx];
            if request.matches(&recorded.kind) {
                return Some(recorded.seq);
            }
            self.nondeterminism = Some(format!(
                "nondeterministic: await #{} expected {} but history has {} at seq {}",
                self.next_schedule,
                request.describe(),
                describe_scheduling(&recorded.kind),
                recorded.seq
            ));
            return None;
        }
        let seq = self.next_seq();
        let (kind, action) = match request.materialize(seq, self.current_time) {
            Ok(scheduled) => scheduled,
            Err(fault) => {
                self.fault = Some(fault);
                return None;
            }
        };
        self.new_events.push(kind);
        self.actions.push(action);
        Some(seq)
    }

    pub(crate) fn next_external_ordinal(&mut self, name: &str) -> usize {
        let n = self.external_claims.entry(name.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    fn advance_time(&mut self, ts: DateTime<Utc>) {
        if ts > self.current_time {
            self.current_time = ts;
        }
    }

    pub(crate) fn activity_outcome(&mut self, scheduled_seq: u64) -> Option<Result<String, ActivityError>> {
        let (outcome, ts) = self.history.iter().find_map(|e| match &e.kind {
            EventKind::ActivityCompleted { scheduled_seq: s, result } if *s == scheduled_seq => {
                Some((Ok(result.clone()), e.timestamp))
            }
            EventKind::ActivityFailed {
                scheduled_seq: s,
                error,
                attempt,
            } if *s == scheduled_seq => Some((
                Err(ActivityError::Terminal {
                    message: error.clone(),
                    attempts: *attempt,
                }),
                e.timestamp,
            )),
            _ => None,
        })?;
        self.advance_time(ts);
        Some(outcome)
    }

    pub(crate) fn external_payload(&mut self, name: &str, ordinal: usize) -> Option<String> {
        let (payload, ts) = self
            .history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ExternalEventReceived { name: n, payload } if n == name => {
                    Some((payload.clone(), e.timestamp))
                }
                _ => None,
            })
            .nth(ordinal.checked_sub(1)?)?;
        self.advance_time(ts);
        Some(payload)
    }

    pub(crate) fn timer_fired(&mut self, timer_seq: u64) -> bool {
        let ts = self.history.iter().find_map(|e| match &e.kind {
            EventKind::TimerFired { timer_seq: t } if *t == timer_seq => Some(e.timestamp),
            _ => None,
        });
        match ts {
            Some(ts) => {
                self.advance_time(ts);
                true
            }
            None => false,
        }
    }
}

fn describe_scheduling(kind: &EventKind) -> String {
    match kind {
        EventKind::ActivityScheduled { name, input, .. } => format!("ActivityScheduled('{name}','{input}')"),
        EventKind::ExternalSubscribed { name } => format!("ExternalSubscribed('{name}')"),
        EventKind::TimerCreated { .. } => "TimerCreated".to_string(),
        other => other.name().to_string(),
    }
}

/// User-facing orchestration context for scheduling durable work and
/// replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a context over an existing history.
    pub fn new(instance: impl Into<String>, history: Vec<HistoryEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history))),
        }
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, CtxInner> {
        self.inner.lock().expect("orchestration context mutex poisoned")
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    pub fn orchestration_name(&self) -> String {
        self.lock().orchestration.clone()
    }

    pub fn orchestration_version(&self) -> String {
        self.lock().version.clone()
    }

    /// Deterministic "now": the timestamp of the latest history event the
    /// orchestration has observed.
    pub fn utc_now(&self) -> DateTime<Utc> {
        self.lock().current_time
    }

    /// True while the orchestration is re-executing code a previous turn already ran.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    /// Publish a custom status payload for status queries. Not recorded in history.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.lock().custom_status = Some(status.into());
    }

    /// Schedule an activity with the default retry policy.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity_with_retry(name, input, RetryPolicy::default())
    }

    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into(), policy)
    }

    /// Schedule an activity with typed input and output encoded as JSON.
    pub async fn schedule_activity_typed<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
        policy: RetryPolicy,
    ) -> Result<Out, ActivityError> {
        let payload = _typed_codec::encode(input).map_err(|e| ActivityError::Terminal {
            message: format!("encode activity input: {e}"),
            attempts: 0,
        })?;
        let raw = self.schedule_activity_with_retry(name, payload, policy).into_activity().await?;
        _typed_codec::decode(&raw).map_err(|e| ActivityError::Terminal {
            message: format!("decode activity output: {e}"),
            attempts: 0,
        })
    }

    /// Suspend until an external event with this name is routed to the instance.
    pub fn wait_for_external_event(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::external(self.clone(), name.into())
    }

    /// Durable timer relative to [`utc_now`](Self::utc_now).
    pub fn create_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::timer(self.clone(), delay)
    }

    fn take_turn_state(&self) -> TurnState {
        let mut inner = self.lock();
        TurnState {
            new_events: std::mem::take(&mut inner.new_events),
            actions: std::mem::take(&mut inner.actions),
            custom_status: inner.custom_status.take(),
            nondeterminism: inner.nondeterminism.take(),
            fault: inner.fault.take(),
        }
    }

    fn unclaimed_schedules(&self) -> usize {
        let inner = self.lock();
        inner.schedule_index.len().saturating_sub(inner.next_schedule)
    }
}

struct TurnState {
    new_events: Vec<EventKind>,
    actions: Vec<Action>,
    custom_status: Option<String>,
    nondeterminism: Option<String>,
    fault: Option<String>,
}

/// Everything one deterministic evaluation of an orchestration produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Scheduling events to append, in order, after the existing history.
    pub new_events: Vec<EventKind>,
    pub actions: Vec<Action>,
    /// `Some` once the orchestration function returned.
    pub output: Option<Result<String, String>>,
    pub custom_status: Option<String>,
    pub nondeterminism: Option<String>,
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    // SAFETY: the vtable functions ignore the data pointer entirely.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    fut.poll(&mut cx)
}

/// Run one deterministic turn of `orchestrator` against `history`.
///
/// Durable futures resolve synchronously from history, so a single poll
/// drives the function as far as recorded outcomes allow.
pub fn run_turn<F>(
    instance: &str,
    history: Vec<HistoryEvent>,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnOutcome
where
    F: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(instance, history);
    let fut = orchestrator(ctx.clone());
    let mut fut = std::pin::pin!(fut);
    let polled = poll_once(fut.as_mut());
    let leftover = ctx.unclaimed_schedules();
    let TurnState {
        new_events,
        actions,
        custom_status,
        mut nondeterminism,
        fault,
    } = ctx.take_turn_state();

    let output = match polled {
        Poll::Ready(out) => {
            if nondeterminism.is_none() && leftover > 0 {
                nondeterminism = Some(format!(
                    "nondeterministic: orchestration finished with {leftover} recorded operation(s) never awaited"
                ));
            }
            Some(out)
        }
        Poll::Pending => None,
    };

    if nondeterminism.is_some() {
        return TurnOutcome {
            new_events: Vec::new(),
            actions: Vec::new(),
            output: None,
            custom_status,
            nondeterminism,
        };
    }

    if let Some(fault) = fault {
        return TurnOutcome {
            new_events: Vec::new(),
            actions: Vec::new(),
            output: Some(Err(fault)),
            custom_status,
            nondeterminism: None,
        };
    }

    TurnOutcome {
        new_events,
        actions,
        output,
        custom_status,
        nondeterminism: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(seq: u64, kind: EventKind) -> HistoryEvent {
        HistoryEvent::new(seq, DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(seq as i64), kind)
    }

    fn started() -> HistoryEvent {
        ev(
            0,
            EventKind::OrchestratorStarted {
                name: "Greeter".into(),
                version: "1.0.0".into(),
                input: "world".into(),
            },
        )
    }

    async fn greeter(ctx: OrchestrationContext) -> Result<String, String> {
        let a = ctx
            .schedule_activity_with_retry("Hello", "world", RetryPolicy::no_retry())
            .into_activity()
            .await
            .map_err(|e| e.to_string())?;
        let b = ctx.wait_for_external_event("Go").into_event().await;
        Ok(format!("{a}/{b}"))
    }

    #[test]
    fn first_turn_emits_activity_command() {
        let out = run_turn("i1", vec![started()], greeter);
        assert!(out.output.is_none());
        assert_eq!(out.new_events.len(), 1);
        match &out.actions[..] {
            [Action::CallActivity { scheduled_seq, name, .. }] => {
                assert_eq!(*scheduled_seq, 1);
                assert_eq!(name, "Hello");
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn completed_history_replays_to_output() {
        let policy = RetryPolicy::no_retry();
        let history = vec![
            started(),
            ev(
                1,
                EventKind::ActivityScheduled {
                    name: "Hello".into(),
                    input: "world".into(),
                    attempt: 1,
                    retry_of: None,
                    policy,
                },
            ),
            ev(2, EventKind::ActivityCompleted { scheduled_seq: 1, result: "hi".into() }),
            ev(3, EventKind::ExternalSubscribed { name: "Go".into() }),
            ev(4, EventKind::ExternalEventReceived { name: "Go".into(), payload: "now".into() }),
        ];
        let out = run_turn("i1", history, greeter);
        assert!(out.actions.is_empty());
        assert_eq!(out.output, Some(Ok("hi/now".to_string())));
    }

    #[test]
    fn diverging_history_is_nondeterministic() {
        let history = vec![started(), ev(1, EventKind::ExternalSubscribed { name: "Go".into() })];
        let out = run_turn("i1", history, greeter);
        let msg = out.nondeterminism.expect("nondeterminism expected");
        assert!(msg.contains("ExternalSubscribed('Go')"), "{msg}");
        assert!(out.new_events.is_empty());
    }

    #[test]
    fn backoff_strategies() {
        let linear = BackoffStrategy::Linear {
            base: Duration::from_millis(100),
            max: Duration::from_millis(250),
        };
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(250));

        let exp = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(1),
        };
        assert_eq!(exp.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(exp.delay_for_attempt(60), Duration::from_secs(1));

        assert_eq!(RetryPolicy::fixed(3, Duration::from_secs(5)).retry_interval(2), Duration::from_secs(5));
    }

    #[test]
    #[should_panic(expected = "max_attempts must be at least 1")]
    fn zero_attempt_policy_panics() {
        let _ = RetryPolicy::new(0);
    }
}
