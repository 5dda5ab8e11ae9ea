use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{Action, ActivityError, EventKind, OrchestrationContext, RetryPolicy};

/// What an await asks of history when it claims its scheduling slot.
#[derive(Debug, Clone)]
pub(crate) enum ScheduleRequest {
    Activity {
        name: String,
        input: String,
        policy: RetryPolicy,
    },
    External {
        name: String,
    },
    Timer {
        delay: Duration,
    },
}

impl ScheduleRequest {
    /// Whether a recorded scheduling event satisfies this request.
    pub(crate) fn matches(&self, recorded: &EventKind) -> bool {
        match (self, recorded) {
            (
                ScheduleRequest::Activity { name, input, .. },
                EventKind::ActivityScheduled {
                    name: n,
                    input: i,
                    retry_of: None,
                    ..
                },
            ) => n == name && i == input,
            (ScheduleRequest::External { name }, EventKind::ExternalSubscribed { name: n }) => n == name,
            (ScheduleRequest::Timer { .. }, EventKind::TimerCreated { .. }) => true,
            _ => false,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            ScheduleRequest::Activity { name, input, .. } => format!("ActivityScheduled('{name}','{input}')"),
            ScheduleRequest::External { name } => format!("ExternalSubscribed('{name}')"),
            ScheduleRequest::Timer { delay } => format!("TimerCreated({delay:?})"),
        }
    }

    /// Build the scheduling event and the command for a first-time await.
    pub(crate) fn materialize(&self, seq: u64, now: DateTime<Utc>) -> Result<(EventKind, Action), String> {
        Ok(match self {
            ScheduleRequest::Activity { name, input, policy } => (
                EventKind::ActivityScheduled {
                    name: name.clone(),
                    input: input.clone(),
                    attempt: 1,
                    retry_of: None,
                    policy: policy.clone(),
                },
                Action::CallActivity {
                    scheduled_seq: seq,
                    name: name.clone(),
                    input: input.clone(),
                    policy: policy.clone(),
                },
            ),
            ScheduleRequest::External { name } => (
                EventKind::ExternalSubscribed { name: name.clone() },
                Action::WaitExternal {
                    subscription_seq: seq,
                    name: name.clone(),
                },
            ),
            ScheduleRequest::Timer { delay } => {
                let fire_at = chrono::Duration::from_std(*delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .ok_or_else(|| format!("timer delay {delay:?} from {now} is past the supported date range"))?;
                (
                    EventKind::TimerCreated { fire_at },
                    Action::CreateTimer { timer_seq: seq, fire_at },
                )
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, ActivityError>),
    External(String),
    Timer,
}

/// A durable operation awaited by an orchestration.
///
/// On first poll the future claims the next scheduling event in history (or
/// creates one); every later poll only looks up the outcome for that claim.
pub struct DurableFuture {
    request: ScheduleRequest,
    claimed: Cell<Option<u64>>,
    /// For external waits: this wait is the Nth one on its event name.
    ordinal: Cell<Option<usize>>,
    ctx: OrchestrationContext,
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String, policy: RetryPolicy) -> Self {
        Self::with_request(ctx, ScheduleRequest::Activity { name, input, policy })
    }

    pub(crate) fn external(ctx: OrchestrationContext, name: String) -> Self {
        Self::with_request(ctx, ScheduleRequest::External { name })
    }

    pub(crate) fn timer(ctx: OrchestrationContext, delay: Duration) -> Self {
        Self::with_request(ctx, ScheduleRequest::Timer { delay })
    }

    fn with_request(ctx: OrchestrationContext, request: ScheduleRequest) -> Self {
        Self {
            request,
            claimed: Cell::new(None),
            ordinal: Cell::new(None),
            ctx,
        }
    }

    /// Await an activity outcome.
    pub fn into_activity(self) -> impl Future<Output = Result<String, ActivityError>> {
        Narrow(self, |out| match out {
            DurableOutput::Activity(v) => v,
            other => panic!("into_activity used on non-activity future: {other:?}"),
        })
    }

    /// Await an external event payload.
    pub fn into_event(self) -> impl Future<Output = String> {
        Narrow(self, |out| match out {
            DurableOutput::External(v) => v,
            other => panic!("into_event used on non-external future: {other:?}"),
        })
    }

    pub fn into_timer(self) -> impl Future<Output = ()> {
        Narrow(self, |out| match out {
            DurableOutput::Timer => (),
            other => panic!("into_timer used on non-timer future: {other:?}"),
        })
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.lock();

        if this.claimed.get().is_none() {
            match inner.claim(&this.request) {
                Some(seq) => this.claimed.set(Some(seq)),
                // Divergence is recorded on the context; the turn fails after polling.
                None => return Poll::Pending,
            }
            if let ScheduleRequest::External { name } = &this.request {
                this.ordinal.set(Some(inner.next_external_ordinal(name)));
            }
        }
        let Some(seq) = this.claimed.get() else {
            return Poll::Pending;
        };

        match &this.request {
            ScheduleRequest::Activity { .. } => match inner.activity_outcome(seq) {
                Some(outcome) => Poll::Ready(DurableOutput::Activity(outcome)),
                None => Poll::Pending,
            },
            ScheduleRequest::External { name } => {
                let ordinal = this.ordinal.get().unwrap_or(0);
                match inner.external_payload(name, ordinal) {
                    Some(payload) => Poll::Ready(DurableOutput::External(payload)),
                    None => Poll::Pending,
                }
            }
            ScheduleRequest::Timer { .. } => {
                if inner.timer_fired(seq) {
                    Poll::Ready(DurableOutput::Timer)
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

struct Narrow<T>(DurableFuture, fn(DurableOutput) -> T);

impl<T> Future for Narrow<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let map = this.1;
        Pin::new(&mut this.0).poll(cx).map(map)
    }
}
