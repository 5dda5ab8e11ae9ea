use crate::error::DurableError;
use crate::runtime::registry::OrchestrationRegistry;
use crate::runtime::OrchestrationHandler;
use crate::{Action, EventKind, HistoryEvent, TurnOutcome};
use semver::Version;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of executing an orchestration turn
#[derive(Debug, PartialEq)]
pub(crate) enum TurnResult {
    /// Logic is blocked on an unresolved await; `new_events` are the scheduling
    /// events this turn created and `actions` the matching commands.
    Continue {
        new_events: Vec<EventKind>,
        actions: Vec<Action>,
        custom_status: Option<String>,
    },
    Completed {
        new_events: Vec<EventKind>,
        output: String,
        custom_status: Option<String>,
    },
    /// Orchestration returned an error, panicked, diverged from its history, or
    /// its pinned version is no longer registered.
    Failed {
        new_events: Vec<EventKind>,
        error: String,
        custom_status: Option<String>,
    },
}

/// Resolve the pinned handler for `history` and evaluate one turn.
pub(crate) fn execute(registry: &OrchestrationRegistry, instance: &str, history: Vec<HistoryEvent>) -> TurnResult {
    let Some((name, version, input)) = history.iter().find_map(|e| match &e.kind {
        EventKind::OrchestratorStarted { name, version, input } => {
            Some((name.clone(), version.clone(), input.clone()))
        }
        _ => None,
    }) else {
        return failed(format!("corrupted history for {instance}: missing OrchestratorStarted"));
    };

    let handler = match Version::parse(&version) {
        Ok(v) => registry.resolve_handler_exact(&name, &v),
        Err(_) => None,
    };
    let Some(handler) = handler else {
        warn!(instance, orchestration = %name, version = %version, "pinned orchestration version is not registered");
        return failed(format!("unregistered version: {name}@{version}"));
    };

    debug!(instance, orchestration = %name, version = %version, history_len = history.len(), "replaying turn");
    run_handler(handler, instance, history, input)
}

fn run_handler(
    handler: Arc<dyn OrchestrationHandler>,
    instance: &str,
    history: Vec<HistoryEvent>,
    input: String,
) -> TurnResult {
    let run_result = catch_unwind(AssertUnwindSafe(|| {
        crate::run_turn(instance, history, move |ctx| async move { handler.invoke(ctx, input).await })
    }));

    let outcome: TurnOutcome = match run_result {
        Ok(outcome) => outcome,
        Err(panic_payload) => {
            let msg = panic_message(panic_payload.as_ref());
            warn!(instance, error = %msg, "orchestration panicked");
            return failed(format!("orchestration panicked: {msg}"));
        }
    };

    if let Some(detail) = outcome.nondeterminism {
        let err = DurableError::Nondeterminism(detail);
        warn!(instance, error = %err, "nondeterminism detected");
        return TurnResult::Failed {
            new_events: Vec::new(),
            error: err.to_string(),
            custom_status: outcome.custom_status,
        };
    }

    match outcome.output {
        None => TurnResult::Continue {
            new_events: outcome.new_events,
            actions: outcome.actions,
            custom_status: outcome.custom_status,
        },
        Some(Ok(output)) => TurnResult::Completed {
            new_events: outcome.new_events,
            output,
            custom_status: outcome.custom_status,
        },
        Some(Err(error)) => TurnResult::Failed {
            new_events: outcome.new_events,
            error,
            custom_status: outcome.custom_status,
        },
    }
}

fn failed(error: String) -> TurnResult {
    TurnResult::Failed {
        new_events: Vec::new(),
        error,
        custom_status: None,
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
