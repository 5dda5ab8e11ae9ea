//! Durable timers: one sleeping task per `TimerCreated` that appends `TimerFired`
//! when due. Recovery re-arms timers that had not fired.
use super::Runtime;
use crate::{EventKind, HistoryEvent};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

impl Runtime {
    pub(crate) fn schedule_timer(self: &Arc<Self>, instance: &str, timer_seq: u64, fire_at: DateTime<Utc>) {
        if self.is_shutting_down() {
            return;
        }
        let key = (instance.to_string(), timer_seq);
        if !self.in_flight.reserve(&key) {
            return;
        }
        let rt = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
            debug!(instance = %task_key.0, seq = task_key.1, delay_ms = delay.as_millis() as u64, "timer armed");
            tokio::time::sleep(delay).await;
            rt.in_flight.finish(&task_key);
            if let Err(e) = rt
                .resolve_and_activate(&task_key.0, EventKind::TimerFired { timer_seq: task_key.1 })
                .await
            {
                warn!(instance = %task_key.0, seq = task_key.1, error = %e, "failed to record timer firing");
            }
        });
        self.in_flight.attach(&key, handle.abort_handle());
    }
}

/// `TimerCreated` events in `history` that have not fired yet.
pub(crate) fn pending_timers(history: &[HistoryEvent]) -> Vec<(u64, DateTime<Utc>)> {
    let fired: HashSet<u64> = history
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::TimerFired { timer_seq } => Some(timer_seq),
            _ => None,
        })
        .collect();
    history
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::TimerCreated { fire_at } if !fired.contains(&e.seq) => Some((e.seq, fire_at)),
            _ => None,
        })
        .collect()
}
