//! Routing of named external events to the instance waiting for them.
//!
//! Each event name has a single buffer slot per instance. An event raised while
//! nothing waits on its name is kept for the next wait; while that slot is
//! occupied further events for the name are dropped.
use super::Runtime;
use crate::error::DurableError;
use crate::providers::InstanceUpdate;
use crate::{EventKind, HistoryEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What `raise_event` did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventDelivery {
    /// A wait on this name was pending; the orchestration has advanced.
    Delivered,
    /// Nothing waited yet; the event is kept for the next wait on this name.
    Buffered,
    /// An earlier unconsumed event already occupies the slot; nothing was recorded.
    Dropped,
}

/// Counts of subscriptions and received events for `name`.
fn slot_state(history: &[HistoryEvent], name: &str) -> (usize, usize) {
    history.iter().fold((0, 0), |(subs, received), e| match &e.kind {
        EventKind::ExternalSubscribed { name: n } if n == name => (subs + 1, received),
        EventKind::ExternalEventReceived { name: n, .. } if n == name => (subs, received + 1),
        _ => (subs, received),
    })
}

/// Decide delivery from history alone. The k-th wait on a name consumes the
/// k-th received event with that name.
pub(crate) fn classify(history: &[HistoryEvent], name: &str) -> EventDelivery {
    let (subscriptions, received) = slot_state(history, name);
    if subscriptions > received {
        EventDelivery::Delivered
    } else if received == subscriptions {
        EventDelivery::Buffered
    } else {
        EventDelivery::Dropped
    }
}

impl Runtime {
    /// Route an external event to `instance`.
    ///
    /// # Errors
    ///
    /// `InstanceNotFound` for an unknown id, `InstanceNotRunning` once the
    /// instance reached a terminal state.
    pub async fn raise_event(
        self: &Arc<Self>,
        instance: &str,
        name: &str,
        payload: impl Into<String>,
    ) -> Result<EventDelivery, DurableError> {
        let payload = payload.into();
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
        let delivery = classify(&history, name);
        match delivery {
            EventDelivery::Dropped => {
                info!(instance, event = name, "slot occupied; dropping external event");
                return Ok(delivery);
            }
            EventDelivery::Buffered => {
                debug!(instance, event = name, "no pending wait; buffering external event");
            }
            EventDelivery::Delivered => {
                debug!(instance, event = name, "delivering external event");
            }
        }

        self.append_events(
            instance,
            &history,
            vec![EventKind::ExternalEventReceived {
                name: name.to_string(),
                payload,
            }],
            InstanceUpdate::default(),
        )
        .await?;
        // The event is recorded; a failed turn is re-run on the next activation or recovery.
        if delivery == EventDelivery::Delivered {
            if let Err(e) = self.run_turn_locked(instance).await {
                warn!(instance, event = name, error = %e, "event recorded but turn failed");
            }
        }
        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn ev(seq: u64, kind: EventKind) -> HistoryEvent {
        HistoryEvent::new(seq, DateTime::<Utc>::UNIX_EPOCH, kind)
    }

    fn sub(seq: u64, name: &str) -> HistoryEvent {
        ev(seq, EventKind::ExternalSubscribed { name: name.into() })
    }

    fn recv(seq: u64, name: &str) -> HistoryEvent {
        ev(
            seq,
            EventKind::ExternalEventReceived {
                name: name.into(),
                payload: "p".into(),
            },
        )
    }

    #[test]
    fn classification_follows_slot_state() {
        assert_eq!(classify(&[], "Go"), EventDelivery::Buffered);
        assert_eq!(classify(&[sub(1, "Go")], "Go"), EventDelivery::Delivered);
        assert_eq!(classify(&[sub(1, "Go"), recv(2, "Go")], "Go"), EventDelivery::Buffered);
        assert_eq!(classify(&[recv(1, "Go")], "Go"), EventDelivery::Dropped);
        // Other names do not share the slot.
        assert_eq!(classify(&[recv(1, "Stop")], "Go"), EventDelivery::Buffered);
    }
}
