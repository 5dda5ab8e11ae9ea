//! External event routing: delivery, buffering, dropping and closed instances.

use durable_pizza::{
    ActivityRegistry, DurableError, EventDelivery, InstanceStatus, OrchestrationContext, OrchestrationRegistry, Runtime,
};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::*;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn two_waits_runtime() -> Arc<Runtime> {
    let orchestrations = OrchestrationRegistry::builder()
        .register("TwoWaits", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.wait_for_external_event("Topping").into_event().await;
            let b = ctx.wait_for_external_event("Topping").into_event().await;
            Ok(format!("{a}+{b}"))
        })
        .register("Wait", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.wait_for_external_event("Go").into_event().await)
        })
        .build();
    let store: Arc<dyn durable_pizza::providers::Provider> =
        Arc::new(durable_pizza::providers::InMemoryProvider::new());
    Runtime::start_with_options(store, ActivityRegistry::builder().build(), orchestrations, test_options()).await
}

#[tokio::test]
async fn pending_wait_is_unblocked_by_matching_event() {
    let rt = two_waits_runtime().await;
    let client = rt.client();

    let id = client.start_new("Wait", "").await.unwrap();
    // The first turn runs inline, so the wait is already recorded.
    let hist = client.read_history(&id).await.unwrap();
    assert_eq!(count_events(&hist, "ExternalSubscribed"), 1);

    // Events for other names do not unblock it.
    assert_eq!(client.raise_event(&id, "Stop", "x").await.unwrap(), EventDelivery::Buffered);
    assert_eq!(client.get_status(&id).await.unwrap().status, InstanceStatus::Running);

    assert_eq!(client.raise_event(&id, "Go", "ready").await.unwrap(), EventDelivery::Delivered);
    let view = client.wait_for_completion(&id, TIMEOUT).await.unwrap();
    assert_eq!(view.status, InstanceStatus::Completed);
    assert_eq!(view.output.as_deref(), Some("ready"));
    rt.shutdown().await;
}

#[tokio::test]
async fn kth_wait_consumes_kth_event() {
    let rt = two_waits_runtime().await;
    let client = rt.client();

    let id = client.start_new("TwoWaits", "").await.unwrap();
    assert_eq!(client.raise_event(&id, "Topping", "olive").await.unwrap(), EventDelivery::Delivered);
    // The second wait is subscribed by the turn the first delivery triggered.
    assert_eq!(client.raise_event(&id, "Topping", "onion").await.unwrap(), EventDelivery::Delivered);

    let view = client.wait_for_completion(&id, TIMEOUT).await.unwrap();
    assert_eq!(view.output.as_deref(), Some("olive+onion"));
    rt.shutdown().await;
}

#[tokio::test]
async fn occupied_slot_drops_later_events() {
    let rt = two_waits_runtime().await;
    let client = rt.client();
    let id = client.start_new("Wait", "").await.unwrap();

    assert_eq!(client.raise_event(&id, "Other", "1").await.unwrap(), EventDelivery::Buffered);
    assert_eq!(client.raise_event(&id, "Other", "2").await.unwrap(), EventDelivery::Dropped);
    let hist = client.read_history(&id).await.unwrap();
    assert_eq!(count_events(&hist, "ExternalEventReceived"), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn closed_and_unknown_instances_reject_events() {
    let rt = two_waits_runtime().await;
    let client = rt.client();

    let err = client.raise_event("no-such-order", "Go", "x").await.unwrap_err();
    assert_eq!(err, DurableError::InstanceNotFound("no-such-order".into()));
    assert_eq!(err.http_status(), 404);

    let id = client.start_new("Wait", "").await.unwrap();
    client.raise_event(&id, "Go", "done").await.unwrap();
    client.wait_for_completion(&id, TIMEOUT).await.unwrap();

    let err = client.raise_event(&id, "Go", "again").await.unwrap_err();
    assert!(matches!(err, DurableError::InstanceNotRunning { .. }), "{err}");
    assert_eq!(err.http_status(), 409);
    // Nothing was appended after completion.
    let hist = client.read_history(&id).await.unwrap();
    assert!(hist.last().unwrap().kind.is_terminal());
    rt.shutdown().await;
}
