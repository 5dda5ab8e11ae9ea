//! Pending-order listing and single-order status.

use durable_pizza::pizza::{self, OrderProgress, OrderStage, PizzaOrder, PizzaSize, PizzaWorkflowOptions, SimulationOptions};
use durable_pizza::providers::InMemoryProvider;
use durable_pizza::{ActivityRegistry, DurableError, OrchestrationContext, OrchestrationRegistry, Runtime};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::*;

fn order(size: PizzaSize, address: &str) -> PizzaOrder {
    PizzaOrder {
        size,
        toppings: vec!["olive".to_string()],
        address: address.to_string(),
        phone: "555-0100".to_string(),
    }
}

async fn mixed_runtime() -> Arc<Runtime> {
    let activities = pizza::register_activities(ActivityRegistry::builder(), SimulationOptions::default()).build();
    let orchestrations = pizza::register_orchestrations(
        OrchestrationRegistry::builder(),
        PizzaWorkflowOptions::default().with_retry_policy(fast_retry()),
    )
    .register("Inventory", |ctx: OrchestrationContext, _input: String| async move {
        Ok(ctx.wait_for_external_event("Restock").into_event().await)
    })
    .build();
    Runtime::start_with_options(Arc::new(InMemoryProvider::new()), activities, orchestrations, test_options()).await
}

#[tokio::test]
async fn pending_orders_lists_running_orders_only() {
    let rt = mixed_runtime().await;
    let client = rt.client();
    let store = rt.store();

    let first = order(PizzaSize::Small, "1 Main St");
    let second = order(PizzaSize::Large, "2 Elm St");
    let a = client.start_new_typed(pizza::ORDER_ORCHESTRATION, &first).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b = client.start_new_typed(pizza::ORDER_ORCHESTRATION, &second).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let done = client.start_new(pizza::ORDER_ORCHESTRATION, SMALL_ORDER).await.unwrap();
    let inventory = client.start_new("Inventory", "{}").await.unwrap();

    assert!(wait_for_subscription(&store, &done, pizza::CONFIRMATION_EVENT, 2_000).await);
    client.raise_event(&done, pizza::CONFIRMATION_EVENT, "false").await.unwrap();
    client.wait_for_completion(&done, Duration::from_secs(5)).await.unwrap();

    let pending = pizza::pending_orders(&client, 10).await.unwrap();
    let ids: Vec<&str> = pending.iter().map(|o| o.order_id.as_str()).collect();
    assert_eq!(ids, vec![b.as_str(), a.as_str()]);
    assert!(!ids.contains(&inventory.as_str()));
    assert_eq!(pending[0].order, second);
    assert_eq!(pending[1].order, first);
    assert!(pending.iter().all(|o| o.status == OrderProgress::Processing));

    // The other orchestration is still running; it is just not an order.
    let others = client
        .list_orchestration_instances("Inventory", None, 10, None)
        .await
        .unwrap();
    assert_eq!(others.instances.len(), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn order_status_decodes_one_order() {
    let rt = mixed_runtime().await;
    let client = rt.client();
    let store = rt.store();

    let id = client.start_new(pizza::ORDER_ORCHESTRATION, LARGE_ORDER).await.unwrap();
    assert!(wait_for_stage(&client, &id, OrderStage::AwaitingConfirmation, 2_000).await);
    let view = pizza::order_status(&client, &id).await.unwrap();
    assert_eq!(view.status, OrderProgress::Processing);
    assert_eq!(view.stage, Some(OrderStage::AwaitingConfirmation));
    assert_eq!(view.order.size, PizzaSize::Large);
    assert_eq!(view.order.toppings, vec!["mozzarella", "basil"]);

    assert!(wait_for_subscription(&store, &id, pizza::CONFIRMATION_EVENT, 2_000).await);
    client.raise_event(&id, pizza::CONFIRMATION_EVENT, "true").await.unwrap();
    client.wait_for_completion(&id, Duration::from_secs(5)).await.unwrap();
    let view = pizza::order_status(&client, &id).await.unwrap();
    assert_eq!(view.status, OrderProgress::Completed);
    assert_eq!(view.stage, Some(OrderStage::Completed));

    let inventory = client.start_new("Inventory", "{}").await.unwrap();
    assert!(matches!(
        pizza::order_status(&client, &inventory).await,
        Err(DurableError::InstanceNotFound(_))
    ));
    assert!(matches!(
        pizza::order_status(&client, "no-such-order").await,
        Err(DurableError::InstanceNotFound(_))
    ));
    assert!(matches!(
        pizza::pending_orders(&client, 0).await,
        Err(DurableError::InvalidInput(_))
    ));
    rt.shutdown().await;
}
