//! Pizza order walkthrough
//!
//! Places two orders against a SQLite-backed runtime with the simulated order
//! service (random failures, half-second steps): one the customer confirms and
//! one they reject. Prints each order's stage while it runs and its final
//! status.
//!
//! Run with: `cargo run --example pizza_order`

use durable_pizza::pizza::{self, OrderStage, PizzaOrder, PizzaSize, PizzaWorkflowOptions, SimulationOptions};
use durable_pizza::providers::SqliteProvider;
use durable_pizza::{ActivityRegistry, InstanceStatus, OrchestrationRegistry, Runtime, RuntimeOptions};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let store = Arc::new(SqliteProvider::open_file(temp_dir.path().join("pizza.db")).await?);

    let activities = pizza::register_activities(ActivityRegistry::builder(), SimulationOptions::realistic()).build();
    let options = PizzaWorkflowOptions::default()
        .with_retry_policy(durable_pizza::RetryPolicy::fixed(3, Duration::from_millis(500)));
    let orchestrations = pizza::register_orchestrations(OrchestrationRegistry::builder(), options).build();
    let rt = Runtime::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await;
    let client = rt.client();

    let order = PizzaOrder {
        size: PizzaSize::Large,
        toppings: vec!["mozzarella".into(), "basil".into()],
        address: "221B Baker St".into(),
        phone: "+44 20 7946 0018".into(),
    };
    let confirmed = client.start_new_typed(pizza::ORDER_ORCHESTRATION, &order).await?;
    let rejected = client.start_new_typed(pizza::ORDER_ORCHESTRATION, &order).await?;

    // The customer needs a moment to decide.
    tokio::time::sleep(Duration::from_secs(1)).await;
    for pending in pizza::pending_orders(&client, 10).await? {
        println!("pending {}: {:?} to {}", pending.order_id, pending.order.size, pending.order.address);
    }
    println!("confirm {confirmed}: {:?}", client.raise_event(&confirmed, pizza::CONFIRMATION_EVENT, "true").await?);
    println!("reject  {rejected}: {:?}", client.raise_event(&rejected, pizza::CONFIRMATION_EVENT, "false").await?);

    let mut last_stage = None;
    loop {
        let view = client.get_status(&confirmed).await?;
        let stage = view.custom_status.as_deref().and_then(OrderStage::from_custom_status);
        if stage != last_stage {
            println!("order {confirmed} is {stage:?}");
            last_stage = stage;
        }
        if view.status != InstanceStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for id in [&confirmed, &rejected] {
        let view = client.wait_for_completion(id, Duration::from_secs(30)).await?;
        println!("{id}: {} -> {}", view.status, view.output.unwrap_or_default());
    }

    let status = pizza::order_status(&client, &rejected).await?;
    println!("{rejected} is {:?}", status.status);
    let page = client.list_instances(None, 10, None).await?;
    println!("{} orders on record", page.instances.len());

    rt.shutdown().await;
    Ok(())
}
