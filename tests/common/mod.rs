#![allow(dead_code)]

use durable_pizza::pizza::{self, OrderStage, PizzaWorkflowOptions, SimulationOptions};
use durable_pizza::providers::{InMemoryProvider, Provider, SqliteProvider};
use durable_pizza::{ActivityRegistry, Client, EventKind, HistoryEvent, OrchestrationRegistry, RetryPolicy, Runtime, RuntimeOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const LARGE_ORDER: &str =
    r#"{"size":"large","toppings":["mozzarella","basil"],"address":"221B Baker St","phone":"+44 20 7946 0018"}"#;
pub const SMALL_ORDER: &str = r#"{"size":"small","toppings":[],"address":"1 Main St","phone":"555-0100"}"#;

/// Three attempts, 10ms apart.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::fixed(3, Duration::from_millis(10))
}

pub fn test_options() -> RuntimeOptions {
    RuntimeOptions::default().with_store_retry(5, Duration::from_millis(5))
}

pub fn pizza_registries(sim: SimulationOptions) -> (ActivityRegistry, OrchestrationRegistry) {
    let activities = pizza::register_activities(ActivityRegistry::builder(), sim).build();
    let options = PizzaWorkflowOptions::default().with_retry_policy(fast_retry());
    let orchestrations = pizza::register_orchestrations(OrchestrationRegistry::builder(), options).build();
    (activities, orchestrations)
}

pub async fn pizza_runtime_with_store(store: Arc<dyn Provider>, sim: SimulationOptions) -> Arc<Runtime> {
    let (activities, orchestrations) = pizza_registries(sim);
    Runtime::start_with_options(store, activities, orchestrations, test_options()).await
}

/// Pizza runtime over a fresh in-memory store.
pub async fn pizza_runtime(sim: SimulationOptions) -> (Arc<Runtime>, Client) {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt = pizza_runtime_with_store(store, sim).await;
    let client = rt.client();
    (rt, client)
}

pub async fn create_sqlite_store_disk() -> (Arc<dyn Provider>, TempDir, PathBuf) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    let store = Arc::new(SqliteProvider::open_file(&db_path).await.unwrap()) as Arc<dyn Provider>;
    (store, td, db_path)
}

pub async fn wait_for_history<F>(store: &Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[HistoryEvent]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_subscription(store: &Arc<dyn Provider>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(&e.kind, EventKind::ExternalSubscribed { name: n } if n == name))
        },
        timeout_ms,
    )
    .await
}

pub async fn wait_for_stage(client: &Client, instance: &str, stage: OrderStage, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let current = client
            .get_status(instance)
            .await
            .ok()
            .and_then(|v| v.custom_status)
            .and_then(|s| OrderStage::from_custom_status(&s));
        if current == Some(stage) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count_events(hist: &[HistoryEvent], kind: &str) -> usize {
    hist.iter().filter(|e| e.kind.name() == kind).count()
}

/// `ActivityScheduled` events (first attempts and retries) for `activity`.
pub fn scheduled_attempts(hist: &[HistoryEvent], activity: &str) -> Vec<u32> {
    hist.iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled { name, attempt, .. } if name == activity => Some(*attempt),
            _ => None,
        })
        .collect()
}
