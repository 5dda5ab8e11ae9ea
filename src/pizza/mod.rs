//! Pizza ordering on top of the durable runtime: the order input, the step
//! result union, simulated order-service activities, the
//! `OrderOrchestrator` workflow and order status views.
//!
//! ```no_run
//! use durable_pizza::pizza::{self, PizzaWorkflowOptions, SimulationOptions};
//! use durable_pizza::{ActivityRegistry, OrchestrationRegistry, Runtime};
//!
//! # async fn demo() -> Result<(), durable_pizza::DurableError> {
//! let activities = pizza::register_activities(ActivityRegistry::builder(), SimulationOptions::default()).build();
//! let orchestrations =
//!     pizza::register_orchestrations(OrchestrationRegistry::builder(), PizzaWorkflowOptions::default()).build();
//! let rt = Runtime::start(activities, orchestrations).await;
//! let client = rt.client();
//! let order = r#"{"size":"large","toppings":["basil"],"address":"1 Main St","phone":"5550100"}"#;
//! let id = client.start_new(pizza::ORDER_ORCHESTRATION, order).await?;
//! client.raise_event(&id, pizza::CONFIRMATION_EVENT, "true").await?;
//! # Ok(())
//! # }
//! ```
mod activities;
mod order;
mod orders;
mod result;
mod workflow;

pub use activities::{
    register_activities, AlwaysSucceed, FailActivities, OutcomePolicy, PaymentRequest, RandomRates, SimulationOptions,
    SubmitOrderRequest,
};
pub use order::{PizzaOrder, PizzaSize};
pub use orders::{order_status, pending_orders, OrderProgress, OrderView};
pub use result::{OrderResult, OrderResultKind};
pub use workflow::{register_orchestrations, OrderStage, PizzaOrderWorkflow, PizzaWorkflowOptions};

pub const ORDER_ORCHESTRATION: &str = "OrderOrchestrator";
/// External event carrying the customer's `true`/`false` confirmation.
pub const CONFIRMATION_EVENT: &str = "OrderConfirmation";

pub const SUBMIT_ORDER: &str = "SubmitOrder";
pub const PROCESS_PAYMENT: &str = "ProcessPayment";
pub const PREPARE_PIZZA: &str = "PreparePizza";
pub const UPDATE_DELIVERY_STATUS: &str = "UpdateDeliveryStatus";
pub const COMPLETE_ORDER: &str = "CompleteOrder";
