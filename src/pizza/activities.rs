//! Simulated order-service activities.
//!
//! Each activity reports an [`OrderResult`]. A simulated failure is returned as
//! an `Err` carrying the error-kind result as JSON, so the dispatcher retries it
//! and the workflow can still read the structured error once retries run out.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::result::{OrderResult, OrderResultKind};
use super::{PizzaOrder, COMPLETE_ORDER, PREPARE_PIZZA, PROCESS_PAYMENT, SUBMIT_ORDER, UPDATE_DELIVERY_STATUS};
use crate::runtime::{ActivityContext, ActivityRegistryBuilder};

/// Input of `SubmitOrder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOrderRequest {
    pub order_id: String,
    pub order: PizzaOrder,
}

/// Input of `ProcessPayment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub order_id: String,
    pub amount: f64,
}

/// Decides whether a simulated activity attempt succeeds.
pub trait OutcomePolicy: Send + Sync {
    fn should_succeed(&self, activity: &str, order_id: &str, attempt: u32) -> bool;
}

/// Every attempt succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSucceed;

impl OutcomePolicy for AlwaysSucceed {
    fn should_succeed(&self, _activity: &str, _order_id: &str, _attempt: u32) -> bool {
        true
    }
}

/// Every attempt of the named activities fails; everything else succeeds.
#[derive(Debug, Clone, Default)]
pub struct FailActivities(HashSet<String>);

impl FailActivities {
    pub fn new<I, S>(activities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(activities.into_iter().map(Into::into).collect())
    }
}

impl OutcomePolicy for FailActivities {
    fn should_succeed(&self, activity: &str, _order_id: &str, _attempt: u32) -> bool {
        !self.0.contains(activity)
    }
}

/// Random outcomes with a per-step success probability.
#[derive(Debug, Clone, Copy)]
pub struct RandomRates {
    pub payment: f64,
    pub preparation: f64,
    pub delivery: f64,
}

impl Default for RandomRates {
    fn default() -> Self {
        Self {
            payment: 0.90,
            preparation: 0.95,
            delivery: 0.85,
        }
    }
}

impl OutcomePolicy for RandomRates {
    fn should_succeed(&self, activity: &str, _order_id: &str, _attempt: u32) -> bool {
        let p = match activity {
            PROCESS_PAYMENT => self.payment,
            PREPARE_PIZZA => self.preparation,
            UPDATE_DELIVERY_STATUS => self.delivery,
            _ => return true,
        };
        rand::thread_rng().gen_bool(p.clamp(0.0, 1.0))
    }
}

/// Latency and outcome model of the simulated order service.
#[derive(Clone)]
pub struct SimulationOptions {
    pub latency: Duration,
    pub outcomes: Arc<dyn OutcomePolicy>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            outcomes: Arc::new(AlwaysSucceed),
        }
    }
}

impl SimulationOptions {
    /// Half-second steps with the service's usual failure rates.
    pub fn realistic() -> Self {
        Self {
            latency: Duration::from_millis(500),
            outcomes: Arc::new(RandomRates::default()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_outcomes(mut self, outcomes: impl OutcomePolicy + 'static) -> Self {
        self.outcomes = Arc::new(outcomes);
        self
    }

    /// Wait out the latency and roll the outcome of this attempt.
    async fn attempt(&self, ctx: &ActivityContext, order_id: &str) -> bool {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let ok = self.outcomes.should_succeed(ctx.activity_name(), order_id, ctx.attempt());
        if !ok {
            ctx.trace_warn(format!("simulated failure for order {order_id}"));
        }
        ok
    }
}

fn succeed(order_id: &str, kind: OrderResultKind) -> Result<OrderResult, String> {
    Ok(OrderResult::new(order_id, Utc::now(), kind))
}

fn fail(order_id: &str, kind: OrderResultKind) -> Result<OrderResult, String> {
    let result = OrderResult::new(order_id, Utc::now(), kind);
    Err(result.to_json().unwrap_or_else(|_| result.message()))
}

async fn submit_order(sim: &SimulationOptions, ctx: ActivityContext, req: SubmitOrderRequest) -> Result<OrderResult, String> {
    ctx.trace_info(format!("submitting {:?} pizza for order {}", req.order.size, req.order_id));
    if !sim.attempt(&ctx, &req.order_id).await {
        return fail(
            &req.order_id,
            OrderResultKind::OrderError {
                error_message: "Failed to submit order".into(),
            },
        );
    }
    succeed(
        &req.order_id,
        OrderResultKind::OrderSubmitted {
            message: "Order submitted successfully".into(),
        },
    )
}

async fn process_payment(sim: &SimulationOptions, ctx: ActivityContext, req: PaymentRequest) -> Result<OrderResult, String> {
    ctx.trace_info(format!("charging ${:.2} for order {}", req.amount, req.order_id));
    if !sim.attempt(&ctx, &req.order_id).await {
        return fail(
            &req.order_id,
            OrderResultKind::PaymentError {
                error_message: "Payment declined".into(),
                attempted_amount: req.amount,
            },
        );
    }
    succeed(&req.order_id, OrderResultKind::PaymentProcessed { amount: req.amount })
}

async fn prepare_pizza(sim: &SimulationOptions, ctx: ActivityContext, order_id: String) -> Result<OrderResult, String> {
    if !sim.attempt(&ctx, &order_id).await {
        return fail(
            &order_id,
            OrderResultKind::PreparationError {
                error_message: "Failed to prepare pizza".into(),
                failed_step: "Oven malfunction".into(),
            },
        );
    }
    succeed(
        &order_id,
        OrderResultKind::PizzaPrepared {
            preparation_details: "Pizza prepared with extra cheese and pepperoni".into(),
        },
    )
}

async fn update_delivery_status(
    sim: &SimulationOptions,
    ctx: ActivityContext,
    order_id: String,
) -> Result<OrderResult, String> {
    if !sim.attempt(&ctx, &order_id).await {
        return fail(
            &order_id,
            OrderResultKind::DeliveryError {
                error_message: "Delivery delayed".into(),
                current_location: "Traffic congestion".into(),
            },
        );
    }
    succeed(
        &order_id,
        OrderResultKind::DeliveryUpdated {
            status: "Out for delivery".into(),
        },
    )
}

async fn complete_order(sim: &SimulationOptions, ctx: ActivityContext, order_id: String) -> Result<OrderResult, String> {
    if !sim.attempt(&ctx, &order_id).await {
        return fail(
            &order_id,
            OrderResultKind::OrderError {
                error_message: "Failed to complete order".into(),
            },
        );
    }
    let completion_message = format!("Order {order_id} has been completed successfully!");
    succeed(&order_id, OrderResultKind::OrderCompleted { completion_message })
}

/// Register the five order-service activities.
pub fn register_activities(builder: ActivityRegistryBuilder, sim: SimulationOptions) -> ActivityRegistryBuilder {
    let sim = Arc::new(sim);
    let (s1, s2, s3, s4, s5) = (sim.clone(), sim.clone(), sim.clone(), sim.clone(), sim);
    builder
        .register_typed(SUBMIT_ORDER, move |ctx, req: SubmitOrderRequest| {
            let sim = Arc::clone(&s1);
            async move { submit_order(&sim, ctx, req).await }
        })
        .register_typed(PROCESS_PAYMENT, move |ctx, req: PaymentRequest| {
            let sim = Arc::clone(&s2);
            async move { process_payment(&sim, ctx, req).await }
        })
        .register_typed(PREPARE_PIZZA, move |ctx, order_id: String| {
            let sim = Arc::clone(&s3);
            async move { prepare_pizza(&sim, ctx, order_id).await }
        })
        .register_typed(UPDATE_DELIVERY_STATUS, move |ctx, order_id: String| {
            let sim = Arc::clone(&s4);
            async move { update_delivery_status(&sim, ctx, order_id).await }
        })
        .register_typed(COMPLETE_ORDER, move |ctx, order_id: String| {
            let sim = Arc::clone(&s5);
            async move { complete_order(&sim, ctx, order_id).await }
        })
}
