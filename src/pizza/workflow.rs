//! The `OrderOrchestrator` workflow.
//!
//! Submit, wait for the customer's confirmation, then pay, prepare, deliver and
//! complete. Each step is one activity under the workflow's retry policy; the
//! first step that ends in an error-kind result fails the order.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::activities::{PaymentRequest, SubmitOrderRequest};
use super::result::{OrderResult, OrderResultKind};
use super::{
    PizzaOrder, COMPLETE_ORDER, CONFIRMATION_EVENT, ORDER_ORCHESTRATION, PREPARE_PIZZA, PROCESS_PAYMENT,
    SUBMIT_ORDER, UPDATE_DELIVERY_STATUS,
};
use crate::runtime::{OrchestrationHandler, OrchestrationRegistryBuilder};
use crate::{durable_error, durable_info, durable_warn, OrchestrationContext, RetryPolicy};

/// Where an order is in its lifecycle, published as `{"stage": ...}` custom status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStage {
    Submitting,
    AwaitingConfirmation,
    Paying,
    Preparing,
    Delivering,
    Completing,
    Completed,
    Rejected,
    Failed,
}

impl OrderStage {
    /// Parse the stage out of an instance's custom status.
    pub fn from_custom_status(status: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct Stage {
            stage: OrderStage,
        }
        serde_json::from_str::<Stage>(status).ok().map(|s| s.stage)
    }
}

#[derive(Debug, Clone)]
pub struct PizzaWorkflowOptions {
    /// Policy applied to every step's activity.
    pub retry_policy: RetryPolicy,
}

impl Default for PizzaWorkflowOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::fixed(3, Duration::from_secs(5)),
        }
    }
}

impl PizzaWorkflowOptions {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Orchestration handler for pizza orders. The instance id is the order id.
pub struct PizzaOrderWorkflow {
    options: PizzaWorkflowOptions,
}

impl PizzaOrderWorkflow {
    pub fn new(options: PizzaWorkflowOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl OrchestrationHandler for PizzaOrderWorkflow {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        let result = run_order(&ctx, &input, &self.options.retry_policy).await;
        if let Err(error) = &result {
            publish_stage(&ctx, OrderStage::Failed);
            durable_error!(ctx, error = %error, "order failed");
        }
        result
    }

    fn validate_input(&self, input: &str) -> Result<(), String> {
        PizzaOrder::from_json(input).map(|_| ()).map_err(|e| e.to_string())
    }
}

/// Register `OrderOrchestrator` at the default version.
pub fn register_orchestrations(
    builder: OrchestrationRegistryBuilder,
    options: PizzaWorkflowOptions,
) -> OrchestrationRegistryBuilder {
    builder.register_handler(ORDER_ORCHESTRATION, Arc::new(PizzaOrderWorkflow::new(options)))
}

fn publish_stage(ctx: &OrchestrationContext, stage: OrderStage) {
    ctx.set_custom_status(json!({ "stage": stage }).to_string());
}

async fn run_order(ctx: &OrchestrationContext, input: &str, policy: &RetryPolicy) -> Result<String, String> {
    let order = PizzaOrder::from_json(input).map_err(|e| e.to_string())?;
    let steps = OrderSteps {
        ctx,
        policy,
        order_id: ctx.instance_id(),
        price: order.price(),
    };
    let order_id = steps.order_id.clone();
    durable_info!(
        ctx,
        orchestration = %ctx.orchestration_name(),
        version = %ctx.orchestration_version(),
        size = ?order.size,
        "order received"
    );

    let submit = SubmitOrderRequest {
        order_id: order_id.clone(),
        order,
    };
    let submitted = steps.run(OrderStage::Submitting, SUBMIT_ORDER, &submit).await?;
    durable_info!(ctx, step = SUBMIT_ORDER, "{}", submitted.message());

    publish_stage(ctx, OrderStage::AwaitingConfirmation);
    let payload = ctx.wait_for_external_event(CONFIRMATION_EVENT).into_event().await;
    match serde_json::from_str::<bool>(payload.trim()) {
        Ok(true) => durable_info!(ctx, "order confirmed"),
        Ok(false) => {
            publish_stage(ctx, OrderStage::Rejected);
            durable_info!(ctx, "order rejected");
            return Ok(format!("Order {order_id} was rejected by the user."));
        }
        Err(_) => return Err(format!("invalid {CONFIRMATION_EVENT} payload: {payload}")),
    }

    let payment = PaymentRequest {
        order_id: order_id.clone(),
        amount: steps.price,
    };
    let paid = steps.run(OrderStage::Paying, PROCESS_PAYMENT, &payment).await?;
    durable_info!(ctx, step = PROCESS_PAYMENT, "{}", paid.message());

    for (stage, activity) in [
        (OrderStage::Preparing, PREPARE_PIZZA),
        (OrderStage::Delivering, UPDATE_DELIVERY_STATUS),
    ] {
        let done = steps.run(stage, activity, &order_id).await?;
        durable_info!(ctx, step = activity, "{}", done.message());
    }

    let completed = steps.run(OrderStage::Completing, COMPLETE_ORDER, &order_id).await?;
    publish_stage(ctx, OrderStage::Completed);
    durable_info!(ctx, "order completed");
    Ok(completed.message())
}

struct OrderSteps<'a> {
    ctx: &'a OrchestrationContext,
    policy: &'a RetryPolicy,
    order_id: String,
    price: f64,
}

impl OrderSteps<'_> {
    /// Enter `stage` and run its activity. Anything but a success-kind result
    /// becomes the step's error message.
    async fn run<In: Serialize>(&self, stage: OrderStage, activity: &str, input: &In) -> Result<OrderResult, String> {
        publish_stage(self.ctx, stage);
        let payload = serde_json::to_string(input).map_err(|e| format!("encode {activity} input: {e}"))?;
        match self
            .ctx
            .schedule_activity_with_retry(activity, payload, self.policy.clone())
            .into_activity()
            .await
        {
            Ok(raw) => {
                let result = OrderResult::from_json(&raw).map_err(|e| e.to_string())?;
                if result.is_success() {
                    return Ok(result);
                }
                Err(self.step_failed(activity, result))
            }
            Err(err) => {
                let message = err.message();
                let result = match OrderResult::from_json(&message) {
                    Ok(result) if !result.is_success() => result,
                    _ => self.failure(stage, message),
                };
                Err(self.step_failed(activity, result))
            }
        }
    }

    fn step_failed(&self, activity: &str, result: OrderResult) -> String {
        let message = result.message();
        durable_warn!(self.ctx, step = activity, error = %message, "order step failed");
        message
    }

    /// Wrap an unstructured activity failure in the error kind of `stage`.
    fn failure(&self, stage: OrderStage, error_message: String) -> OrderResult {
        let kind = match stage {
            OrderStage::Paying => OrderResultKind::PaymentError {
                error_message,
                attempted_amount: self.price,
            },
            OrderStage::Preparing => OrderResultKind::PreparationError {
                error_message,
                failed_step: "Unknown".into(),
            },
            OrderStage::Delivering => OrderResultKind::DeliveryError {
                error_message,
                current_location: "Unknown".into(),
            },
            _ => OrderResultKind::OrderError { error_message },
        };
        OrderResult::new(self.order_id.clone(), self.ctx.utc_now(), kind)
    }
}
