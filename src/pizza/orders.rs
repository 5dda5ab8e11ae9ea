//! Read-side views over `OrderOrchestrator` instances.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{OrderStage, PizzaOrder, ORDER_ORCHESTRATION};
use crate::client::InstanceStatusView;
use crate::{Client, DurableError, InstanceStatus};

/// Lifecycle of an order as shown to customers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderProgress {
    Processing,
    Completed,
    Failed,
    Terminated,
}

impl From<InstanceStatus> for OrderProgress {
    fn from(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::Running => OrderProgress::Processing,
            InstanceStatus::Completed => OrderProgress::Completed,
            InstanceStatus::Failed => OrderProgress::Failed,
            InstanceStatus::Terminated => OrderProgress::Terminated,
        }
    }
}

/// One order: its decoded input plus where its instance stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub order_id: String,
    pub status: OrderProgress,
    pub stage: Option<OrderStage>,
    pub order: PizzaOrder,
    pub output: Option<String>,
    pub created_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
}

impl TryFrom<InstanceStatusView> for OrderView {
    type Error = DurableError;

    fn try_from(view: InstanceStatusView) -> Result<Self, Self::Error> {
        let order = PizzaOrder::from_json(&view.input)
            .map_err(|e| DurableError::ResultDecoding(format!("order {}: {e}", view.instance_id)))?;
        Ok(Self {
            stage: view.custom_status.as_deref().and_then(OrderStage::from_custom_status),
            status: view.status.into(),
            order,
            output: view.output,
            created_time: view.created_time,
            last_updated_time: view.last_updated_time,
            order_id: view.instance_id,
        })
    }
}

/// Status of a single order.
///
/// # Errors
///
/// `InstanceNotFound` if `order_id` is unknown or belongs to another
/// orchestration, `ResultDecoding` if the stored input is not a valid order.
pub async fn order_status(client: &Client, order_id: &str) -> Result<OrderView, DurableError> {
    let view = client.get_status(order_id).await?;
    if view.name != ORDER_ORCHESTRATION {
        return Err(DurableError::InstanceNotFound(order_id.to_string()));
    }
    OrderView::try_from(view)
}

/// Orders still in progress, newest first, at most `page_size` of them.
///
/// # Errors
///
/// `InvalidInput` for a page size outside `1..=MAX_PAGE_SIZE`, `ResultDecoding`
/// if a running instance carries an invalid order.
pub async fn pending_orders(client: &Client, page_size: usize) -> Result<Vec<OrderView>, DurableError> {
    let page = client
        .list_orchestration_instances(ORDER_ORCHESTRATION, Some(InstanceStatus::Running), page_size, None)
        .await?;
    let orders = page
        .instances
        .into_iter()
        .map(OrderView::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    debug!(count = orders.len(), "listed pending orders");
    Ok(orders)
}
