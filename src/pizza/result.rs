//! Step results reported by the pizza-order activities.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DurableError;

/// Kind-specific payload of an [`OrderResult`]. The `resultType` field on the
/// wire selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultType", rename_all_fields = "camelCase")]
pub enum OrderResultKind {
    OrderSubmitted { message: String },
    PaymentProcessed { amount: f64 },
    PizzaPrepared { preparation_details: String },
    DeliveryUpdated { status: String },
    OrderCompleted { completion_message: String },
    OrderError { error_message: String },
    PaymentError { error_message: String, attempted_amount: f64 },
    PreparationError { error_message: String, failed_step: String },
    DeliveryError { error_message: String, current_location: String },
}

/// Result of one order step: which order, when, and what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: OrderResultKind,
}

impl OrderResult {
    pub fn new(order_id: impl Into<String>, timestamp: DateTime<Utc>, kind: OrderResultKind) -> Self {
        Self {
            order_id: order_id.into(),
            timestamp,
            kind,
        }
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn is_success(&self) -> bool {
        match self.kind {
            OrderResultKind::OrderSubmitted { .. }
            | OrderResultKind::PaymentProcessed { .. }
            | OrderResultKind::PizzaPrepared { .. }
            | OrderResultKind::DeliveryUpdated { .. }
            | OrderResultKind::OrderCompleted { .. } => true,
            OrderResultKind::OrderError { .. }
            | OrderResultKind::PaymentError { .. }
            | OrderResultKind::PreparationError { .. }
            | OrderResultKind::DeliveryError { .. } => false,
        }
    }

    /// Human-readable summary shown to the customer.
    pub fn message(&self) -> String {
        match &self.kind {
            OrderResultKind::OrderSubmitted { message } => message.clone(),
            OrderResultKind::PaymentProcessed { amount } => format!("Payment of ${amount:.2} processed successfully"),
            OrderResultKind::PizzaPrepared { preparation_details } => preparation_details.clone(),
            OrderResultKind::DeliveryUpdated { status } => status.clone(),
            OrderResultKind::OrderCompleted { completion_message } => completion_message.clone(),
            OrderResultKind::OrderError { error_message } => format!("Error: {error_message}"),
            OrderResultKind::PaymentError { error_message, .. } => format!("Payment Error: {error_message}"),
            OrderResultKind::PreparationError {
                error_message,
                failed_step,
            } => format!("Preparation Error: {error_message} at step {failed_step}"),
            OrderResultKind::DeliveryError {
                error_message,
                current_location,
            } => format!("Delivery Error: {error_message} at {current_location}"),
        }
    }

    /// # Errors
    ///
    /// `ResultDecoding` if the result cannot be serialized.
    pub fn to_json(&self) -> Result<String, DurableError> {
        serde_json::to_string(self).map_err(|e| DurableError::ResultDecoding(e.to_string()))
    }

    /// # Errors
    ///
    /// `ResultDecoding` for malformed JSON or a missing or unknown `resultType`.
    pub fn from_json(s: &str) -> Result<Self, DurableError> {
        serde_json::from_str(s).map_err(|e| DurableError::ResultDecoding(e.to_string()))
    }
}
