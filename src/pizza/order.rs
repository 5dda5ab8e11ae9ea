use serde::{Deserialize, Serialize};

use crate::DurableError;

const MAX_TOPPINGS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PizzaSize {
    Small,
    Medium,
    Large,
}

impl PizzaSize {
    pub fn price(self) -> f64 {
        match self {
            PizzaSize::Small => 11.99,
            PizzaSize::Medium => 15.99,
            PizzaSize::Large => 19.99,
        }
    }
}

/// Workflow input for `OrderOrchestrator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PizzaOrder {
    pub size: PizzaSize,
    #[serde(default)]
    pub toppings: Vec<String>,
    pub address: String,
    pub phone: String,
}

impl PizzaOrder {
    /// Parse and validate a JSON order.
    ///
    /// # Errors
    ///
    /// `InvalidInput` describing the first problem found.
    pub fn from_json(s: &str) -> Result<Self, DurableError> {
        let order: PizzaOrder = serde_json::from_str(s).map_err(|e| DurableError::InvalidInput(e.to_string()))?;
        order.validate()?;
        Ok(order)
    }

    /// # Errors
    ///
    /// `InvalidInput` if a field is out of range.
    pub fn validate(&self) -> Result<(), DurableError> {
        let invalid = |msg: String| Err(DurableError::InvalidInput(msg));
        if self.toppings.len() > MAX_TOPPINGS {
            return invalid(format!(
                "at most {MAX_TOPPINGS} toppings allowed, got {}",
                self.toppings.len()
            ));
        }
        if self.toppings.iter().any(|t| t.trim().is_empty()) {
            return invalid("toppings must not be blank".into());
        }
        if self.address.trim().is_empty() {
            return invalid("address must not be empty".into());
        }
        if !self.phone.chars().all(|c| c.is_ascii_digit() || "+-() ".contains(c)) {
            return invalid(format!("phone contains invalid characters: {}", self.phone));
        }
        let digits = self.phone.chars().filter(char::is_ascii_digit).count();
        if !(7..=15).contains(&digits) {
            return invalid(format!("phone must have 7 to 15 digits, got {digits}"));
        }
        Ok(())
    }

    pub fn price(&self) -> f64 {
        self.size.price()
    }

    pub fn to_json(&self) -> String {
        // Plain strings and an enum; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_json(extra: &str) -> String {
        format!(r#"{{"size":"large","toppings":["cheese","pepperoni"],"address":"1 Main St","phone":"+1 (555) 010-9999"{extra}}}"#)
    }

    #[test]
    fn valid_order_parses() {
        let order = PizzaOrder::from_json(&order_json("")).unwrap();
        assert_eq!(order.size, PizzaSize::Large);
        assert_eq!(order.price(), 19.99);
        assert_eq!(order.toppings.len(), 2);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = PizzaOrder::from_json(&order_json(r#","coupon":"FREE""#)).unwrap_err();
        assert!(matches!(err, DurableError::InvalidInput(ref m) if m.contains("coupon")), "{err}");
    }

    #[test]
    fn field_rules_are_enforced() {
        let base = PizzaOrder::from_json(&order_json("")).unwrap();

        let mut o = base.clone();
        o.toppings = vec!["x".into(); 11];
        assert!(o.validate().is_err());

        let mut o = base.clone();
        o.toppings = vec!["  ".into()];
        assert!(o.validate().is_err());

        let mut o = base.clone();
        o.address = " ".into();
        assert!(o.validate().is_err());

        let mut o = base.clone();
        o.phone = "12345".into();
        assert!(o.validate().is_err());

        let mut o = base;
        o.phone = "555-CALL-NOW".into();
        assert!(o.validate().is_err());
    }

    #[test]
    fn unknown_size_is_rejected() {
        let s = r#"{"size":"huge","toppings":[],"address":"a","phone":"5550100"}"#;
        assert!(PizzaOrder::from_json(s).is_err());
    }
}
