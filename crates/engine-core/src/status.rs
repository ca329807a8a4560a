//! Order status and its transition DAG.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an order.
///
/// ```text
/// pending ──► untouched ──► partially_filled ──► filled
///    │            │                 │
///    └────────────┴─────────────────┴──────────► cancelled
/// ```
///
/// `pending` may also jump straight to `partially_filled` or `filled`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Untouched,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }

    /// Whether `self -> next` is an edge of the status DAG.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Untouched | PartiallyFilled | Filled | Cancelled) => true,
            (Untouched, PartiallyFilled | Filled | Cancelled) => true,
            (PartiallyFilled, PartiallyFilled | Filled | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Untouched => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled => 3,
            OrderStatus::Cancelled => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OrderStatus::Pending),
            1 => Some(OrderStatus::Untouched),
            2 => Some(OrderStatus::PartiallyFilled),
            3 => Some(OrderStatus::Filled),
            4 => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Untouched => "untouched",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for next in [
            OrderStatus::Pending,
            OrderStatus::Untouched,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
        ] {
            assert!(!OrderStatus::Filled.can_transition_to(next));
            assert!(!OrderStatus::Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn untouched_cannot_go_back_to_pending() {
        assert!(!OrderStatus::Untouched.can_transition_to(OrderStatus::Pending));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Filled));
    }
}
